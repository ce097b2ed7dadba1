//! Server-wide statistics as independent flat row sets.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::probe::{CapabilityProbe, HELPER_SCHEMA};
use super::queries;
use super::{CollectError, QueryExecutor};
use crate::db::{Connection, Row, Value};

/// Backend columns that identify a client or expose literal values.
const BACKEND_PII_COLUMNS: &[&str] = &["client_addr", "client_hostname", "client_port", "query"];

/// One independently toggleable server statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServerStat {
    Settings,
    Bgwriter,
    Database,
    Locks,
    Backends,
    Replication,
    ReplicationConflicts,
    Functions,
}

impl ServerStat {
    pub const ALL: [ServerStat; 8] = [
        ServerStat::Settings,
        ServerStat::Bgwriter,
        ServerStat::Database,
        ServerStat::Locks,
        ServerStat::Backends,
        ServerStat::Replication,
        ServerStat::ReplicationConflicts,
        ServerStat::Functions,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ServerStat::Settings => "settings",
            ServerStat::Bgwriter => "bgwriter",
            ServerStat::Database => "database",
            ServerStat::Locks => "locks",
            ServerStat::Backends => "backends",
            ServerStat::Replication => "replication",
            ServerStat::ReplicationConflicts => "replication_conflicts",
            ServerStat::Functions => "functions",
        }
    }
}

impl fmt::Display for ServerStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown server statistic '{0}'")]
pub struct ParseServerStatError(pub String);

impl FromStr for ServerStat {
    type Err = ParseServerStatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ServerStat::ALL
            .into_iter()
            .find(|stat| stat.name() == wanted)
            .ok_or_else(|| ParseServerStatError(s.to_string()))
    }
}

/// Collected server statistics. A disabled statistic stays `None` and is
/// left out of the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bgwriter: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backends: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_conflicts: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<Row>>,
}

impl ServerStats {
    fn slot(&mut self, stat: ServerStat) -> &mut Option<Vec<Row>> {
        match stat {
            ServerStat::Settings => &mut self.settings,
            ServerStat::Bgwriter => &mut self.bgwriter,
            ServerStat::Database => &mut self.database,
            ServerStat::Locks => &mut self.locks,
            ServerStat::Backends => &mut self.backends,
            ServerStat::Replication => &mut self.replication,
            ServerStat::ReplicationConflicts => &mut self.replication_conflicts,
            ServerStat::Functions => &mut self.functions,
        }
    }
}

pub struct ServerStatsCollector<'a> {
    probe: &'a CapabilityProbe,
    query_parameters: bool,
}

impl<'a> ServerStatsCollector<'a> {
    pub fn new(probe: &'a CapabilityProbe, query_parameters: bool) -> Self {
        Self {
            probe,
            query_parameters,
        }
    }

    /// Runs the accessor of every enabled statistic.
    pub fn collect<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
        enabled: impl Fn(ServerStat) -> bool,
    ) -> Result<ServerStats, CollectError> {
        let mut stats = ServerStats::default();
        for stat in ServerStat::ALL {
            if !enabled(stat) {
                debug!(stat = %stat, "skipped");
                continue;
            }
            let rows = self.fetch(exec, stat)?;
            debug!(stat = %stat, rows = rows.len(), "collected");
            *stats.slot(stat) = Some(rows);
        }
        Ok(stats)
    }

    pub fn fetch<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
        stat: ServerStat,
    ) -> Result<Vec<Row>, CollectError> {
        match stat {
            ServerStat::Settings => self.settings(exec),
            ServerStat::Bgwriter => self.bgwriter(exec),
            ServerStat::Database => self.database(exec),
            ServerStat::Locks => self.locks(exec),
            ServerStat::Backends => self.backends(exec),
            ServerStat::Replication => self.replication(exec),
            ServerStat::ReplicationConflicts => self.replication_conflicts(exec),
            ServerStat::Functions => self.functions(exec),
        }
    }

    /// Every setting as `current_value` / `boot_value` / `reset_value`.
    pub fn settings<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Vec<Row>, CollectError> {
        exec.query(queries::settings())
    }

    pub fn bgwriter<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Vec<Row>, CollectError> {
        exec.query(queries::bgwriter(self.probe.server_version_num()))
    }

    pub fn database<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Vec<Row>, CollectError> {
        exec.query(queries::database_stats())
    }

    /// Locks held or awaited by other backends on the current database.
    ///
    /// Cluster-wide locks (no database) are kept.
    pub fn locks<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Vec<Row>, CollectError> {
        let current = self.probe.info().database.as_str();
        let rows = exec.query(queries::locks())?;
        Ok(rows
            .into_iter()
            .filter(|row| match row.get("database") {
                None | Some(Value::Null) => true,
                Some(db) => db.as_str() == Some(current),
            })
            .collect())
    }

    /// Sessions on the current database, redacted unless query parameters
    /// are collected.
    pub fn backends<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Vec<Row>, CollectError> {
        let helper = self.has_helper(exec, "get_stat_activity")?;
        let mut rows = exec.query(&queries::backends(self.probe.server_version_num(), helper))?;
        if !self.query_parameters {
            rows.iter_mut().for_each(redact_backend);
        }
        Ok(rows)
    }

    pub fn replication<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Vec<Row>, CollectError> {
        let helper = self.has_helper(exec, "get_stat_replication")?;
        exec.query(&queries::replication(self.probe.server_version_num(), helper))
    }

    pub fn replication_conflicts<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Vec<Row>, CollectError> {
        exec.query(queries::replication_conflicts())
    }

    /// User-defined functions with call statistics where tracked.
    pub fn functions<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Vec<Row>, CollectError> {
        exec.query(&queries::functions(self.probe.server_version_num()))
    }

    /// Superusers read the views directly; others need the helper.
    fn has_helper<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
        name: &str,
    ) -> Result<bool, CollectError> {
        if self.probe.info().is_superuser {
            return Ok(false);
        }
        self.probe.has_helper_function(exec, HELPER_SCHEMA, name)
    }
}

/// Nulls client identity and query text of a backend row.
pub fn redact_backend(row: &mut Row) {
    for column in BACKEND_PII_COLUMNS {
        if row.contains(column) {
            row.insert(*column, Value::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ServerInfo;
    use crate::db::MockConnection;
    use crate::row;

    fn probe(superuser: bool) -> CapabilityProbe {
        CapabilityProbe::new(ServerInfo {
            version_num: 90600,
            version: "PostgreSQL 9.6.3".into(),
            database: "app".into(),
            user: "monitor".into(),
            is_superuser: superuser,
        })
    }

    fn backend_row() -> Row {
        row! {
            "pid" => 4242,
            "database" => "app",
            "client_addr" => "10.0.0.7",
            "client_hostname" => "worker-1",
            "client_port" => 51234,
            "state" => "active",
            "query" => "SELECT * FROM users WHERE email = 'a@b.c'",
        }
    }

    #[test]
    fn parses_stat_names() {
        assert_eq!("locks".parse::<ServerStat>(), Ok(ServerStat::Locks));
        assert_eq!(
            " Replication_Conflicts ".parse::<ServerStat>(),
            Ok(ServerStat::ReplicationConflicts)
        );
        assert!("vacuum".parse::<ServerStat>().is_err());
    }

    #[test]
    fn disabled_stats_are_not_queried() {
        let mut exec = QueryExecutor::new(MockConnection::new());
        let probe = probe(true);
        let collector = ServerStatsCollector::new(&probe, true);

        let stats = collector
            .collect(&mut exec, |s| s != ServerStat::Locks)
            .unwrap();
        assert!(stats.locks.is_none());
        assert!(stats.settings.is_some());
        assert_eq!(exec.connection().count("pg_locks"), 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("locks").is_none());
        assert!(json.get("bgwriter").is_some());
    }

    #[test]
    fn locks_of_other_databases_are_dropped() {
        let conn = MockConnection::new().on(
            "pg_locks",
            vec![
                row! { "database" => "app", "pid" => 1 },
                row! { "database" => "other", "pid" => 2 },
                row! { "database" => Value::Null, "pid" => 3 },
            ],
        );
        let mut exec = QueryExecutor::new(conn);
        let probe = probe(true);

        let locks = ServerStatsCollector::new(&probe, true)
            .locks(&mut exec)
            .unwrap();
        let pids: Vec<_> = locks.iter().map(|r| r.get_i64("pid").unwrap()).collect();
        assert_eq!(pids, vec![1, 3]);
    }

    #[test]
    fn backends_are_redacted_without_query_parameters() {
        let conn = MockConnection::new().on("pg_stat_activity", vec![backend_row()]);
        let mut exec = QueryExecutor::new(conn);
        let probe = probe(true);

        let rows = ServerStatsCollector::new(&probe, false)
            .backends(&mut exec)
            .unwrap();
        for column in BACKEND_PII_COLUMNS {
            assert_eq!(rows[0].get(column), Some(&Value::Null), "{column}");
        }
        assert_eq!(rows[0].get_str("state"), Some("active"));
    }

    #[test]
    fn helper_backends_are_redacted_too() {
        let conn = MockConnection::new()
            .on("proname = 'get_stat_activity'", vec![row! { "found" => 1 }])
            .on("FROM pganalyze.get_stat_activity()", vec![backend_row()]);
        let mut exec = QueryExecutor::new(conn);
        let probe = probe(false);

        let rows = ServerStatsCollector::new(&probe, false)
            .backends(&mut exec)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("query"), Some(&Value::Null));
        assert_eq!(rows[0].get("client_addr"), Some(&Value::Null));
    }

    #[test]
    fn backends_keep_query_with_query_parameters() {
        let conn = MockConnection::new().on("pg_stat_activity", vec![backend_row()]);
        let mut exec = QueryExecutor::new(conn);
        let probe = probe(true);

        let rows = ServerStatsCollector::new(&probe, true)
            .backends(&mut exec)
            .unwrap();
        assert_eq!(rows[0].get_str("client_addr"), Some("10.0.0.7"));
        assert!(rows[0].get_str("query").is_some());
    }
}
