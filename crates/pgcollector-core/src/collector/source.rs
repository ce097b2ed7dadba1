//! Query statistics sources and their common record shape.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::probe::CapabilityProbe;
use super::queries;
use super::{CollectError, OnFailure, QueryExecutor, plans, statements};
use crate::db::{Connection, Row};

/// An extension providing per-query statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    /// Per-plan counters with EXPLAIN support.
    PgStatPlans,
    /// Per-query aggregates only.
    PgStatStatements,
}

impl QuerySource {
    /// Sources in order of preference.
    pub const PRIORITY: [QuerySource; 2] = [QuerySource::PgStatPlans, QuerySource::PgStatStatements];

    /// Extension name, also reported as `query_source`.
    pub fn name(self) -> &'static str {
        match self {
            QuerySource::PgStatPlans => "pg_stat_plans",
            QuerySource::PgStatStatements => "pg_stat_statements",
        }
    }

    pub fn reset_sql(self) -> &'static str {
        match self {
            QuerySource::PgStatPlans => queries::RESET_STAT_PLANS,
            QuerySource::PgStatStatements => queries::RESET_STAT_STATEMENTS,
        }
    }
}

impl fmt::Display for QuerySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Statistics for one normalized query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStatRecord {
    pub normalized_query: String,
    /// Aggregate counters: calls, rows, timing, block I/O.
    #[serde(flatten)]
    pub stats: Row,
    /// Empty for sources without per-plan data.
    pub plans: Vec<PlanRecord>,
}

/// One execution plan of a normalized query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanRecord {
    /// Example query text with literals. `None` when redacted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(flatten)]
    pub stats: Row,
    /// EXPLAIN output, JSON encoded as text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain_error: Option<String>,
}

impl PlanRecord {
    /// Builds a plan from its unprefixed columns, dropping the example query
    /// unless `query_parameters` is set.
    pub fn from_row(mut row: Row, query_parameters: bool) -> Self {
        let query = row.take_string("query");
        Self {
            query: if query_parameters { query } else { None },
            stats: row,
            explain: None,
            explain_error: None,
        }
    }

    pub fn is_explainable(&self) -> bool {
        self.stats.get_bool("query_explainable").unwrap_or(false)
    }
}

/// Folds source rows into records keyed by normalized query text.
///
/// The first row seen for a text supplies the aggregate counters; every plan
/// row is appended to that record in arrival order.
#[derive(Debug, Default)]
pub(super) struct RecordMerge {
    records: Vec<QueryStatRecord>,
    by_text: HashMap<String, usize>,
}

impl RecordMerge {
    pub(super) fn push(&mut self, normalized_query: String, aggregates: Row, plan: PlanRecord) {
        let idx = self.record(normalized_query, aggregates);
        self.records[idx].plans.push(plan);
    }

    /// Adds a text without plan data. Later rows for a known text are ignored.
    pub(super) fn push_aggregates(&mut self, normalized_query: String, aggregates: Row) {
        self.record(normalized_query, aggregates);
    }

    fn record(&mut self, normalized_query: String, aggregates: Row) -> usize {
        match self.by_text.get(&normalized_query) {
            Some(&idx) => idx,
            None => {
                self.records.push(QueryStatRecord {
                    normalized_query: normalized_query.clone(),
                    stats: aggregates,
                    plans: Vec::new(),
                });
                self.by_text.insert(normalized_query, self.records.len() - 1);
                self.records.len() - 1
            }
        }
    }

    pub(super) fn into_records(self) -> Vec<QueryStatRecord> {
        self.records
    }
}

/// Chooses the richest available statistics source and reads it.
pub struct QuerySourceSelector<'a> {
    probe: &'a CapabilityProbe,
    query_parameters: bool,
}

impl<'a> QuerySourceSelector<'a> {
    pub fn new(probe: &'a CapabilityProbe, query_parameters: bool) -> Self {
        Self {
            probe,
            query_parameters,
        }
    }

    /// First installed source in priority order.
    pub fn detect<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Option<QuerySource>, CollectError> {
        for source in QuerySource::PRIORITY {
            if self.probe.has_extension(exec, source.name())? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    /// Picks a source and reads its records.
    ///
    /// With no source installed, tries once to create `pg_stat_statements`
    /// before giving up with [`CollectError::NoQuerySource`].
    pub fn select<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<(QuerySource, Vec<QueryStatRecord>), CollectError> {
        let source = match self.detect(exec)? {
            Some(source) => source,
            None => {
                self.provision(exec)?;
                self.detect(exec)?.ok_or(CollectError::NoQuerySource)?
            }
        };

        debug!(source = %source, "using query source");
        let records = match source {
            QuerySource::PgStatPlans => plans::fetch(exec, self.query_parameters)?,
            QuerySource::PgStatStatements => {
                statements::fetch(exec, self.probe.server_version_num())?
            }
        };
        debug!(source = %source, records = records.len(), "query statistics collected");
        Ok((source, records))
    }

    fn provision<C: Connection>(&self, exec: &mut QueryExecutor<C>) -> Result<(), CollectError> {
        info!("Neither pg_stat_plans nor pg_stat_statements found, trying to create pg_stat_statements");
        match exec.execute(queries::CREATE_STAT_STATEMENTS, OnFailure::Propagate, true) {
            Ok(_) => Ok(()),
            Err(CollectError::Query(e)) => {
                warn!(error = %e, "could not create pg_stat_statements");
                exec.rollback()
            }
            Err(e) => Err(e),
        }
    }
}

/// Clears the counters of `source`. Committed immediately.
pub fn reset_stats<C: Connection>(
    exec: &mut QueryExecutor<C>,
    source: QuerySource,
) -> Result<(), CollectError> {
    debug!(source = %source, "resetting query statistics");
    exec.execute(source.reset_sql(), OnFailure::Abort, true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ServerInfo;
    use crate::db::MockConnection;
    use crate::row;

    fn probe() -> CapabilityProbe {
        CapabilityProbe::new(ServerInfo {
            version_num: 90400,
            version: "PostgreSQL 9.4.1".into(),
            database: "app".into(),
            user: "postgres".into(),
            is_superuser: true,
        })
    }

    fn found() -> Vec<Row> {
        vec![row! { "found" => 1 }]
    }

    #[test]
    fn merge_keeps_first_aggregates_and_all_plans() {
        let mut merge = RecordMerge::default();
        let plan = |id: i64| PlanRecord {
            stats: row! { "planid" => id },
            ..Default::default()
        };

        merge.push("SELECT ?".into(), row! { "calls" => 10 }, plan(1));
        merge.push("UPDATE t".into(), row! { "calls" => 1 }, plan(2));
        merge.push("SELECT ?".into(), row! { "calls" => 99 }, plan(3));

        let records = merge.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stats.get_i64("calls"), Some(10));
        let ids: Vec<_> = records[0]
            .plans
            .iter()
            .map(|p| p.stats.get_i64("planid").unwrap())
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn plan_query_is_dropped_without_query_parameters() {
        let row = row! { "query" => "SELECT 1", "planid" => 5 };
        let redacted = PlanRecord::from_row(row.clone(), false);
        assert_eq!(redacted.query, None);
        assert!(!redacted.stats.contains("query"));

        let kept = PlanRecord::from_row(row, true);
        assert_eq!(kept.query.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn plan_record_serializes_flat() {
        let plan = PlanRecord {
            query: None,
            stats: row! { "planid" => 5, "calls" => 2 },
            explain: Some("[]".into()),
            explain_error: None,
        };
        let json = serde_json::to_string(&plan).unwrap();
        assert_eq!(json, r#"{"planid":5,"calls":2,"explain":"[]"}"#);
    }

    #[test]
    fn prefers_pg_stat_plans() {
        let conn = MockConnection::new()
            .on("extname = 'pg_stat_plans'", found())
            .on("extname = 'pg_stat_statements'", found());
        let mut exec = QueryExecutor::new(conn);
        let probe = probe();
        let selector = QuerySourceSelector::new(&probe, true);

        assert_eq!(
            selector.detect(&mut exec).unwrap(),
            Some(QuerySource::PgStatPlans)
        );
    }

    #[test]
    fn provisions_pg_stat_statements_and_retries() {
        let conn = MockConnection::new()
            .on_sequence(
                "extname = 'pg_stat_statements'",
                vec![
                    crate::db::mock::MockResponse::Rows(vec![]),
                    crate::db::mock::MockResponse::Rows(found()),
                ],
            )
            .on(
                "FROM pg_stat_statements",
                vec![row! { "normalized_query" => "SELECT ?", "calls" => 3 }],
            );
        let mut exec = QueryExecutor::new(conn);
        let probe = probe();

        let (source, records) = QuerySourceSelector::new(&probe, true)
            .select(&mut exec)
            .unwrap();
        assert_eq!(source, QuerySource::PgStatStatements);
        assert_eq!(records.len(), 1);
        assert!(records[0].plans.is_empty());
        assert_eq!(exec.connection().count("CREATE EXTENSION IF NOT EXISTS"), 1);
        assert_eq!(exec.connection().count("COMMIT"), 1);
    }

    #[test]
    fn fails_when_provisioning_fails() {
        let conn = MockConnection::new().fail_on(
            "CREATE EXTENSION",
            "ERROR: could not open extension control file",
        );
        let mut exec = QueryExecutor::new(conn);
        let probe = probe();

        let err = QuerySourceSelector::new(&probe, true)
            .select(&mut exec)
            .unwrap_err();
        assert!(matches!(err, CollectError::NoQuerySource));
        // The failed DDL was rolled back before the second lookup.
        assert_eq!(exec.connection().count("ROLLBACK"), 1);
        assert!(!exec.connection().is_aborted());
    }

    #[test]
    fn reset_commits() {
        let mut exec = QueryExecutor::new(MockConnection::new());
        reset_stats(&mut exec, QuerySource::PgStatStatements).unwrap();
        assert_eq!(exec.connection().count("pg_stat_statements_reset()"), 1);
        assert_eq!(exec.connection().count("COMMIT"), 1);
    }

    #[test]
    fn source_names() {
        assert_eq!(QuerySource::PgStatPlans.to_string(), "pg_stat_plans");
        assert_eq!(
            serde_json::to_string(&QuerySource::PgStatStatements).unwrap(),
            r#""pg_stat_statements""#
        );
    }
}
