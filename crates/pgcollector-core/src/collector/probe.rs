//! Server identity and optional capability checks.

use tracing::{debug, info};

use super::queries;
use super::{CollectError, QueryExecutor};
use crate::db::Connection;

/// Oldest supported server (9.1).
pub const MIN_SERVER_VERSION: i64 = 90100;

/// Schema holding the helper functions that expose privileged views to a
/// non-superuser monitoring role.
pub const HELPER_SCHEMA: &str = "pganalyze";

const SERVER_INFO_QUERY: &str = "server identity";

/// Facts about the server captured once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    /// `server_version_num`, e.g. `90604` or `160002`.
    pub version_num: i64,
    /// Full `version()` string.
    pub version: String,
    pub database: String,
    pub user: String,
    pub is_superuser: bool,
}

/// Answers capability questions about the connected server.
///
/// The server version is fetched once in [`CapabilityProbe::fetch`] and then
/// cached; extension and helper function lookups are plain catalog queries
/// where an empty result means "not available".
#[derive(Debug, Clone)]
pub struct CapabilityProbe {
    info: ServerInfo,
}

impl CapabilityProbe {
    pub fn new(info: ServerInfo) -> Self {
        Self { info }
    }

    /// Reads the server identity.
    pub fn fetch<C: Connection>(exec: &mut QueryExecutor<C>) -> Result<Self, CollectError> {
        let mut rows = exec.query(queries::server_info())?;
        let mut row = rows.pop().ok_or(CollectError::UnexpectedResult {
            query: SERVER_INFO_QUERY,
            reason: "no rows".to_string(),
        })?;

        let missing = |column: &str| CollectError::UnexpectedResult {
            query: SERVER_INFO_QUERY,
            reason: format!("missing {}", column),
        };
        let info = ServerInfo {
            version_num: row
                .take_i64("server_version_num")
                .ok_or_else(|| missing("server_version_num"))?,
            version: row.take_string("version").ok_or_else(|| missing("version"))?,
            database: row.take_string("database").ok_or_else(|| missing("database"))?,
            user: row.take_string("username").ok_or_else(|| missing("username"))?,
            is_superuser: row.get_bool("is_superuser").unwrap_or(false),
        };
        debug!(
            version_num = info.version_num,
            database = %info.database,
            user = %info.user,
            superuser = info.is_superuser,
            "connected"
        );
        Ok(Self { info })
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn server_version_num(&self) -> i64 {
        self.info.version_num
    }

    pub fn has_extension<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
        name: &str,
    ) -> Result<bool, CollectError> {
        let rows = exec.query(&queries::extension_exists(name))?;
        Ok(!rows.is_empty())
    }

    pub fn has_helper_function<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
        schema: &str,
        name: &str,
    ) -> Result<bool, CollectError> {
        let rows = exec.query(&queries::function_exists(schema, name))?;
        let found = !rows.is_empty();
        debug!(
            function = %format!("{}.{}", schema, name),
            found,
            "helper function lookup"
        );
        Ok(found)
    }

    /// The server's data directory, or `None` when the role may not read it.
    pub fn data_directory<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<Option<String>, CollectError> {
        match exec.try_query(queries::data_directory()) {
            Ok(mut rows) => Ok(rows.first_mut().and_then(|r| r.take_string("data_directory"))),
            Err(CollectError::Query(e)) => {
                debug!(error = %e, "data directory not readable, skipping storage");
                exec.rollback()?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Refuses to collect from servers that are too old or a role that cannot
    /// see other sessions' statistics.
    ///
    /// Managed hosts never grant superuser, so the privilege check is skipped
    /// there.
    pub fn check<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
        managed_host: bool,
    ) -> Result<(), CollectError> {
        if self.info.version_num < MIN_SERVER_VERSION {
            return Err(CollectError::ServerTooOld {
                version_num: self.info.version_num,
            });
        }

        if self.info.is_superuser || managed_host {
            return Ok(());
        }
        if self.has_helper_function(exec, HELPER_SCHEMA, "get_stat_activity")? {
            info!(
                "Role {} is not a superuser, using {}.get_stat_activity()",
                self.info.user, HELPER_SCHEMA
            );
            return Ok(());
        }
        Err(CollectError::InsufficientPrivilege {
            user: self.info.user.clone(),
        })
    }
}
