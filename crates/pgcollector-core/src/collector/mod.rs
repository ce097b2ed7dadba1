//! PostgreSQL statistics collection.
//!
//! One collection run uses a single session and proceeds sequentially:
//! - [`CapabilityProbe`] reads server identity once and answers questions
//!   about optional extensions and helper functions;
//! - [`QuerySourceSelector`] picks `pg_stat_plans` or `pg_stat_statements`
//!   and normalizes their rows into [`QueryStatRecord`]s;
//! - [`SchemaCollector`] merges relations, columns, indexes, constraints and
//!   view definitions into one document per relation;
//! - [`ServerStatsCollector`] reads server-wide statistics as flat row sets.
//!
//! Every statement goes through the [`QueryExecutor`], which prefixes the
//! query marker and applies the per-call failure policy.

mod executor;
mod plans;
mod probe;
pub mod queries;
mod schema;
mod server;
mod source;
mod statements;

pub use executor::{OnFailure, QueryExecutor};
pub use probe::{CapabilityProbe, MIN_SERVER_VERSION, ServerInfo};
pub use schema::{
    RelationKey, RelationKind, SchemaCollector, SchemaDocument, SchemaOptions, SchemaPasses,
    TableStats, merge_schema, parse_int2vector,
};
pub use server::{ParseServerStatError, ServerStat, ServerStats, ServerStatsCollector};
pub use source::{PlanRecord, QuerySource, QuerySourceSelector, QueryStatRecord, reset_stats};

use thiserror::Error;

use crate::db::DbError;

/// Errors raised while collecting statistics.
#[derive(Debug, Error)]
pub enum CollectError {
    /// A statement run with [`OnFailure::Propagate`] failed. Callers handle it.
    #[error("{0}")]
    Query(DbError),

    /// A statement run with [`OnFailure::Abort`] failed. Ends the run.
    #[error("query failed: {0}")]
    Aborted(DbError),

    #[error(
        "server version {version_num} is not supported, at least {} is required",
        MIN_SERVER_VERSION
    )]
    ServerTooOld { version_num: i64 },

    #[error("role {user} is not a superuser and the pganalyze helper functions are missing")]
    InsufficientPrivilege { user: String },

    #[error(
        "couldn't find either pg_stat_plans or pg_stat_statements, \
         and pg_stat_statements could not be created"
    )]
    NoQuerySource,

    #[error("unexpected result from {query}: {reason}")]
    UnexpectedResult { query: &'static str, reason: String },
}
