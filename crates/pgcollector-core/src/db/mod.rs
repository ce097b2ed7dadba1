//! Database boundary.
//!
//! Collectors never talk to the driver directly: they go through a
//! [`Connection`], which executes one SQL statement and returns typed
//! [`Row`]s. [`PgConnection`] is the production implementation on top of the
//! synchronous `postgres` client; [`MockConnection`] replays scripted results
//! in tests.
//!
//! ```text
//!   SchemaCollector   ServerStatsCollector   QuerySourceSelector
//!          └──────────────────┼────────────────────┘
//!                      QueryExecutor  (marker, failure policy, transaction)
//!                             │
//!                       Connection (trait)
//!                     ┌───────┴────────┐
//!               PgConnection     MockConnection
//! ```

pub mod mock;
mod pg;
mod row;

pub use mock::MockConnection;
pub use pg::PgConnection;
pub use row::{Row, Value};

use thiserror::Error;

/// Errors raised at the driver boundary.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// Could not establish the session.
    #[error("failed to connect to database: {0}")]
    Connect(String),
    /// The server rejected a statement. The message may span several lines
    /// (primary message, detail, hint).
    #[error("{0}")]
    Query(String),
}

/// A single database session able to run SQL text.
///
/// Statements run one at a time; there is no concurrency per connection.
/// Statements without a result description (`SET`, `BEGIN`, DDL) yield an
/// empty row list.
pub trait Connection {
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError>;
}

impl<C: Connection + ?Sized> Connection for &mut C {
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        (**self).query(sql)
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        (**self).query(sql)
    }
}
