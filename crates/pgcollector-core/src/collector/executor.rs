//! Marked statement execution with a per-call failure policy.

use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::CollectError;
use crate::db::{Connection, DbError, Row};

/// What to do when a statement fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Log the error in full and end the run. The returned
    /// [`CollectError::Aborted`] must never be handled by a collector.
    Abort,
    /// Hand the error to the caller; the failure is expected and recoverable.
    Propagate,
}

/// Runs collector statements on a single session.
///
/// Every statement is prefixed with the query marker so the statistics
/// sources can exclude the collector's own traffic. Statements run inside a
/// session transaction that is opened lazily and ended by `commit` or
/// [`rollback`](Self::rollback); a failed statement leaves that transaction
/// aborted until it is rolled back.
pub struct QueryExecutor<C> {
    conn: C,
    marker: String,
    in_transaction: bool,
    last_elapsed: Option<Duration>,
}

impl<C: Connection> QueryExecutor<C> {
    /// Creates an executor marking statements with the collector's own name.
    pub fn new(conn: C) -> Self {
        Self::with_marker(conn, crate::COLLECTOR_NAME)
    }

    /// Creates an executor whose marker is `/* <name> */`.
    pub fn with_marker(conn: C, name: &str) -> Self {
        Self {
            conn,
            marker: format!("/* {} */", name),
            in_transaction: false,
            last_elapsed: None,
        }
    }

    /// The comment prefixed to every statement.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Duration of the most recent statement.
    pub fn last_elapsed(&self) -> Option<Duration> {
        self.last_elapsed
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Runs `sql` and returns its rows.
    ///
    /// With `commit`, the session transaction is committed after success
    /// (used for DDL such as `CREATE EXTENSION` and for counter resets).
    pub fn execute(
        &mut self,
        sql: &str,
        on_failure: OnFailure,
        commit: bool,
    ) -> Result<Vec<Row>, CollectError> {
        if !self.in_transaction {
            self.run("BEGIN", on_failure)?;
            self.in_transaction = true;
        }

        let rows = self.run(sql, on_failure)?;

        if commit {
            self.run("COMMIT", on_failure)?;
            self.in_transaction = false;
        }
        Ok(rows)
    }

    /// Runs `sql`; any failure ends the run.
    pub fn query(&mut self, sql: &str) -> Result<Vec<Row>, CollectError> {
        self.execute(sql, OnFailure::Abort, false)
    }

    /// Runs `sql`; failures are returned for local handling.
    pub fn try_query(&mut self, sql: &str) -> Result<Vec<Row>, CollectError> {
        self.execute(sql, OnFailure::Propagate, false)
    }

    /// Rolls back the session transaction, clearing an aborted state.
    ///
    /// Session settings applied inside the transaction are lost and must be
    /// re-applied by the caller.
    pub fn rollback(&mut self) -> Result<(), CollectError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.run("ROLLBACK", OnFailure::Abort)?;
        self.in_transaction = false;
        Ok(())
    }

    fn run(&mut self, sql: &str, on_failure: OnFailure) -> Result<Vec<Row>, CollectError> {
        debug!("Running query: {}", sql);
        let marked = format!("{}{}", self.marker, sql);

        let started = Instant::now();
        let result = self.conn.query(&marked);
        let elapsed = started.elapsed();
        self.last_elapsed = Some(elapsed);

        match result {
            Ok(rows) => {
                debug!(
                    rows = rows.len(),
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "query finished"
                );
                Ok(rows)
            }
            Err(e) => Err(self.fail(e, on_failure)),
        }
    }

    fn fail(&self, e: DbError, on_failure: OnFailure) -> CollectError {
        match on_failure {
            OnFailure::Propagate => {
                debug!(error = %e, "query failed");
                CollectError::Query(e)
            }
            OnFailure::Abort => {
                error!("Got an error during query execution");
                for line in e.to_string().lines() {
                    error!("{}", line);
                }
                CollectError::Aborted(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockConnection;
    use crate::row;

    #[test]
    fn prefixes_marker_and_opens_transaction() {
        let conn = MockConnection::new().on("SELECT 1", vec![row! { "x" => 1 }]);
        let mut exec = QueryExecutor::with_marker(conn, "test-collector");

        let rows = exec.query("SELECT 1").unwrap();
        assert_eq!(rows.len(), 1);

        let statements = exec.connection().statements();
        assert_eq!(statements[0], "/* test-collector */BEGIN");
        assert_eq!(statements[1], "/* test-collector */SELECT 1");
    }

    #[test]
    fn begin_is_issued_once_per_transaction() {
        let mut exec = QueryExecutor::new(MockConnection::new());
        exec.query("SELECT 1").unwrap();
        exec.query("SELECT 2").unwrap();
        assert_eq!(exec.connection().count("BEGIN"), 1);

        exec.execute("CREATE EXTENSION IF NOT EXISTS x", OnFailure::Abort, true)
            .unwrap();
        assert_eq!(exec.connection().count("COMMIT"), 1);

        exec.query("SELECT 3").unwrap();
        assert_eq!(exec.connection().count("BEGIN"), 2);
    }

    #[test]
    fn command_without_result_yields_no_rows() {
        let mut exec = QueryExecutor::new(MockConnection::new());
        let rows = exec.query("SET statement_timeout TO 0").unwrap();
        assert!(rows.is_empty());
        assert!(exec.last_elapsed().is_some());
    }

    #[test]
    fn propagate_returns_query_error() {
        let conn = MockConnection::new().fail_on("pg_stat_plans_explain", "ERROR: cannot explain");
        let mut exec = QueryExecutor::new(conn);

        let err = exec
            .try_query("SELECT pg_stat_plans_explain(1, 2, 3)")
            .unwrap_err();
        assert!(matches!(err, CollectError::Query(_)));
        assert_eq!(err.to_string(), "ERROR: cannot explain");
    }

    #[test]
    fn abort_returns_aborted_error() {
        let conn = MockConnection::new().fail_on("pg_class", "ERROR: permission denied");
        let mut exec = QueryExecutor::new(conn);

        let err = exec.query("SELECT * FROM pg_class").unwrap_err();
        assert!(matches!(err, CollectError::Aborted(_)));
    }

    #[test]
    fn rollback_clears_aborted_transaction() {
        let conn = MockConnection::new().fail_on("bad", "ERROR: bad");
        let mut exec = QueryExecutor::new(conn);

        assert!(exec.try_query("SELECT bad").is_err());
        assert!(exec.try_query("SELECT 1").is_err());

        exec.rollback().unwrap();
        assert!(exec.query("SELECT 1").is_ok());
        assert_eq!(exec.connection().count("BEGIN"), 2);
    }
}
