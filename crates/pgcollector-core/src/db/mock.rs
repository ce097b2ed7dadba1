//! In-memory mock connection for testing collectors without a server.
//!
//! Responses are scripted per SQL fragment. When several fragments match a
//! statement, the longest one wins, so a test can script both
//! `"pg_stat_statements"` and `"extname = 'pg_stat_statements'"` without the
//! catalog probe picking up the statistics rows.
//!
//! Like a real session, a failed statement leaves the mock in an aborted
//! transaction: every later statement fails until a `ROLLBACK` is seen.

use std::collections::VecDeque;

use super::{Connection, DbError, Row};

const ABORTED_MESSAGE: &str =
    "ERROR: current transaction is aborted, commands ignored until end of transaction block";

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows(Vec<Row>),
    Error(String),
}

#[derive(Debug, Clone)]
struct Script {
    fragment: String,
    /// Consumed front to back; the last entry repeats forever.
    responses: VecDeque<MockResponse>,
}

/// Scripted [`Connection`] recording every statement it receives.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    scripts: Vec<Script>,
    statements: Vec<String>,
    aborted: bool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers statements containing `fragment` with `rows`.
    pub fn on(self, fragment: &str, rows: Vec<Row>) -> Self {
        self.on_sequence(fragment, vec![MockResponse::Rows(rows)])
    }

    /// Fails statements containing `fragment` with a server error.
    pub fn fail_on(self, fragment: &str, message: &str) -> Self {
        self.on_sequence(fragment, vec![MockResponse::Error(message.to_string())])
    }

    /// Answers successive matching statements with successive responses.
    pub fn on_sequence(mut self, fragment: &str, responses: Vec<MockResponse>) -> Self {
        self.scripts.retain(|s| s.fragment != fragment);
        self.scripts.push(Script {
            fragment: fragment.to_string(),
            responses: responses.into(),
        });
        self
    }

    /// All statements received so far, verbatim.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Number of received statements containing `fragment`.
    pub fn count(&self, fragment: &str) -> usize {
        self.statements
            .iter()
            .filter(|s| s.contains(fragment))
            .count()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn next_response(&mut self, sql: &str) -> Option<MockResponse> {
        let script = self
            .scripts
            .iter_mut()
            .filter(|s| sql.contains(&s.fragment))
            .max_by_key(|s| s.fragment.len())?;
        if script.responses.len() > 1 {
            script.responses.pop_front()
        } else {
            script.responses.front().cloned()
        }
    }
}

impl Connection for MockConnection {
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        self.statements.push(sql.to_string());

        if self.aborted {
            if sql.trim_end().ends_with("ROLLBACK") {
                self.aborted = false;
                return Ok(Vec::new());
            }
            return Err(DbError::Query(ABORTED_MESSAGE.to_string()));
        }

        match self.next_response(sql) {
            Some(MockResponse::Rows(rows)) => Ok(rows),
            Some(MockResponse::Error(message)) => {
                self.aborted = true;
                Err(DbError::Query(message))
            }
            None => Ok(Vec::new()),
        }
    }
}
