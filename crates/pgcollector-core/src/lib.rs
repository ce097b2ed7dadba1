//! pgcollector-core: PostgreSQL statistics collection and submission.
//!
//! Provides:
//! - `db`: database boundary: typed rows, the `Connection` trait, the
//!   `postgres` backed connection and a scripted mock
//! - `collector`: query execution, capability probing, query statistics,
//!   schema and server statistics collection
//! - `system`: Linux OS metrics read from `/proc` and `/sys`
//! - `snapshot`: assembly of the submitted payload
//! - `submit`: HTTP submission with retry
//! - `config`: configuration file, managed-host environment, run options
//! - `pipeline`: one collection run end to end

pub mod collector;
pub mod config;
pub mod db;
pub mod pipeline;
pub mod snapshot;
pub mod submit;
pub mod system;

/// Name reported to the server and used in the query marker.
pub const COLLECTOR_NAME: &str = "pgcollector";

pub const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");
