//! `postgres` driver backed connection.

use std::net::IpAddr;

use chrono::{DateTime, NaiveDateTime, Utc};
use postgres::types::{FromSql, Type};
use postgres::{Client, NoTls};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, warn};

use super::{Connection, DbError, Row, Value};
use crate::config::ConnectionConfig;

/// Default host when the descriptor does not name one.
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5432;

/// A live session on the monitored server.
pub struct PgConnection {
    client: Client,
}

impl PgConnection {
    /// Opens the session described by `config`.
    pub fn connect(config: &ConnectionConfig) -> Result<Self, DbError> {
        let mut pg = postgres::Config::new();
        pg.host(config.host.as_deref().unwrap_or(DEFAULT_HOST))
            .port(config.port.unwrap_or(DEFAULT_PORT))
            .dbname(&config.dbname)
            .application_name(crate::COLLECTOR_NAME);
        if let Some(user) = &config.username {
            pg.user(user);
        }
        if let Some(password) = &config.password {
            pg.password(password);
        }

        debug!(config = ?config, "connecting to database");
        let client = pg
            .connect(NoTls)
            .map_err(|e| DbError::Connect(format_postgres_error(&e)))?;
        Ok(Self { client })
    }
}

impl Connection for PgConnection {
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        let statement = self
            .client
            .prepare(sql)
            .map_err(|e| DbError::Query(format_postgres_error(&e)))?;

        // No column description: a command such as SET or BEGIN.
        if statement.columns().is_empty() {
            self.client
                .execute(&statement, &[])
                .map_err(|e| DbError::Query(format_postgres_error(&e)))?;
            return Ok(Vec::new());
        }

        let rows = self
            .client
            .query(&statement, &[])
            .map_err(|e| DbError::Query(format_postgres_error(&e)))?;
        rows.iter().map(convert_row).collect()
    }
}

/// Converts a driver row into a [`Row`], column by column.
fn convert_row(row: &postgres::Row) -> Result<Row, DbError> {
    let mut out = Row::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_value(row, idx, column.type_()).map_err(|e| {
            DbError::Query(format!("failed to decode column {}: {}", column.name(), e))
        })?;
        out.insert(column.name(), value);
    }
    Ok(out)
}

fn get<'a, T: FromSql<'a>>(
    row: &'a postgres::Row,
    idx: usize,
) -> Result<Option<T>, postgres::Error> {
    row.try_get::<_, Option<T>>(idx)
}

fn column_value(row: &postgres::Row, idx: usize, ty: &Type) -> Result<Value, postgres::Error> {
    let value: Value = match *ty {
        Type::BOOL => get::<bool>(row, idx)?.into(),
        Type::INT2 => get::<i16>(row, idx)?.map(i64::from).into(),
        Type::INT4 => get::<i32>(row, idx)?.into(),
        Type::INT8 => get::<i64>(row, idx)?.into(),
        Type::OID => get::<u32>(row, idx)?.into(),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(f64::from).into(),
        Type::FLOAT8 => get::<f64>(row, idx)?.into(),
        // Lossy on purpose: the payload has no arbitrary-precision numbers.
        Type::NUMERIC => get::<Decimal>(row, idx)?.and_then(|d| d.to_f64()).into(),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)?.into(),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)?.map(|t| t.and_utc()).into(),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?.into(),
        Type::CHAR => get::<i8>(row, idx)?
            .map(|c| char::from(c as u8).to_string())
            .into(),
        Type::INET => get::<IpAddr>(row, idx)?.map(|a| a.to_string()).into(),
        Type::INT2_ARRAY | Type::INT2_VECTOR => {
            json_array(get::<Vec<Option<i16>>>(row, idx)?)
        }
        Type::INT4_ARRAY => json_array(get::<Vec<Option<i32>>>(row, idx)?),
        Type::INT8_ARRAY => json_array(get::<Vec<Option<i64>>>(row, idx)?),
        Type::OID_ARRAY => json_array(get::<Vec<Option<u32>>>(row, idx)?),
        Type::TEXT_ARRAY | Type::NAME_ARRAY | Type::VARCHAR_ARRAY => {
            json_array(get::<Vec<Option<String>>>(row, idx)?)
        }
        _ => match get::<String>(row, idx) {
            Ok(v) => v.into(),
            Err(_) => {
                warn!(column = idx, type_name = %ty, "unsupported column type, reporting null");
                Value::Null
            }
        },
    };
    Ok(value)
}

fn json_array<T: serde::Serialize>(items: Option<Vec<Option<T>>>) -> Value {
    match items {
        Some(items) => serde_json::to_value(items).map_or(Value::Null, Value::Json),
        None => Value::Null,
    }
}

/// Formats PostgreSQL error message for display.
///
/// Server errors keep their detail and hint on separate lines so they can be
/// logged in full.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        let mut msg = format!("{}: {}", db_error.severity(), db_error.message());
        if let Some(detail) = db_error.detail() {
            msg.push_str("\nDETAIL: ");
            msg.push_str(detail);
        }
        if let Some(hint) = db_error.hint() {
            msg.push_str("\nHINT: ");
            msg.push_str(hint);
        }
        msg
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
