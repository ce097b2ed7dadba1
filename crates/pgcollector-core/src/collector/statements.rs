//! pg_stat_statements collection.

use tracing::warn;

use super::queries;
use super::source::{QueryStatRecord, RecordMerge};
use super::{CollectError, QueryExecutor};
use crate::db::Connection;

/// Reads pg_stat_statements for the current database.
///
/// The view has one row per user and statement, so rows sharing a text are
/// folded into one record; the first row's counters win. The extension keeps
/// no per-plan data, so every record has an empty plan list.
pub(super) fn fetch<C: Connection>(
    exec: &mut QueryExecutor<C>,
    server_version_num: i64,
) -> Result<Vec<QueryStatRecord>, CollectError> {
    let sql = queries::stat_statements(server_version_num, exec.marker());
    let rows = exec.query(&sql)?;

    let mut merge = RecordMerge::default();
    for mut row in rows {
        let Some(normalized_query) = row.take_string("normalized_query") else {
            warn!("pg_stat_statements row without query text, skipping");
            continue;
        };
        merge.push_aggregates(normalized_query, row);
    }
    Ok(merge.into_records())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MockConnection, Value};
    use crate::row;

    #[test]
    fn rows_become_records_without_plans() {
        let conn = MockConnection::new().on(
            "FROM pg_stat_statements",
            vec![
                row! { "normalized_query" => "SELECT ?", "calls" => 4, "total_time" => 1.5 },
                row! { "normalized_query" => Value::Null, "calls" => 1 },
            ],
        );
        let mut exec = QueryExecutor::new(conn);

        let records = fetch(&mut exec, 90400).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].normalized_query, "SELECT ?");
        assert!(!records[0].stats.contains("normalized_query"));
        assert!(records[0].plans.is_empty());
    }

    #[test]
    fn rows_from_several_users_share_one_record() {
        let conn = MockConnection::new().on(
            "FROM pg_stat_statements",
            vec![
                row! { "normalized_query" => "SELECT $1", "userid" => 10, "calls" => 7 },
                row! { "normalized_query" => "UPDATE t SET a = $1", "userid" => 10, "calls" => 2 },
                row! { "normalized_query" => "SELECT $1", "userid" => 20, "calls" => 3 },
            ],
        );
        let mut exec = QueryExecutor::new(conn);

        let records = fetch(&mut exec, 140000).unwrap();
        let texts: Vec<_> = records.iter().map(|r| r.normalized_query.as_str()).collect();
        assert_eq!(texts, vec!["SELECT $1", "UPDATE t SET a = $1"]);
        assert_eq!(records[0].stats.get_i64("userid"), Some(10));
        assert_eq!(records[0].stats.get_i64("calls"), Some(7));
        assert!(records.iter().all(|r| r.plans.is_empty()));
    }

    #[test]
    fn own_queries_are_excluded_by_marker() {
        let mut exec = QueryExecutor::with_marker(MockConnection::new(), "agent*/x");
        fetch(&mut exec, 90400).unwrap();

        let sql = exec
            .connection()
            .statements()
            .iter()
            .find(|s| s.contains("FROM pg_stat_statements"))
            .unwrap()
            .clone();
        assert!(sql.starts_with("/* agent*/x */"));
        assert!(sql.contains(r"query !~* E'^/\\* agent\\*/x \\*/'"));
    }
}
