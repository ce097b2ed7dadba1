//! pg_stat_plans collection with per-plan EXPLAIN.

use tracing::debug;

use super::queries::{self, PLANS_PLAN_PREFIX, PLANS_QUERY_PREFIX, SET_EXPLAIN_FORMAT};
use super::source::{PlanRecord, QueryStatRecord, RecordMerge};
use super::{CollectError, QueryExecutor};
use crate::db::Connection;

/// Reads pg_stat_plans and explains every explainable plan.
///
/// A plan whose EXPLAIN fails keeps the error text in `explain_error`; the
/// aborted transaction is rolled back and the explain format re-applied
/// before the next plan.
pub(super) fn fetch<C: Connection>(
    exec: &mut QueryExecutor<C>,
    query_parameters: bool,
) -> Result<Vec<QueryStatRecord>, CollectError> {
    exec.query(SET_EXPLAIN_FORMAT)?;

    let sql = queries::stat_plans(exec.marker());
    let rows = exec.query(&sql)?;

    let mut merge = RecordMerge::default();
    for mut row in rows {
        let mut aggregates = row.take_prefixed(PLANS_QUERY_PREFIX);
        let Some(normalized_query) = aggregates.take_string("normalized_query") else {
            debug!("skipping plan without normalized query");
            continue;
        };
        debug!("Processing query: {}", normalized_query);

        let mut plan = PlanRecord::from_row(row.take_prefixed(PLANS_PLAN_PREFIX), query_parameters);
        if plan.is_explainable() {
            explain(exec, &mut plan)?;
        }
        merge.push(normalized_query, aggregates, plan);
    }
    Ok(merge.into_records())
}

fn explain<C: Connection>(
    exec: &mut QueryExecutor<C>,
    plan: &mut PlanRecord,
) -> Result<(), CollectError> {
    let identity = (
        plan.stats.get_i64("planid"),
        plan.stats.get_i64("userid"),
        plan.stats.get_i64("dbid"),
    );
    let (Some(planid), Some(userid), Some(dbid)) = identity else {
        plan.explain_error = Some("plan identity is incomplete".to_string());
        return Ok(());
    };

    match exec.try_query(&queries::explain_plan(planid, userid, dbid)) {
        Ok(mut rows) => {
            plan.explain = rows.pop().and_then(|mut r| r.take_string("explain"));
            Ok(())
        }
        Err(CollectError::Query(e)) => {
            debug!("Got an error while explaining: {}", e);
            plan.explain_error = Some(e.to_string());
            exec.rollback()?;
            exec.query(SET_EXPLAIN_FORMAT)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}
