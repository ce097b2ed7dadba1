//! SQL query builders for PostgreSQL catalogs and statistics views.
//!
//! Builders that depend on the server take its `server_version_num`; the
//! ones excluding collector traffic take the query marker.

/// Quotes `value` as an SQL string literal.
///
/// Values containing backslashes use the escape-string form so they are read
/// the same way regardless of `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    let quoted = value.replace('\'', "''");
    if quoted.contains('\\') {
        format!("E'{}'", quoted.replace('\\', "\\\\"))
    } else {
        format!("'{}'", quoted)
    }
}

/// Escapes the query marker for use in a POSIX regular expression.
pub fn marker_pattern(marker: &str) -> String {
    regex::escape(marker)
}

/// `<column> !~* '^<marker>'`: excludes statements issued by this collector.
fn exclude_marker(column: &str, marker: &str) -> String {
    format!(
        "{} !~* {}",
        column,
        quote_literal(&format!("^{}", marker_pattern(marker)))
    )
}

/// Relation predicate shared by every schema query.
///
/// Keeps ordinary tables, views and materialized views that are neither
/// temporary, in a system schema, nor owned by an extension.
pub fn relation_filter(class: &str, namespace: &str) -> String {
    format!(
        r#"{c}.relkind IN ('r', 'v', 'm')
              AND {c}.relpersistence <> 't'
              AND {n}.nspname NOT IN ('pg_catalog', 'information_schema')
              AND {n}.nspname !~ '^pg_toast'
              AND {n}.nspname !~ '^pg_temp'
              AND NOT EXISTS (
                  SELECT 1
                  FROM pg_catalog.pg_depend dep
                  WHERE dep.classid = 'pg_catalog.pg_class'::regclass
                    AND dep.objid = {c}.oid
                    AND dep.deptype = 'e'
              )"#,
        c = class,
        n = namespace
    )
}

pub fn server_info() -> &'static str {
    r#"
            SELECT
                current_setting('server_version_num')::int AS server_version_num,
                version() AS version,
                current_database() AS database,
                current_user AS username,
                current_setting('is_superuser') = 'on' AS is_superuser
        "#
}

pub fn extension_exists(name: &str) -> String {
    format!(
        "SELECT 1 AS found FROM pg_catalog.pg_extension WHERE extname = {}",
        quote_literal(name)
    )
}

pub fn function_exists(schema: &str, name: &str) -> String {
    format!(
        r#"
            SELECT 1 AS found
            FROM pg_catalog.pg_proc p
            JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
            WHERE n.nspname = {} AND proname = {}
        "#,
        quote_literal(schema),
        quote_literal(name)
    )
}

pub fn data_directory() -> &'static str {
    "SHOW data_directory"
}

// ---------------------------------------------------------------------------
// Query statistics sources
// ---------------------------------------------------------------------------

pub const CREATE_STAT_STATEMENTS: &str = "CREATE EXTENSION IF NOT EXISTS pg_stat_statements";

/// Builds version-aware query for pg_stat_statements.
///
/// Output columns keep the 9.2 names regardless of server version.
pub fn stat_statements(server_version_num: i64, marker: &str) -> String {
    let v = server_version_num;

    let (dirtied_shared, dirtied_local) = if v >= 90200 {
        ("shared_blks_dirtied", "local_blks_dirtied")
    } else {
        (
            "0::bigint AS shared_blks_dirtied",
            "0::bigint AS local_blks_dirtied",
        )
    };

    let (total_time, plan_time) = if v >= 130000 {
        ("total_exec_time", "total_plan_time")
    } else {
        ("total_time", "0::double precision")
    };

    let (read_time, write_time) = if v >= 170000 {
        ("shared_blk_read_time", "shared_blk_write_time")
    } else if v >= 90200 {
        ("blk_read_time", "blk_write_time")
    } else {
        ("0::double precision", "0::double precision")
    };

    format!(
        r#"
            SELECT
                query AS normalized_query,
                userid,
                dbid,
                calls,
                rows,
                {total_time} AS total_time,
                {plan_time} AS total_plan_time,
                shared_blks_hit,
                shared_blks_read,
                {dirtied_shared},
                shared_blks_written,
                local_blks_hit,
                local_blks_read,
                {dirtied_local},
                local_blks_written,
                temp_blks_read,
                temp_blks_written,
                {read_time} AS blk_read_time,
                {write_time} AS blk_write_time
            FROM pg_stat_statements
            WHERE {own}
              AND query <> '<insufficient privilege>'
              AND dbid IN (SELECT oid FROM pg_database WHERE datname = current_database())
        "#,
        own = exclude_marker("query", marker),
    )
}

/// Columns present in both `pg_stat_plans` and `pg_stat_plans_queries`.
const PLANS_SHARED_FIELDS: &[&str] = &[
    "userid",
    "dbid",
    "calls",
    "rows",
    "total_time",
    "shared_blks_hit",
    "shared_blks_read",
    "shared_blks_written",
    "local_blks_hit",
    "local_blks_read",
    "local_blks_written",
    "temp_blks_read",
    "temp_blks_written",
];

/// Column prefix of per-query aggregates in the plans join.
pub const PLANS_QUERY_PREFIX: &str = "pq_";
/// Column prefix of per-plan counters in the plans join.
pub const PLANS_PLAN_PREFIX: &str = "p_";

/// Builds the pg_stat_plans query: one row per plan, joined with its
/// normalized query.
///
/// Aggregate columns are prefixed `pq_` and plan columns `p_`. Plans that
/// can never be explained (utility statements, catalog queries, plans from
/// other databases) are left out.
pub fn stat_plans(marker: &str) -> String {
    let query_fields = ["time_variance", "time_stddev"]
        .iter()
        .chain(PLANS_SHARED_FIELDS)
        .map(|f| format!("pq.{f} AS {PLANS_QUERY_PREFIX}{f}"))
        .collect::<Vec<_>>()
        .join(", ");

    let plan_fields = [
        "planid",
        "had_our_search_path",
        "from_our_database",
        "query_explainable",
        "last_startup_cost",
        "last_total_cost",
    ]
    .iter()
    .chain(PLANS_SHARED_FIELDS)
    .map(|f| format!("p.{f} AS {PLANS_PLAN_PREFIX}{f}"))
    .collect::<Vec<_>>()
    .join(", ");

    format!(
        r#"
            SELECT
                pq.normalized_query AS pq_normalized_query,
                p.query AS p_query,
                {query_fields},
                {plan_fields}
            FROM pg_stat_plans p
            LEFT JOIN pg_stat_plans_queries pq ON p.planid = ANY (pq.planids)
            WHERE p.query !~* '^\s*(EXPLAIN|COPY|SET)\y'
              AND p.query !~* '\ypg_catalog\.'
              AND p.query <> '<insufficient privilege>'
              AND {own}
              AND p.from_our_database = TRUE
              AND p.planid = ANY (pq.planids)
        "#,
        own = exclude_marker("p.query", marker),
    )
}

pub const SET_EXPLAIN_FORMAT: &str = "SET pg_stat_plans.explain_format TO JSON; ";

pub fn explain_plan(planid: i64, userid: i64, dbid: i64) -> String {
    format!("SELECT pg_stat_plans_explain({planid}, {userid}, {dbid}) AS explain")
}

pub const RESET_STAT_PLANS: &str = "SELECT pg_stat_plans_reset()";
pub const RESET_STAT_STATEMENTS: &str = "SELECT pg_stat_statements_reset()";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Builds version-aware relations query: identity, size and table statistics.
pub fn relations(server_version_num: i64) -> String {
    let v = server_version_num;
    let n_mod_since_analyze = if v >= 90400 {
        "s.n_mod_since_analyze"
    } else {
        "NULL::bigint AS n_mod_since_analyze"
    };
    let n_ins_since_vacuum = if v >= 130000 {
        "s.n_ins_since_vacuum"
    } else {
        "NULL::bigint AS n_ins_since_vacuum"
    };

    format!(
        r#"
            SELECT
                c.oid AS relid,
                n.nspname AS schema_name,
                c.relname AS table_name,
                c.relkind AS relation_type,
                pg_catalog.pg_table_size(c.oid) AS size_bytes,
                s.seq_scan,
                s.seq_tup_read,
                s.idx_scan,
                s.idx_tup_fetch,
                s.n_tup_ins,
                s.n_tup_upd,
                s.n_tup_del,
                s.n_tup_hot_upd,
                s.n_live_tup,
                s.n_dead_tup,
                {n_mod_since_analyze},
                {n_ins_since_vacuum},
                s.last_vacuum,
                s.last_autovacuum,
                s.last_analyze,
                s.last_autoanalyze,
                s.vacuum_count,
                s.autovacuum_count,
                s.analyze_count,
                s.autoanalyze_count,
                sio.heap_blks_read,
                sio.heap_blks_hit,
                sio.idx_blks_read,
                sio.idx_blks_hit,
                sio.toast_blks_read,
                sio.toast_blks_hit,
                sio.tidx_blks_read,
                sio.tidx_blks_hit
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_catalog.pg_stat_user_tables s ON s.relid = c.oid
            LEFT JOIN pg_catalog.pg_statio_user_tables sio ON sio.relid = c.oid
            WHERE {filter}
            ORDER BY n.nspname, c.relname
        "#,
        filter = relation_filter("c", "n"),
    )
}

pub fn columns() -> String {
    format!(
        r#"
            SELECT
                c.oid AS relid,
                a.attname AS name,
                pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
                (SELECT pg_catalog.pg_get_expr(d.adbin, d.adrelid)
                 FROM pg_catalog.pg_attrdef d
                 WHERE d.adrelid = a.attrelid
                   AND d.adnum = a.attnum
                   AND a.atthasdef) AS default_value,
                a.attnotnull AS not_null,
                a.attnum AS position
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid
            WHERE {filter}
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY c.oid, a.attnum
        "#,
        filter = relation_filter("c", "n"),
    )
}

/// Builds version-aware index query.
///
/// Before 9.4 the indexed columns come back in the `int2vector` text form
/// (`"1 3 2"`) and are decoded during the merge.
pub fn indexes(server_version_num: i64) -> String {
    let columns_expr = if server_version_num >= 90400 {
        "i.indkey::int2[]"
    } else {
        "i.indkey::text"
    };

    format!(
        r#"
            SELECT
                c.oid AS relid,
                i.indexrelid,
                c2.relname AS name,
                {columns_expr} AS columns,
                pg_catalog.pg_relation_size(c2.oid) AS size_bytes,
                i.indisprimary AS is_primary,
                i.indisunique AS is_unique,
                i.indisvalid AS is_valid,
                pg_catalog.pg_get_indexdef(i.indexrelid, 0, TRUE) AS index_def,
                pg_catalog.pg_get_constraintdef(con.oid, TRUE) AS constraint_def
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_catalog.pg_index i ON i.indrelid = c.oid
            JOIN pg_catalog.pg_class c2 ON c2.oid = i.indexrelid
            LEFT JOIN pg_catalog.pg_constraint con
                ON con.conrelid = i.indrelid
               AND con.conindid = i.indexrelid
               AND con.contype IN ('p', 'u', 'x')
            WHERE {filter}
            ORDER BY c.oid, i.indisprimary DESC, i.indisunique DESC, c2.relname
        "#,
        filter = relation_filter("c", "n"),
    )
}

pub fn index_stats() -> &'static str {
    r#"
            SELECT
                s.indexrelid,
                s.idx_scan,
                s.idx_tup_read,
                s.idx_tup_fetch,
                sio.idx_blks_read,
                sio.idx_blks_hit
            FROM pg_catalog.pg_stat_user_indexes s
            JOIN pg_catalog.pg_statio_user_indexes sio ON sio.indexrelid = s.indexrelid
        "#
}

/// Foreign-key and check constraints.
pub fn constraints() -> String {
    format!(
        r#"
            SELECT
                c.oid AS relid,
                r.conname AS name,
                r.contype AS constraint_type,
                pg_catalog.pg_get_constraintdef(r.oid, TRUE) AS constraint_def,
                r.conkey AS columns,
                n2.nspname AS foreign_schema,
                c2.relname AS foreign_table,
                r.confkey AS foreign_columns
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_catalog.pg_constraint r ON r.conrelid = c.oid
            LEFT JOIN pg_catalog.pg_class c2 ON c2.oid = r.confrelid
            LEFT JOIN pg_catalog.pg_namespace n2 ON n2.oid = c2.relnamespace
            WHERE {filter}
              AND r.contype IN ('f', 'c')
            ORDER BY c.oid, r.conname
        "#,
        filter = relation_filter("c", "n"),
    )
}

pub fn view_definitions() -> String {
    format!(
        r#"
            SELECT
                c.oid AS relid,
                pg_catalog.pg_get_viewdef(c.oid, TRUE) AS view_definition
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE {filter}
              AND c.relkind IN ('v', 'm')
        "#,
        filter = relation_filter("c", "n"),
    )
}

/// Per-table row size estimate from `pg_stats`, shared by both bloat
/// queries. Estimation follows check_postgres (Greg Sabino Mullane).
const BLOAT_ESTIMATES: &str = r#"
            WITH constants AS (
                SELECT
                    current_setting('block_size')::numeric AS bs,
                    23 AS hdr,
                    CASE WHEN version() ~ 'mingw32' OR version() ~ '64-bit' THEN 8 ELSE 4 END AS ma
            ),
            column_widths AS (
                SELECT
                    tbl.oid AS relid,
                    hdr, ma, bs,
                    SUM((1 - COALESCE(s.null_frac, 0)) * COALESCE(s.avg_width, 2048)) AS datawidth,
                    MAX(COALESCE(s.null_frac, 0)) AS maxfracsum,
                    hdr + (
                        SELECT 1 + count(*) / 8
                        FROM pg_catalog.pg_stats s2
                        WHERE s2.null_frac <> 0
                          AND s2.schemaname = ns.nspname
                          AND s2.tablename = tbl.relname
                    ) AS nullhdr
                FROM pg_catalog.pg_attribute att
                JOIN pg_catalog.pg_class tbl ON att.attrelid = tbl.oid
                JOIN pg_catalog.pg_namespace ns ON ns.oid = tbl.relnamespace
                LEFT JOIN pg_catalog.pg_stats s
                    ON s.schemaname = ns.nspname
                   AND s.tablename = tbl.relname
                   AND s.inherited = false
                   AND s.attname = att.attname,
                constants
                WHERE att.attnum > 0 AND tbl.relkind = 'r'
                GROUP BY tbl.oid, ns.nspname, tbl.relname, hdr, ma, bs
            ),
            row_sizes AS (
                SELECT
                    relid, ma, bs,
                    (datawidth + (hdr + ma - (CASE WHEN hdr % ma = 0 THEN ma ELSE hdr % ma END)))::numeric AS datahdr,
                    (maxfracsum * (nullhdr + ma - (CASE WHEN nullhdr % ma = 0 THEN ma ELSE nullhdr % ma END))) AS nullhdr2
                FROM column_widths
            ),
            estimates AS (
                SELECT
                    cc.oid AS relid,
                    rs.bs,
                    rs.datahdr,
                    COALESCE(cc.relpages, 0) AS relpages,
                    COALESCE(CEIL((cc.reltuples * ((rs.datahdr + rs.ma -
                        (CASE WHEN rs.datahdr % rs.ma = 0 THEN rs.ma ELSE rs.datahdr % rs.ma END))
                        + rs.nullhdr2 + 4)) / (rs.bs - 20::float)), 0) AS otta
                FROM pg_catalog.pg_class cc
                JOIN row_sizes rs ON rs.relid = cc.oid
            )"#;

pub fn table_bloat() -> String {
    format!(
        r#"{BLOAT_ESTIMATES}
            SELECT
                relid,
                CASE WHEN relpages < otta THEN 0
                     ELSE (bs * (relpages - otta))::bigint
                END AS wasted_bytes
            FROM estimates
        "#
    )
}

pub fn index_bloat() -> String {
    format!(
        r#"{BLOAT_ESTIMATES}
            SELECT
                indexrelid,
                CASE WHEN ipages < iotta THEN 0
                     ELSE (bs * (ipages - iotta))::bigint
                END AS wasted_bytes
            FROM (
                SELECT
                    i.indexrelid,
                    e.bs,
                    COALESCE(c2.relpages, 0) AS ipages,
                    COALESCE(CEIL((c2.reltuples * (e.datahdr - 12)) / (e.bs - 20::float)), 0) AS iotta
                FROM estimates e
                JOIN pg_catalog.pg_index i ON i.indrelid = e.relid
                JOIN pg_catalog.pg_class c2 ON c2.oid = i.indexrelid
            ) AS idx
        "#
    )
}

// ---------------------------------------------------------------------------
// Server statistics
// ---------------------------------------------------------------------------

/// Builds version-aware query for background writer counters.
///
/// 17+ moved checkpoint counters to pg_stat_checkpointer; they are joined
/// back under their old names.
pub fn bgwriter(server_version_num: i64) -> &'static str {
    if server_version_num >= 170000 {
        r#"
            SELECT
                c.num_timed AS checkpoints_timed,
                c.num_requested AS checkpoints_req,
                c.write_time AS checkpoint_write_time,
                c.sync_time AS checkpoint_sync_time,
                c.buffers_written AS buffers_checkpoint,
                b.buffers_clean,
                b.maxwritten_clean,
                b.buffers_alloc,
                b.stats_reset
            FROM pg_catalog.pg_stat_bgwriter b, pg_catalog.pg_stat_checkpointer c
        "#
    } else {
        "SELECT * FROM pg_catalog.pg_stat_bgwriter"
    }
}

pub fn database_stats() -> &'static str {
    "SELECT * FROM pg_catalog.pg_stat_database WHERE datname = current_database()"
}

pub fn replication_conflicts() -> &'static str {
    "SELECT * FROM pg_catalog.pg_stat_database_conflicts WHERE datname = current_database()"
}

pub fn settings() -> &'static str {
    r#"
            SELECT
                name,
                setting AS current_value,
                unit,
                boot_val AS boot_value,
                reset_val AS reset_value,
                source,
                sourcefile,
                sourceline
            FROM pg_catalog.pg_settings
        "#
}

pub fn locks() -> &'static str {
    r#"
            SELECT
                d.datname AS database,
                n.nspname AS schema,
                c.relname AS relation,
                l.locktype,
                l.page,
                l.tuple,
                l.virtualxid,
                l.transactionid::text AS transactionid,
                l.virtualtransaction,
                l.pid,
                l.mode,
                l.granted
            FROM pg_catalog.pg_locks l
            LEFT JOIN pg_catalog.pg_class c ON l.relation = c.oid
            LEFT JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_catalog.pg_database d ON d.oid = l.database
            WHERE l.pid <> pg_backend_pid()
        "#
}

/// Builds version-aware query for sessions of the current database.
///
/// `helper` selects the security-definer wrapper function over the view.
pub fn backends(server_version_num: i64, helper: bool) -> String {
    let v = server_version_num;
    let source = if helper {
        "pganalyze.get_stat_activity()"
    } else {
        "pg_catalog.pg_stat_activity"
    };

    let (pid, query, state, state_change) = if v >= 90200 {
        ("pid", "query", "state", "state_change")
    } else {
        (
            "procpid",
            "current_query",
            "NULL::text",
            "NULL::timestamptz",
        )
    };

    let (waiting, wait_event_type, wait_event) = if v >= 90600 {
        (
            "wait_event IS NOT NULL",
            "wait_event_type",
            "wait_event",
        )
    } else {
        ("waiting", "NULL::text", "NULL::text")
    };

    format!(
        r#"
            SELECT
                {pid} AS pid,
                datname AS database,
                usename AS username,
                application_name,
                client_addr::text AS client_addr,
                client_hostname,
                client_port,
                backend_start,
                xact_start,
                query_start,
                {state_change} AS state_change,
                {waiting} AS waiting,
                {wait_event_type} AS wait_event_type,
                {wait_event} AS wait_event,
                {state} AS state,
                {query} AS query
            FROM {source}
            WHERE {pid} <> pg_backend_pid()
              AND datname = current_database()
        "#
    )
}

/// Builds version-aware query for streaming replication peers.
pub fn replication(server_version_num: i64, helper: bool) -> String {
    let v = server_version_num;
    let source = if helper {
        "pganalyze.get_stat_replication()"
    } else {
        "pg_catalog.pg_stat_replication"
    };
    let pid = if v >= 90200 { "pid" } else { "procpid" };
    let (sent, write, flush, replay) = if v >= 100000 {
        ("sent_lsn", "write_lsn", "flush_lsn", "replay_lsn")
    } else {
        (
            "sent_location",
            "write_location",
            "flush_location",
            "replay_location",
        )
    };

    format!(
        r#"
            SELECT
                {pid} AS pid,
                usename AS username,
                application_name,
                client_addr::text AS client_addr,
                client_hostname,
                client_port,
                backend_start,
                state,
                {sent}::text AS sent_location,
                {write}::text AS write_location,
                {flush}::text AS flush_location,
                {replay}::text AS replay_location,
                sync_priority,
                sync_state
            FROM {source}
        "#
    )
}

/// Builds version-aware query for user-defined functions and their call
/// statistics (present only when `track_functions` is enabled).
pub fn functions(server_version_num: i64) -> String {
    let v = server_version_num;
    let kind = if v >= 110000 {
        "p.prokind"
    } else {
        "CASE WHEN p.proisagg THEN 'a' WHEN p.proiswindow THEN 'w' ELSE 'f' END"
    };
    let leakproof = if v >= 90200 {
        "p.proleakproof"
    } else {
        "false"
    };

    format!(
        r#"
            SELECT
                p.oid AS funcid,
                n.nspname AS schema_name,
                p.proname AS function_name,
                l.lanname AS language,
                p.prosrc AS source,
                p.probin AS source_bin,
                p.proconfig AS config,
                pg_catalog.pg_get_function_arguments(p.oid) AS arguments,
                pg_catalog.pg_get_function_result(p.oid) AS result,
                {kind}::text AS kind,
                p.prosecdef AS security_definer,
                {leakproof} AS leakproof,
                p.proisstrict AS strict,
                p.proretset AS returns_set,
                p.provolatile::text AS volatile,
                s.calls,
                s.total_time,
                s.self_time
            FROM pg_catalog.pg_proc p
            JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
            JOIN pg_catalog.pg_language l ON l.oid = p.prolang
            LEFT JOIN pg_catalog.pg_stat_user_functions s ON s.funcid = p.oid
            WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
              AND NOT EXISTS (
                  SELECT 1
                  FROM pg_catalog.pg_depend dep
                  WHERE dep.classid = 'pg_catalog.pg_proc'::regclass
                    AND dep.objid = p.oid
                    AND dep.deptype = 'e'
              )
            ORDER BY n.nspname, p.proname
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::RegexBuilder;

    const MARKER: &str = "/* pgcollector */";

    #[test]
    fn quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(r"a\b"), r"E'a\\b'");
    }

    #[test]
    fn marker_pattern_escapes_metacharacters() {
        assert_eq!(marker_pattern(MARKER), r"/\* pgcollector \*/");
    }

    #[test]
    fn marker_pattern_matches_only_own_queries() {
        let pattern = format!("^{}", marker_pattern(MARKER));
        let re = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .unwrap();

        assert!(re.is_match("/* pgcollector */SELECT 1"));
        assert_eq!(re.find_iter("/* pgcollector */SELECT 1").count(), 1);
        assert!(!re.is_match("SELECT 1 /* pgcollector */"));
        // Unescaped, `*` would turn the pattern into "zero or more slashes".
        assert!(!re.is_match("/ pgcollector /SELECT 1"));
        assert!(!re.is_match("SELECT * FROM users"));
    }

    #[test]
    fn marker_with_quotes_stays_one_literal() {
        let clause = exclude_marker("query", "/* it's */");
        assert_eq!(clause, r"query !~* E'^/\\* it''s \\*/'");
    }

    #[test]
    fn stat_statements_query_filters_own_and_foreign_rows() {
        let q = stat_statements(90400, MARKER);
        assert!(q.contains(r"query !~* E'^/\\* pgcollector \\*/'"));
        assert!(q.contains("query <> '<insufficient privilege>'"));
        assert!(q.contains("datname = current_database()"));
    }

    #[test]
    fn stat_statements_query_on_91_has_no_dirtied_or_timing_columns() {
        let q = stat_statements(90100, MARKER);
        assert!(q.contains("0::bigint AS shared_blks_dirtied"));
        assert!(q.contains("0::double precision AS blk_read_time"));
        assert!(q.contains("total_time AS total_time"));
    }

    #[test]
    fn stat_statements_query_uses_exec_time_on_pg13_plus() {
        let q = stat_statements(130000, MARKER);
        assert!(q.contains("total_exec_time AS total_time"));
        assert!(q.contains("total_plan_time AS total_plan_time"));
        assert!(q.contains("blk_read_time AS blk_read_time"));
    }

    #[test]
    fn stat_statements_query_uses_shared_blk_time_on_pg17_plus() {
        let q = stat_statements(170000, MARKER);
        assert!(q.contains("shared_blk_read_time AS blk_read_time"));
        assert!(q.contains("shared_blk_write_time AS blk_write_time"));
    }

    #[test]
    fn stat_plans_query_prefixes_columns() {
        let q = stat_plans(MARKER);
        assert!(q.contains("pq.normalized_query AS pq_normalized_query"));
        assert!(q.contains("pq.time_stddev AS pq_time_stddev"));
        assert!(q.contains("p.query_explainable AS p_query_explainable"));
        assert!(q.contains("p.calls AS p_calls"));
        assert!(q.contains("pq.calls AS pq_calls"));
        assert!(q.contains(r"p.query !~* E'^/\\* pgcollector \\*/'"));
        assert!(q.contains("p.query <> '<insufficient privilege>'"));
    }

    #[test]
    fn explain_query_passes_plan_identity() {
        assert_eq!(
            explain_plan(12, 10, 16384),
            "SELECT pg_stat_plans_explain(12, 10, 16384) AS explain"
        );
    }

    #[test]
    fn schema_queries_share_relation_filter() {
        let filter = relation_filter("c", "n");
        for q in [
            relations(90400),
            columns(),
            indexes(90400),
            constraints(),
            view_definitions(),
        ] {
            assert!(q.contains(&filter));
            assert!(q.contains("c.oid AS relid"));
        }
    }

    #[test]
    fn relations_query_is_version_aware() {
        assert!(relations(90300).contains("NULL::bigint AS n_mod_since_analyze"));
        assert!(relations(90400).contains("s.n_mod_since_analyze,"));
        assert!(relations(120000).contains("NULL::bigint AS n_ins_since_vacuum"));
        assert!(relations(130000).contains("s.n_ins_since_vacuum,"));
    }

    #[test]
    fn indexes_query_uses_legacy_text_before_94() {
        assert!(indexes(90300).contains("i.indkey::text AS columns"));
        assert!(indexes(90400).contains("i.indkey::int2[] AS columns"));
    }

    #[test]
    fn bloat_queries_are_keyed_by_oid() {
        assert!(table_bloat().contains("relid,"));
        assert!(table_bloat().contains("AS wasted_bytes"));
        assert!(index_bloat().contains("i.indexrelid"));
        assert!(index_bloat().contains("AS wasted_bytes"));
    }

    #[test]
    fn bgwriter_query_pg17_joins_checkpointer() {
        assert!(bgwriter(170000).contains("pg_stat_checkpointer"));
        assert!(!bgwriter(160000).contains("pg_stat_checkpointer"));
    }

    #[test]
    fn backends_query_on_91_uses_procpid() {
        let q = backends(90100, false);
        assert!(q.contains("procpid AS pid"));
        assert!(q.contains("current_query AS query"));
        assert!(q.contains("FROM pg_catalog.pg_stat_activity"));
    }

    #[test]
    fn backends_query_prefers_helper_function() {
        let q = backends(90600, true);
        assert!(q.contains("FROM pganalyze.get_stat_activity()"));
        assert!(q.contains("wait_event IS NOT NULL AS waiting"));
        assert!(q.contains("pid <> pg_backend_pid()"));
    }

    #[test]
    fn replication_query_uses_lsn_names_on_pg10_plus() {
        assert!(replication(100000, false).contains("sent_lsn::text AS sent_location"));
        assert!(replication(90600, false).contains("sent_location::text AS sent_location"));
        assert!(replication(90600, true).contains("pganalyze.get_stat_replication()"));
    }

    #[test]
    fn functions_query_kind_column_is_version_aware() {
        assert!(functions(110000).contains("p.prokind::text AS kind"));
        assert!(functions(100000).contains("WHEN p.proisagg THEN 'a'"));
    }

    #[test]
    fn locks_query_excludes_own_backend() {
        assert!(locks().contains("l.pid <> pg_backend_pid()"));
    }
}
