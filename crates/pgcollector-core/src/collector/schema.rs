//! Schema collection: one denormalized document per relation.
//!
//! Relations, columns, indexes, constraints and view definitions come from
//! separate queries that all apply the same relation predicate. Rows are
//! joined by relation oid; a row referring to a relation that the seed pass
//! did not return is dropped rather than creating a new document.

use std::collections::{BTreeMap, HashMap};
use std::num::ParseIntError;

use serde::Serialize;
use tracing::{debug, warn};

use super::probe::CapabilityProbe;
use super::queries;
use super::{CollectError, QueryExecutor};
use crate::db::{Connection, Row, Value};

/// Identity of a relation within one database: its `pg_class` oid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RelationKey(pub u32);

impl RelationKey {
    /// Reads and removes an oid column.
    fn take(row: &mut Row, column: &str) -> Option<Self> {
        row.take_i64(column)
            .and_then(|oid| u32::try_from(oid).ok())
            .map(RelationKey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Table,
    View,
    MaterializedView,
}

impl RelationKind {
    /// Maps a `pg_class.relkind` code.
    pub fn from_relkind(relkind: &str) -> Option<Self> {
        match relkind {
            "r" => Some(RelationKind::Table),
            "v" => Some(RelationKind::View),
            "m" => Some(RelationKind::MaterializedView),
            _ => None,
        }
    }
}

/// Activity and I/O counters of a relation plus its bloat estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableStats {
    #[serde(flatten)]
    pub counters: Row,
    /// `None` means no estimate, which is not the same as zero waste.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wasted_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaDocument {
    pub oid: RelationKey,
    pub schema_name: String,
    pub table_name: String,
    pub relation_type: RelationKind,
    pub size_bytes: Option<i64>,
    pub stats: TableStats,
    pub columns: Vec<Row>,
    pub indices: Vec<Row>,
    pub constraints: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_definition: Option<String>,
}

/// Which optional passes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaOptions {
    pub include_views: bool,
    pub bloat: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            include_views: true,
            bloat: true,
        }
    }
}

/// Raw results of every schema query, before merging.
#[derive(Debug, Clone, Default)]
pub struct SchemaPasses {
    pub relations: Vec<Row>,
    pub table_bloat: Option<Vec<Row>>,
    pub index_bloat: Option<Vec<Row>>,
    pub columns: Vec<Row>,
    pub indexes: Vec<Row>,
    pub index_stats: Vec<Row>,
    pub constraints: Vec<Row>,
    pub views: Option<Vec<Row>>,
}

pub struct SchemaCollector<'a> {
    probe: &'a CapabilityProbe,
    options: SchemaOptions,
}

impl<'a> SchemaCollector<'a> {
    pub fn new(probe: &'a CapabilityProbe, options: SchemaOptions) -> Self {
        Self { probe, options }
    }

    pub fn collect<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<BTreeMap<RelationKey, SchemaDocument>, CollectError> {
        let passes = self.fetch(exec)?;
        let schema = merge_schema(passes);
        debug!(relations = schema.len(), "schema collected");
        Ok(schema)
    }

    /// Runs every enabled schema query.
    pub fn fetch<C: Connection>(
        &self,
        exec: &mut QueryExecutor<C>,
    ) -> Result<SchemaPasses, CollectError> {
        let v = self.probe.server_version_num();

        let relations = exec.query(&queries::relations(v))?;
        let (table_bloat, index_bloat) = if self.options.bloat {
            (
                Some(exec.query(&queries::table_bloat())?),
                Some(exec.query(&queries::index_bloat())?),
            )
        } else {
            (None, None)
        };
        let columns = exec.query(&queries::columns())?;
        let indexes = exec.query(&queries::indexes(v))?;
        let index_stats = exec.query(queries::index_stats())?;
        let constraints = exec.query(&queries::constraints())?;
        let views = if self.options.include_views {
            Some(exec.query(&queries::view_definitions())?)
        } else {
            None
        };

        Ok(SchemaPasses {
            relations,
            table_bloat,
            index_bloat,
            columns,
            indexes,
            index_stats,
            constraints,
            views,
        })
    }
}

/// Merges schema query results by relation oid.
///
/// Order: seed documents from relations, fold in table bloat, then attach
/// columns (by ordinal position), indexes (with their stats and bloat),
/// constraints and view definitions.
pub fn merge_schema(passes: SchemaPasses) -> BTreeMap<RelationKey, SchemaDocument> {
    let mut schema = BTreeMap::new();

    for mut row in passes.relations {
        if let Some(doc) = seed_document(&mut row) {
            schema.insert(doc.oid, doc);
        }
    }

    for mut row in passes.table_bloat.into_iter().flatten() {
        let Some(key) = RelationKey::take(&mut row, "relid") else {
            continue;
        };
        if let Some(doc) = schema.get_mut(&key) {
            doc.stats.wasted_bytes = row.get_i64("wasted_bytes");
        }
    }

    for mut row in passes.columns {
        if let Some(doc) = attach_target(&mut schema, &mut row, "column") {
            doc.columns.push(row);
        }
    }
    for doc in schema.values_mut() {
        doc.columns.sort_by_key(|c| c.get_i64("position"));
    }

    let mut index_stats: HashMap<u32, Row> = HashMap::new();
    for mut row in passes.index_stats {
        if let Some(RelationKey(oid)) = RelationKey::take(&mut row, "indexrelid") {
            index_stats.insert(oid, row);
        }
    }
    let index_bloat: Option<HashMap<u32, Value>> = passes.index_bloat.map(|rows| {
        rows.into_iter()
            .filter_map(|mut row| {
                let RelationKey(oid) = RelationKey::take(&mut row, "indexrelid")?;
                Some((oid, row.take("wasted_bytes").unwrap_or(Value::Null)))
            })
            .collect()
    });

    for mut row in passes.indexes {
        let Some(doc) = attach_target(&mut schema, &mut row, "index") else {
            continue;
        };
        decode_index_columns(&mut row);

        let indexrelid = row.get_i64("indexrelid").and_then(|v| u32::try_from(v).ok());
        if let Some(oid) = indexrelid {
            if let Some(stats) = index_stats.remove(&oid) {
                row.merge(stats);
            }
            if let Some(wasted) = index_bloat.as_ref().and_then(|b| b.get(&oid)) {
                row.insert("wasted_bytes", wasted.clone());
            }
        }
        doc.indices.push(row);
    }

    for mut row in passes.constraints {
        if let Some(doc) = attach_target(&mut schema, &mut row, "constraint") {
            doc.constraints.push(row);
        }
    }

    for mut row in passes.views.into_iter().flatten() {
        if let Some(doc) = attach_target(&mut schema, &mut row, "view definition") {
            doc.view_definition = row.take_string("view_definition");
        }
    }

    schema
}

fn seed_document(row: &mut Row) -> Option<SchemaDocument> {
    let oid = RelationKey::take(row, "relid")?;
    let relkind = row.take_string("relation_type").unwrap_or_default();
    let Some(relation_type) = RelationKind::from_relkind(&relkind) else {
        warn!(oid = oid.0, relkind = %relkind, "unexpected relation kind, skipping");
        return None;
    };

    Some(SchemaDocument {
        oid,
        schema_name: row.take_string("schema_name").unwrap_or_default(),
        table_name: row.take_string("table_name").unwrap_or_default(),
        relation_type,
        size_bytes: row.take_i64("size_bytes"),
        stats: TableStats {
            counters: std::mem::take(row),
            wasted_bytes: None,
        },
        columns: Vec::new(),
        indices: Vec::new(),
        constraints: Vec::new(),
        view_definition: None,
    })
}

/// Finds the seeded document for a row, consuming its `relid` column.
fn attach_target<'s>(
    schema: &'s mut BTreeMap<RelationKey, SchemaDocument>,
    row: &mut Row,
    what: &str,
) -> Option<&'s mut SchemaDocument> {
    let key = RelationKey::take(row, "relid")?;
    let doc = schema.get_mut(&key);
    if doc.is_none() {
        debug!(oid = key.0, what, "row for unknown relation dropped");
    }
    doc
}

/// Replaces a legacy `int2vector` text column list with an integer array.
fn decode_index_columns(row: &mut Row) {
    let Some(text) = row.get_str("columns") else {
        return;
    };
    let decoded = match parse_int2vector(text) {
        Ok(columns) => Value::Json(columns.into()),
        Err(e) => {
            warn!(columns = %text, error = %e, "invalid int2vector");
            Value::Null
        }
    };
    row.insert("columns", decoded);
}

/// Parses the `int2vector` text form (`"1 3 2"`) into column numbers,
/// preserving order. Expression columns appear as `0`.
pub fn parse_int2vector(text: &str) -> Result<Vec<i16>, ParseIntError> {
    text.split_whitespace().map(str::parse).collect()
}
