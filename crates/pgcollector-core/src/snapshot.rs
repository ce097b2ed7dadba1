//! The payload of one collection run.
//!
//! A [`Snapshot`] is built once by the [`SnapshotAssembler`] from finished
//! collector output and is never modified afterwards. The submitter reads it;
//! dry runs render it with [`Snapshot::to_pretty_json`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::collector::{QuerySource, QueryStatRecord, RelationKey, SchemaDocument, ServerStats};
use crate::submit::DATA_COMPRESSOR;
use crate::system::SystemInfo;
use crate::{COLLECTOR_NAME, COLLECTOR_VERSION};

/// What a run collected and how, reported next to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub query_parameters: bool,
    pub system_information: bool,
    pub query_source: Option<QuerySource>,
    /// Counters will be reset after a successful submission.
    pub reset: bool,
}

/// The `postgres` section of the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostgresInfo {
    pub schema: Vec<SchemaDocument>,
    pub version: String,
    #[serde(flatten)]
    pub server: ServerStats,
}

/// The document sent as the `data` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotData {
    pub queries: Vec<QueryStatRecord>,
    pub postgres: PostgresInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
}

/// One complete, immutable collection result.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    collected_at: DateTime<Utc>,
    api_key: String,
    features: Features,
    data: SnapshotData,
}

impl Snapshot {
    /// Whole seconds since the epoch, UTC.
    pub fn collected_at(&self) -> i64 {
        self.collected_at.timestamp()
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn data(&self) -> &SnapshotData {
        &self.data
    }

    /// Collector name and version, e.g. `pgcollector 0.1.0`.
    pub fn submitter(&self) -> String {
        format!("{} {}", COLLECTOR_NAME, COLLECTOR_VERSION)
    }

    /// Serializes the `data` document. Timestamps are rendered as strings.
    pub fn data_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.data)
    }

    /// Everything that would be posted, with EXPLAIN output decoded, sorted
    /// keys and four space indentation.
    ///
    /// `data` is shown uncompressed; `compress` only adds the
    /// `data_compressor` field the submission would carry. The API key is
    /// included as-is.
    pub fn to_pretty_json(&self, compress: bool) -> Result<String, serde_json::Error> {
        let mut data = serde_json::to_value(&self.data)?;
        decode_explains(&mut data);

        let mut post = serde_json::Map::new();
        post.insert("api_key".into(), self.api_key.clone().into());
        post.insert("collected_at".into(), self.collected_at().into());
        post.insert("data".into(), data);
        if compress {
            post.insert("data_compressor".into(), DATA_COMPRESSOR.into());
        }
        post.insert("no_reset".into(), (!self.features.reset).into());
        post.insert(
            "query_parameters".into(),
            self.features.query_parameters.into(),
        );
        if let Some(source) = self.features.query_source {
            post.insert("query_source".into(), source.name().into());
        }
        post.insert("submitter".into(), self.submitter().into());
        post.insert(
            "system_information".into(),
            self.features.system_information.into(),
        );
        let post = JsonValue::Object(sort_keys(post));

        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        post.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Replaces every plan's JSON-encoded `explain` text with the decoded value.
/// Text that does not parse is left alone.
fn decode_explains(data: &mut JsonValue) {
    let Some(queries) = data.get_mut("queries").and_then(JsonValue::as_array_mut) else {
        return;
    };
    for query in queries {
        let Some(plans) = query.get_mut("plans").and_then(JsonValue::as_array_mut) else {
            continue;
        };
        for plan in plans {
            let Some(explain) = plan.get_mut("explain") else {
                continue;
            };
            if let Some(decoded) = explain
                .as_str()
                .and_then(|text| serde_json::from_str::<JsonValue>(text).ok())
            {
                *explain = decoded;
            }
        }
    }
}

/// Rebuilds objects with keys in lexical order at every depth.
fn sort_keys(map: serde_json::Map<String, JsonValue>) -> serde_json::Map<String, JsonValue> {
    let sorted: BTreeMap<String, JsonValue> = map
        .into_iter()
        .map(|(k, v)| (k, sort_value(v)))
        .collect();
    sorted.into_iter().collect()
}

fn sort_value(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(sort_keys(map)),
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Builds snapshots from collector output.
#[derive(Debug, Clone)]
pub struct SnapshotAssembler {
    api_key: String,
}

impl SnapshotAssembler {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// Assembles a snapshot stamped with the current time.
    pub fn assemble(
        &self,
        features: Features,
        queries: Vec<QueryStatRecord>,
        postgres: PostgresInfo,
        system: Option<SystemInfo>,
    ) -> Snapshot {
        self.assemble_at(Utc::now(), features, queries, postgres, system)
    }

    /// Assembles a snapshot stamped with `collected_at`, truncated to whole
    /// seconds.
    ///
    /// OS metrics are only embedded when `features.system_information` is
    /// set.
    pub fn assemble_at(
        &self,
        collected_at: DateTime<Utc>,
        features: Features,
        queries: Vec<QueryStatRecord>,
        postgres: PostgresInfo,
        system: Option<SystemInfo>,
    ) -> Snapshot {
        let system = if features.system_information {
            system
        } else {
            None
        };
        let collected_at =
            DateTime::from_timestamp(collected_at.timestamp(), 0).unwrap_or(collected_at);

        debug!(
            queries = queries.len(),
            relations = postgres.schema.len(),
            system = system.is_some(),
            "snapshot assembled"
        );

        Snapshot {
            collected_at,
            api_key: self.api_key.clone(),
            features,
            data: SnapshotData {
                queries,
                postgres,
                system,
            },
        }
    }
}

impl PostgresInfo {
    /// Builds the section from a merged schema, in relation key order.
    pub fn new(
        schema: BTreeMap<RelationKey, SchemaDocument>,
        version: impl Into<String>,
        server: ServerStats,
    ) -> Self {
        Self {
            schema: schema.into_values().collect(),
            version: version.into(),
            server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::PlanRecord;
    use crate::db::Row;
    use crate::row;

    fn features() -> Features {
        Features {
            query_parameters: true,
            system_information: true,
            query_source: Some(QuerySource::PgStatPlans),
            reset: false,
        }
    }

    fn postgres() -> PostgresInfo {
        PostgresInfo::new(
            BTreeMap::new(),
            "PostgreSQL 16.1",
            ServerStats {
                bgwriter: Some(vec![row! { "buffers_clean" => 3 }]),
                ..Default::default()
            },
        )
    }

    fn queries() -> Vec<QueryStatRecord> {
        vec![QueryStatRecord {
            normalized_query: "SELECT * FROM t WHERE id = ?".into(),
            stats: row! { "calls" => 10 },
            plans: vec![PlanRecord {
                query: Some("SELECT * FROM t WHERE id = 1".into()),
                stats: Row::new(),
                explain: Some(r#"[{"Plan": {"Node Type": "Seq Scan"}}]"#.into()),
                explain_error: None,
            }],
        }]
    }

    #[test]
    fn timestamp_is_whole_seconds() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T12:00:05.750Z")
            .unwrap()
            .with_timezone(&Utc);
        let snapshot =
            SnapshotAssembler::new("key").assemble_at(at, features(), vec![], postgres(), None);
        assert_eq!(snapshot.collected_at(), 1709294405);
    }

    #[test]
    fn system_dropped_when_disabled() {
        let disabled = Features {
            system_information: false,
            ..features()
        };
        let snapshot = SnapshotAssembler::new("key").assemble(
            disabled,
            vec![],
            postgres(),
            Some(SystemInfo::default()),
        );
        assert!(snapshot.data().system.is_none());

        let json: JsonValue = serde_json::from_str(&snapshot.data_json().unwrap()).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["postgres"]["version"], "PostgreSQL 16.1");
        assert_eq!(json["postgres"]["bgwriter"][0]["buffers_clean"], 3);
        assert!(json["postgres"].get("locks").is_none());
    }

    #[test]
    fn data_keeps_explain_as_text() {
        let snapshot =
            SnapshotAssembler::new("key").assemble(features(), queries(), postgres(), None);
        let json: JsonValue = serde_json::from_str(&snapshot.data_json().unwrap()).unwrap();
        assert!(json["queries"][0]["plans"][0]["explain"].is_string());
        assert_eq!(json["queries"][0]["calls"], 10);
    }

    #[test]
    fn pretty_json_decodes_explain() {
        let snapshot =
            SnapshotAssembler::new("key").assemble(features(), queries(), postgres(), None);
        let pretty = snapshot.to_pretty_json(false).unwrap();

        assert!(pretty.starts_with("{\n    \"api_key\": \"key\","));
        let json: JsonValue = serde_json::from_str(&pretty).unwrap();
        assert_eq!(
            json["data"]["queries"][0]["plans"][0]["explain"][0]["Plan"]["Node Type"],
            "Seq Scan"
        );
        assert_eq!(json["query_source"], "pg_stat_plans");
        assert_eq!(json["submitter"], format!("pgcollector {}", COLLECTOR_VERSION));
        assert_eq!(json["no_reset"], true);
        assert!(json.get("data_compressor").is_none());
    }

    #[test]
    fn pretty_json_lists_every_form_field() {
        let snapshot = SnapshotAssembler::new("key").assemble(
            Features {
                reset: true,
                ..features()
            },
            queries(),
            postgres(),
            None,
        );
        let json: JsonValue =
            serde_json::from_str(&snapshot.to_pretty_json(true).unwrap()).unwrap();

        let fields = crate::submit::form_fields(&snapshot, true).unwrap();
        for (name, _) in &fields {
            assert!(json.get(*name).is_some(), "missing {}", name);
        }
        assert_eq!(json.as_object().unwrap().len(), fields.len());
        assert_eq!(json["data_compressor"], "zstd");
        assert_eq!(json["no_reset"], false);
        assert!(json["data"].is_object());
    }
}
