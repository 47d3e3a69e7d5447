//! On-disk store shapes and the forward-only `v2 -> v3 -> v4` upgrade chain.
//!
//! * v2: no `version` field, records keyed by the attempt id.
//! * v3 (and any version below 4): records keyed by a friendly name, the
//!   attempt id carried in a kind-specific field (`taskId` for sessions,
//!   `sessionId` for tasks).
//! * v4: records keyed by the attempt id.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::store::{Record, StoreFile, StoreKind, STORE_VERSION};

type RawRecords = Vec<(String, Map<String, Value>)>;

#[derive(Debug, Clone, PartialEq)]
pub struct V2Store {
    pub sessions: RawRecords,
}

#[derive(Debug, Clone, PartialEq)]
pub struct V3Store {
    /// Version label used in the migration warning (`2` when upgraded from v2).
    pub from_version: String,
    pub sessions: RawRecords,
}

#[derive(Debug, Clone, PartialEq)]
pub struct V4Store {
    pub sessions: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreShape {
    V2(V2Store),
    V3(V3Store),
    V4(V4Store),
    /// Empty or unknown content. `reason` is set when the caller should hear about it.
    Unrecognized { reason: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: String,
    pub migrated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub store: StoreFile,
    pub warnings: Vec<String>,
}

pub fn classify(data: &Value) -> StoreShape {
    let Some(object) = data.as_object() else {
        return StoreShape::Unrecognized { reason: None };
    };
    let sessions = object.get("sessions").and_then(Value::as_object);

    let version = match object.get("version") {
        None | Some(Value::Null) => None,
        Some(value) => match numeric_version(value) {
            Some(number) => Some(number),
            None => {
                return StoreShape::Unrecognized {
                    reason: Some(format!(
                        "Unrecognized store version {value}; starting with an empty v{STORE_VERSION} store."
                    )),
                }
            }
        },
    };

    // `0` is written by the same tools that omit the field.
    match version.filter(|value| *value != 0.0) {
        None => match sessions {
            Some(map) => StoreShape::V2(V2Store {
                sessions: object_records(map),
            }),
            None => StoreShape::Unrecognized { reason: None },
        },
        Some(value) if value == f64::from(STORE_VERSION) => match sessions {
            Some(map) => StoreShape::V4(V4Store {
                sessions: map.clone(),
            }),
            None => StoreShape::Unrecognized { reason: None },
        },
        Some(value) if value < f64::from(STORE_VERSION) => StoreShape::V3(V3Store {
            from_version: format_version(value),
            sessions: sessions.map(object_records).unwrap_or_default(),
        }),
        Some(value) => StoreShape::Unrecognized {
            reason: Some(format!(
                "Unsupported store version {}; starting with an empty v{STORE_VERSION} store.",
                format_version(value)
            )),
        },
    }
}

/// Numbers, and strings holding a number (`"3"`), count as a version.
fn numeric_version(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn format_version(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn object_records(map: &Map<String, Value>) -> RawRecords {
    map.iter()
        .filter_map(|(key, value)| value.as_object().map(|fields| (key.clone(), fields.clone())))
        .collect()
}

/// v2 records already sit under their attempt id; carry it into the legacy id
/// field unless the record names one itself.
pub fn v2_to_v3(store: V2Store, kind: StoreKind) -> V3Store {
    let field = kind.legacy_id_field();
    let sessions = store
        .sessions
        .into_iter()
        .map(|(key, mut fields)| {
            if non_empty_str(&fields, field).is_none() {
                fields.insert(field.to_string(), Value::String(key.clone()));
            }
            (key, fields)
        })
        .collect();
    V3Store {
        from_version: "2".to_string(),
        sessions,
    }
}

/// Rekey by the attempt id; records without one are skipped and counted.
pub fn v3_to_v4(store: V3Store, kind: StoreKind) -> (BTreeMap<String, Record>, MigrationReport) {
    let field = kind.legacy_id_field();
    let mut sessions = BTreeMap::new();
    let mut report = MigrationReport {
        from_version: store.from_version,
        ..MigrationReport::default()
    };
    for (_name, fields) in store.sessions {
        match non_empty_str(&fields, field) {
            Some(attempt_id) => {
                sessions.insert(attempt_id.to_string(), record_from_legacy(&fields));
                report.migrated += 1;
            }
            None => report.skipped += 1,
        }
    }
    (sessions, report)
}

/// Only the fields every legacy shape carried survive. `taskId`/`projectId`
/// are not recoverable from older stores.
fn record_from_legacy(fields: &Map<String, Value>) -> Record {
    let text = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);
    Record {
        agent: text("agent").unwrap_or_default(),
        preset: text("preset"),
        mode: text("mode"),
        executor: text("executor"),
        executor_variant: text("executorVariant"),
        model: text("model"),
        status: text("status"),
        created: text("created"),
        last_used: text("lastUsed"),
        last_prompt: text("lastPrompt"),
        forge_url: text("forgeUrl"),
        background: fields.get("background").and_then(Value::as_bool),
        ..Record::default()
    }
}

/// Keys `Record` models directly; everything else lands in `extra`.
const RECORD_FIELDS: &[&str] = &[
    "agent",
    "taskId",
    "projectId",
    "preset",
    "mode",
    "executor",
    "executorVariant",
    "model",
    "status",
    "created",
    "lastUsed",
    "lastPrompt",
    "forgeUrl",
    "background",
    "exitCode",
    "executorPid",
    "runnerPid",
];

/// Field-by-field read of a v4 entry. A value of the wrong type is dropped
/// on its own; integral floats are accepted where an integer is expected.
fn record_from_fields(fields: Map<String, Value>) -> Record {
    let text = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);
    let integer = |name: &str| fields.get(name).and_then(as_integer);
    let mut record = Record {
        agent: text("agent").unwrap_or_default(),
        task_id: text("taskId"),
        project_id: text("projectId"),
        preset: text("preset"),
        mode: text("mode"),
        executor: text("executor"),
        executor_variant: text("executorVariant"),
        model: text("model"),
        status: text("status"),
        created: text("created"),
        last_used: text("lastUsed"),
        last_prompt: text("lastPrompt"),
        forge_url: text("forgeUrl"),
        background: fields.get("background").and_then(Value::as_bool),
        exit_code: integer("exitCode").and_then(|value| i32::try_from(value).ok()),
        executor_pid: integer("executorPid").and_then(|value| u32::try_from(value).ok()),
        runner_pid: integer("runnerPid").and_then(|value| u32::try_from(value).ok()),
        ..Record::default()
    };
    record.extra = fields
        .into_iter()
        .filter(|(name, _)| !RECORD_FIELDS.contains(&name.as_str()))
        .collect();
    record
}

fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|number| number.fract() == 0.0)
            .map(|number| number as i64)
    })
}

fn non_empty_str<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

pub fn migration_warning(kind: StoreKind, report: &MigrationReport) -> String {
    let noun = kind.noun();
    let title = kind.title_plural();
    let mut message = format!(
        "Migrated {} {noun}(s) from v{} to v{STORE_VERSION}. {title} can be viewed/resumed/stopped using their IDs. Some metadata (taskId/projectId) may be incomplete for migrated {noun}s.",
        report.migrated, report.from_version
    );
    if report.skipped > 0 {
        message.push_str(&format!(
            " {} {noun}(s) without an attempt id were skipped.",
            report.skipped
        ));
    }
    message
}

/// Bring any shape up to v4. Per-record defaulting happens afterwards in the store.
pub fn normalize(shape: StoreShape, kind: StoreKind) -> Normalized {
    match shape {
        StoreShape::V4(store) => {
            let mut sessions = BTreeMap::new();
            let mut skipped = 0usize;
            let mut repaired = 0usize;
            for (key, value) in store.sessions {
                if key.is_empty() {
                    skipped += 1;
                    continue;
                }
                let Value::Object(fields) = value else {
                    skipped += 1;
                    continue;
                };
                let record = match serde_json::from_value::<Record>(Value::Object(fields.clone())) {
                    Ok(record) => record,
                    Err(_) => {
                        repaired += 1;
                        record_from_fields(fields)
                    }
                };
                sessions.insert(key, record);
            }
            let mut warnings = Vec::new();
            if skipped > 0 {
                warnings.push(format!(
                    "Skipped {skipped} unreadable {}(s) in the v{STORE_VERSION} store.",
                    kind.noun()
                ));
            }
            if repaired > 0 {
                warnings.push(format!(
                    "Ignored malformed fields in {repaired} {}(s) of the v{STORE_VERSION} store.",
                    kind.noun()
                ));
            }
            Normalized {
                store: StoreFile {
                    version: STORE_VERSION,
                    sessions,
                },
                warnings,
            }
        }
        StoreShape::V3(store) => upgrade(store, kind),
        StoreShape::V2(store) => upgrade(v2_to_v3(store, kind), kind),
        StoreShape::Unrecognized { reason } => Normalized {
            store: StoreFile::empty(),
            warnings: reason.into_iter().collect(),
        },
    }
}

fn upgrade(store: V3Store, kind: StoreKind) -> Normalized {
    let (sessions, report) = v3_to_v4(store, kind);
    Normalized {
        store: StoreFile {
            version: STORE_VERSION,
            sessions,
        },
        warnings: vec![migration_warning(kind, &report)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn classify_distinguishes_shapes() {
        assert!(matches!(
            classify(&json!({"sessions": {}})),
            StoreShape::V2(_)
        ));
        assert!(matches!(
            classify(&json!({"version": 0, "sessions": {}})),
            StoreShape::V2(_)
        ));
        assert!(matches!(
            classify(&json!({"version": 3, "sessions": {}})),
            StoreShape::V3(_)
        ));
        assert!(matches!(
            classify(&json!({"version": 4, "sessions": {}})),
            StoreShape::V4(_)
        ));
        assert_eq!(
            classify(&json!({"version": 4})),
            StoreShape::Unrecognized { reason: None }
        );
        assert_eq!(classify(&json!([])), StoreShape::Unrecognized { reason: None });
        assert!(matches!(
            classify(&json!({"version": "4", "sessions": {}})),
            StoreShape::V4(_)
        ));
    }

    #[test]
    fn future_version_is_unrecognized_with_reason() {
        match classify(&json!({"version": 7, "sessions": {"a": {"agent": "x"}}})) {
            StoreShape::Unrecognized { reason: Some(reason) } => {
                assert!(reason.contains("Unsupported store version 7"));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn v3_without_sessions_still_reports() {
        let normalized = normalize(classify(&json!({"version": 3})), StoreKind::Session);
        assert!(normalized.store.sessions.is_empty());
        assert_eq!(normalized.warnings.len(), 1);
        assert!(normalized.warnings[0].starts_with("Migrated 0 session(s) from v3 to v4."));
    }

    #[test]
    fn v2_key_fills_missing_legacy_id() {
        let shape = classify(&json!({
            "sessions": {
                "attempt-1": {"agent": "plan"},
                "friendly": {"agent": "forge", "sessionId": "attempt-2"}
            }
        }));
        let StoreShape::V2(v2) = shape else {
            panic!("expected v2");
        };
        let v3 = v2_to_v3(v2, StoreKind::Task);
        let ids: Vec<_> = v3
            .sessions
            .iter()
            .map(|(_, fields)| fields["sessionId"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(ids, vec!["attempt-1".to_string(), "attempt-2".to_string()]);
    }

    #[test]
    fn v3_rekeys_by_kind_specific_field_and_counts_skips() {
        let shape = classify(&json!({
            "version": 3,
            "sessions": {
                "brave-otter": {"agent": "implementor", "sessionId": "uuid-1", "taskId": "t"},
                "calm-heron": {"agent": "tests"},
                "empty-id": {"agent": "tests", "sessionId": ""},
                "not-an-object": 5
            }
        }));
        let normalized = normalize(shape, StoreKind::Task);
        let keys: Vec<_> = normalized.store.sessions.keys().cloned().collect();
        assert_eq!(keys, vec!["uuid-1".to_string()]);
        let record = &normalized.store.sessions["uuid-1"];
        assert_eq!(record.agent, "implementor");
        assert_eq!(record.task_id, None);
        assert_eq!(
            normalized.warnings,
            vec!["Migrated 1 task(s) from v3 to v4. Tasks can be viewed/resumed/stopped using their IDs. Some metadata (taskId/projectId) may be incomplete for migrated tasks. 2 task(s) without an attempt id were skipped.".to_string()]
        );
    }

    #[test]
    fn string_versions_are_read_as_numbers() {
        let normalized = normalize(
            classify(&json!({
                "version": "3",
                "sessions": {"calm-heron": {"agent": "plan", "sessionId": "attempt-3"}}
            })),
            StoreKind::Task,
        );
        assert!(normalized.store.sessions.contains_key("attempt-3"));
        assert!(normalized.warnings[0].starts_with("Migrated 1 task(s) from v3 to v4."));
    }

    #[test]
    fn non_numeric_version_warns() {
        let normalized = normalize(
            classify(&json!({"version": "next", "sessions": {"a": {"agent": "x"}}})),
            StoreKind::Session,
        );
        assert!(normalized.store.sessions.is_empty());
        assert_eq!(
            normalized.warnings,
            vec!["Unrecognized store version \"next\"; starting with an empty v4 store.".to_string()]
        );
    }

    #[test]
    fn v4_keeps_entries_with_malformed_fields() {
        let normalized = normalize(
            classify(&json!({
                "version": 4,
                "sessions": {
                    "good": {"agent": "a"},
                    "": {"agent": "b"},
                    "bad": "oops",
                    "null-agent": {"agent": null, "status": "running", "runnerPid": 42},
                    "float-code": {"agent": "c", "exitCode": 1.0, "background": "yes", "forgeTag": 7}
                }
            })),
            StoreKind::Session,
        );
        let keys: Vec<_> = normalized.store.sessions.keys().cloned().collect();
        assert_eq!(keys, vec!["float-code", "good", "null-agent"]);

        let null_agent = &normalized.store.sessions["null-agent"];
        assert_eq!(null_agent.agent, "");
        assert_eq!(null_agent.status.as_deref(), Some("running"));
        assert_eq!(null_agent.runner_pid, Some(42));

        let float_code = &normalized.store.sessions["float-code"];
        assert_eq!(float_code.exit_code, Some(1));
        assert_eq!(float_code.background, None);
        assert_eq!(float_code.extra.get("forgeTag"), Some(&json!(7)));

        assert_eq!(
            normalized.warnings,
            vec![
                "Skipped 2 unreadable session(s) in the v4 store.".to_string(),
                "Ignored malformed fields in 2 session(s) of the v4 store.".to_string(),
            ]
        );
    }
}
