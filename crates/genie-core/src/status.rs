use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Serialize, Serializer};

use crate::executor::executor_label;
use crate::process::ProcessProbe;
use crate::store::Record;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_UNKNOWN: &str = "unknown";

/// What a listing should show for a record once liveness is taken into account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayStatus {
    Running,
    /// Executor exited, runner has not reported yet.
    PendingCompletion,
    Completed,
    FailedWithCode(i32),
    Stopped,
    /// Trusted as written (terminal or otherwise not cross-checked).
    Persisted(String),
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayStatus::Running => f.write_str(STATUS_RUNNING),
            DisplayStatus::PendingCompletion => f.write_str("pending-completion"),
            DisplayStatus::Completed => f.write_str(STATUS_COMPLETED),
            DisplayStatus::FailedWithCode(code) => write!(f, "failed ({code})"),
            DisplayStatus::Stopped => f.write_str(STATUS_STOPPED),
            DisplayStatus::Persisted(status) => f.write_str(status),
        }
    }
}

impl Serialize for DisplayStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Pure reconciliation of a persisted status against two liveness signals.
pub fn reconcile(
    persisted: Option<&str>,
    exit_code: Option<i32>,
    executor_alive: bool,
    runner_alive: bool,
) -> DisplayStatus {
    let base = persisted.filter(|status| !status.is_empty()).unwrap_or(STATUS_UNKNOWN);

    if base == STATUS_RUNNING {
        return match (executor_alive, runner_alive, exit_code) {
            (true, _, _) => DisplayStatus::Running,
            (false, true, _) => DisplayStatus::PendingCompletion,
            (false, false, Some(0)) => DisplayStatus::Completed,
            (false, false, Some(code)) => DisplayStatus::FailedWithCode(code),
            (false, false, None) => DisplayStatus::Stopped,
        };
    }

    if base == STATUS_COMPLETED || base == STATUS_FAILED {
        return DisplayStatus::Persisted(base.to_string());
    }

    if executor_alive || runner_alive {
        DisplayStatus::Running
    } else {
        DisplayStatus::Persisted(base.to_string())
    }
}

pub fn display_status(record: &Record, probe: &dyn ProcessProbe) -> DisplayStatus {
    reconcile(
        record.status.as_deref(),
        record.exit_code,
        probe.is_alive(record.executor_pid),
        probe.is_alive(record.runner_pid),
    )
}

/// A record as listings present it: keyed, reconciled, and flattened.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView<'a> {
    pub id: &'a str,
    pub display_status: DisplayStatus,
    #[serde(flatten)]
    pub record: &'a Record,
}

impl<'a> RecordView<'a> {
    pub fn new(id: &'a str, record: &'a Record, probe: &dyn ProcessProbe) -> Self {
        Self {
            id,
            display_status: display_status(record, probe),
            record,
        }
    }

    /// `id | agent | status | executor | last used`, with `-` for gaps.
    pub fn render_line(&self) -> String {
        let record = self.record;
        format!(
            "{} | {} | {} | {} | {}",
            self.id,
            if record.agent.is_empty() { "-" } else { &record.agent },
            self.display_status,
            record.executor.as_deref().unwrap_or("-"),
            record
                .last_used
                .as_deref()
                .or(record.created.as_deref())
                .unwrap_or("-")
        )
    }

    /// `label: value` lines for a single-record view; absent fields are omitted.
    pub fn render_details(&self) -> Vec<String> {
        let record = self.record;
        let mut lines = vec![
            format!("id: {}", self.id),
            format!("agent: {}", record.agent),
            format!(
                "status: {} (persisted: {})",
                self.display_status,
                record.status.as_deref().unwrap_or(STATUS_UNKNOWN)
            ),
        ];
        if let Some(executor) = record.executor.as_deref() {
            lines.push(format!("executor: {} ({})", executor, executor_label(executor)));
        }
        let optional = [
            ("variant", record.executor_variant.as_deref()),
            ("model", record.model.as_deref()),
            ("mode", record.mode.as_deref()),
            ("task", record.task_id.as_deref()),
            ("project", record.project_id.as_deref()),
            ("created", record.created.as_deref()),
            ("last used", record.last_used.as_deref()),
            ("forge", record.forge_url.as_deref()),
            ("last prompt", record.last_prompt.as_deref()),
        ];
        for (label, value) in optional {
            if let Some(value) = value {
                lines.push(format!("{label}: {value}"));
            }
        }
        if let Some(code) = record.exit_code {
            lines.push(format!("exit code: {code}"));
        }
        lines
    }
}

/// Reconciled views in most-recently-used order.
pub fn list_views<'a>(
    sessions: impl IntoIterator<Item = (&'a String, &'a Record)>,
    probe: &dyn ProcessProbe,
) -> Vec<RecordView<'a>> {
    let mut entries: Vec<(&str, &Record)> = sessions
        .into_iter()
        .map(|(id, record)| (id.as_str(), record))
        .collect();
    sort_by_last_used(&mut entries);
    entries
        .into_iter()
        .map(|(id, record)| RecordView::new(id, record, probe))
        .collect()
}

fn recency(record: &Record) -> Option<DateTime<FixedOffset>> {
    record
        .last_used
        .as_deref()
        .or(record.created.as_deref())
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
}

/// Most recently used first; records without a usable timestamp sink to the end.
pub fn sort_by_last_used<'a>(entries: &mut [(&'a str, &'a Record)]) {
    entries.sort_by(|(left_key, left), (right_key, right)| {
        match (recency(left), recency(right)) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| left_key.cmp(right_key))
    });
}
