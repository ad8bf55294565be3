use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Lifecycle state the backend reports for a run.
///
/// The wire format is not uniform: the worker writes `QUEUED`, `RUNNING`,
/// `COMPLETED`, `FAILED` and `ERROR`, the step instrumentation registers runs
/// as `running`/`completed`, and the admin surface also reports `SUCCESS` for
/// completed runs. Parsing is case-insensitive and maps synonyms; anything
/// unrecognized becomes `Unknown` (non-terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Error,
    Unknown,
}

impl RunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "queued" => RunStatus::Queued,
            "running" => RunStatus::Running,
            "completed" | "success" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "error" => RunStatus::Error,
            _ => RunStatus::Unknown,
        }
    }

    /// Terminal runs never change again; pollers stop on these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Error
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Error => "ERROR",
            RunStatus::Unknown => "UNKNOWN",
        };
        f.pad(s)
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(RunStatus::parse(&raw))
    }
}

/// One execution of a backend script. Created and mutated exclusively by the
/// backend; this client only ever reads it.
///
/// Timestamps stay as the strings the backend stores (lenient ISO-8601, with
/// or without an offset); [`parse_timestamp`] converts them when duration or
/// clock display is needed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(default)]
    pub script_name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
}

/// A run plus its full log-event history, as returned by `GET /api/runs/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSnapshot {
    pub run: RunRecord,
    #[serde(default)]
    pub logs: Vec<LogEvent>,
}

/// Admin list rows carry requester metadata alongside the run itself.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminRun {
    #[serde(flatten)]
    pub run: RunRecord,
    #[serde(default)]
    pub meta: RunMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunMeta {
    #[serde(default)]
    pub email: Option<String>,
    /// Requested lead limit. The backend stores this as a string.
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// One raw record from a run's append-only event stream.
///
/// `data` is externally produced and untrusted: it may be an inline JSON
/// object or a JSON document serialized into a string, and individual entries
/// may be malformed. [`parse_log`] turns it into a typed [`LogData`].
#[derive(Debug, Clone, Deserialize)]
pub struct LogEvent {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub timestamp: String,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Validated, event-type-tagged payload of a [`LogEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum LogData {
    StepStart {
        step_id: String,
        step_name: String,
    },
    StepEnd {
        step_id: String,
        /// Raw status marker. The reducer compares it against the literal
        /// `"success"` (exact, case-sensitive) per the backend contract.
        status: Option<String>,
        output: Option<String>,
    },
    /// One captured stdout line from the worker's output tee.
    ScriptOutput { stdout: String },
    Error {
        step_id: Option<String>,
        step_name: Option<String>,
        error: String,
    },
}

/// A log event whose payload survived validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLog {
    pub timestamp: String,
    pub data: LogData,
}

#[derive(Debug, Error)]
pub enum LogParseError {
    #[error("unrecognized event type {0:?}")]
    UnknownEventType(String),
    #[error("data payload is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("data payload is not an object")]
    NotAnObject,
    #[error("data payload missing field {0:?}")]
    MissingField(&'static str),
}

/// Validate a single log entry. Event types are matched case-insensitively:
/// the step instrumentation emits `step_start`/`step_end`/`error`, while the
/// worker's stdout tee emits `SCRIPT_OUTPUT`.
pub fn parse_log(event: &LogEvent) -> Result<ParsedLog, LogParseError> {
    let data = match &event.data {
        serde_json::Value::String(raw) => serde_json::from_str::<serde_json::Value>(raw)?,
        other => other.clone(),
    };
    if !data.is_object() {
        return Err(LogParseError::NotAnObject);
    }

    let data = match event.event_type.to_ascii_lowercase().as_str() {
        "step_start" => LogData::StepStart {
            step_id: required_str(&data, "step_id")?,
            step_name: required_str(&data, "step_name")?,
        },
        "step_end" => LogData::StepEnd {
            step_id: required_str(&data, "step_id")?,
            status: optional_str(&data, "status"),
            output: optional_str(&data, "output"),
        },
        "script_output" => LogData::ScriptOutput {
            stdout: required_str(&data, "stdout")?,
        },
        "error" => LogData::Error {
            step_id: optional_str(&data, "step_id"),
            step_name: optional_str(&data, "step_name"),
            error: optional_str(&data, "error").unwrap_or_default(),
        },
        _ => return Err(LogParseError::UnknownEventType(event.event_type.clone())),
    };

    Ok(ParsedLog {
        timestamp: event.timestamp.clone(),
        data,
    })
}

/// Validate a whole snapshot's log list. A malformed entry is skipped, never
/// fatal: the stream is produced by external scripts and partial records are
/// expected.
pub fn parse_logs(events: &[LogEvent]) -> Vec<ParsedLog> {
    events
        .iter()
        .filter_map(|event| match parse_log(event) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::debug!(id = event.id, error = %e, "skipping malformed log entry");
                None
            }
        })
        .collect()
}

/// Backend timestamps are ISO-8601 but not consistently offset-qualified
/// (the worker writes naive UTC strings). Accept both.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}

fn required_str(data: &serde_json::Value, field: &'static str) -> Result<String, LogParseError> {
    data.get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or(LogParseError::MissingField(field))
}

fn optional_str(data: &serde_json::Value, field: &str) -> Option<String> {
    data.get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}
