use std::sync::LazyLock;

use regex::Regex;

use crate::runs::model::{LogData, ParsedLog};

// Contract with the backend: scripts announce their deliverable by printing
// a line containing `Sheet URL: <link>`. This label is the only
// machine-readable signal in otherwise opaque script output.
static SHEET_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Sheet URL:\s*(\S+)").expect("valid pattern"));

/// Extract the first sheet link from a piece of output text.
pub fn find_sheet_url(text: &str) -> Option<&str> {
    SHEET_URL
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Scan a run's parsed log stream, in event order, for a sheet link.
/// Both step outputs and raw stdout lines can carry the label. First match
/// wins; callers retain it for the lifetime of the run.
pub fn scan_logs(logs: &[ParsedLog]) -> Option<String> {
    for log in logs {
        let text = match &log.data {
            LogData::ScriptOutput { stdout } => stdout.as_str(),
            LogData::StepEnd {
                output: Some(output),
                ..
            } => output.as_str(),
            _ => continue,
        };
        if let Some(url) = find_sheet_url(text) {
            return Some(url.to_string());
        }
    }
    None
}
