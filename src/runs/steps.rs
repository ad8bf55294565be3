use std::collections::HashMap;

use crate::runs::model::{LogData, ParsedLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

/// One node in the reconstructed execution graph, derived entirely from the
/// log stream. Steps are never persisted; every poll rebuilds the full list.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub start_time: String,
    pub end_time: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Rebuild the step list from a full log history.
///
/// Pure and deterministic: the same input always yields the same output, so
/// callers re-run it on every poll instead of folding increments. Rules:
/// - first `StepStart` per id wins, re-delivered starts are ignored
/// - `StepEnd` only applies to a seen id; orphan ends are dropped
/// - duplicate `StepEnd`s apply last-wins (a poll-fresh, growing log list is
///   the delivery model, so the latest terminal event is authoritative)
/// - the `"success"` marker is matched exactly, case-sensitive; any other
///   value, including a missing one, means the step failed
pub fn reduce_steps(logs: &[ParsedLog]) -> Vec<Step> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut steps: Vec<Step> = Vec::new();

    for log in logs {
        match &log.data {
            LogData::StepStart { step_id, step_name } => {
                if index.contains_key(step_id.as_str()) {
                    continue;
                }
                index.insert(step_id, steps.len());
                steps.push(Step {
                    id: step_id.clone(),
                    name: step_name.clone(),
                    status: StepStatus::Running,
                    start_time: log.timestamp.clone(),
                    end_time: None,
                    output: None,
                    error: None,
                });
            }
            LogData::StepEnd {
                step_id,
                status,
                output,
            } => {
                let Some(&i) = index.get(step_id.as_str()) else {
                    continue;
                };
                let step = &mut steps[i];
                step.status = if status.as_deref() == Some("success") {
                    StepStatus::Success
                } else {
                    StepStatus::Failed
                };
                step.end_time = Some(log.timestamp.clone());
                step.output = output.clone();
            }
            LogData::Error {
                step_id: Some(step_id),
                error,
                ..
            } => {
                if let Some(&i) = index.get(step_id.as_str()) {
                    steps[i].error = Some(error.clone());
                }
            }
            _ => {}
        }
    }

    steps
}
