use std::collections::HashMap;

use crate::runs::model::{AdminRun, RunRecord, RunStatus, parse_timestamp};
use crate::runs::steps::{Step, StepStatus};
use crate::runs::watch::RunView;

/// Step output is attached verbatim by the backend; previews are capped the
/// same way the instrumentation caps them.
pub const OUTPUT_PREVIEW_LIMIT: usize = 500;

pub fn run_header(run: &RunRecord) -> String {
    format!("run {}  {}  {}", short_id(run), run.script_name, run.status)
}

/// Closing lines for a watched run: outcome, duration when derivable, and
/// the deliverable link (or its explicit absence, which is not an error).
pub fn final_summary(view: &RunView) -> String {
    let mut lines = Vec::new();

    let duration = run_duration(&view.run)
        .map(|d| format!(" in {}", format_duration(d)))
        .unwrap_or_default();
    match view.run.status {
        RunStatus::Completed => lines.push(format!("run completed{duration}")),
        RunStatus::Failed | RunStatus::Error => {
            lines.push(format!("run {}{}", view.run.status, duration));
        }
        other => lines.push(format!("run ended with status {other}")),
    }

    match (&view.sheet_url, view.run.status) {
        (Some(url), _) => lines.push(format!("sheet: {url}")),
        (None, RunStatus::Completed) => {
            lines.push("no sheet link found in logs".to_string());
        }
        _ => {}
    }

    lines.join("\n")
}

pub fn runs_table(runs: &[RunRecord]) -> String {
    let mut out = format!(
        "{:<38} {:<30} {:<10} {:>8}\n",
        "RUN", "SCRIPT", "STATUS", "TIME"
    );
    for run in runs {
        let duration = run_duration(run)
            .map(format_duration)
            .unwrap_or_default();
        out.push_str(&format!(
            "{:<38} {:<30} {:<10} {:>8}\n",
            run.run_id, run.script_name, run.status.to_string(), duration
        ));
    }
    out
}

pub fn admin_table(runs: &[AdminRun]) -> String {
    let mut out = format!(
        "{:<10} {:<28} {:<10} {:<26} {:>6}\n",
        "RUN", "SCRIPT", "STATUS", "EMAIL", "LEADS"
    );
    for entry in runs {
        out.push_str(&format!(
            "{:<10} {:<28} {:<10} {:<26} {:>6}\n",
            short_id(&entry.run),
            entry.run.script_name,
            entry.run.status.to_string(),
            entry.meta.email.as_deref().unwrap_or("-"),
            entry.meta.limit.as_deref().unwrap_or("-"),
        ));
    }
    out
}

#[derive(Debug, PartialEq, Eq)]
pub struct AdminStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub requested_leads: u64,
}

/// Aggregate line for the admin view: completed counts include the SUCCESS
/// synonym (already normalized at parse time), failed counts include ERROR,
/// and the lead total sums whatever `meta.limit` values parse as numbers.
pub fn admin_stats(runs: &[AdminRun]) -> AdminStats {
    AdminStats {
        total: runs.len(),
        completed: runs
            .iter()
            .filter(|r| r.run.status == RunStatus::Completed)
            .count(),
        failed: runs
            .iter()
            .filter(|r| matches!(r.run.status, RunStatus::Failed | RunStatus::Error))
            .count(),
        requested_leads: runs
            .iter()
            .filter_map(|r| r.meta.limit.as_deref())
            .filter_map(|l| l.parse::<u64>().ok())
            .sum(),
    }
}

pub fn stats_line(stats: &AdminStats) -> String {
    format!(
        "{} runs  {} completed  {} failed  {} leads requested",
        stats.total, stats.completed, stats.failed, stats.requested_leads
    )
}

/// Prints step transitions across successive snapshots of the same run:
/// a line when a step first appears, another when its status changes.
/// Snapshots are full rebuilds, so this is the diffing point between polls.
pub struct StepPrinter {
    seen: HashMap<String, StepStatus>,
}

impl StepPrinter {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    pub fn announce(&mut self, steps: &[Step]) -> Vec<String> {
        let mut lines = Vec::new();
        for step in steps {
            match self.seen.get(&step.id) {
                None => {
                    lines.push(start_line(step));
                    if step.status != StepStatus::Running {
                        lines.push(finish_line(step));
                    }
                }
                Some(prev) if *prev != step.status => lines.push(finish_line(step)),
                _ => {}
            }
            self.seen.insert(step.id.clone(), step.status);
        }
        lines
    }
}

fn start_line(step: &Step) -> String {
    format!("→ {} [{}]", step.name, clock(&step.start_time))
}

fn finish_line(step: &Step) -> String {
    match step.status {
        StepStatus::Success => match step.output.as_deref().map(preview) {
            Some(p) if !p.is_empty() => format!("✓ {}: {}", step.name, p),
            _ => format!("✓ {}", step.name),
        },
        StepStatus::Failed => {
            let detail = step
                .error
                .as_deref()
                .or(step.output.as_deref())
                .map(preview)
                .unwrap_or_default();
            if detail.is_empty() {
                format!("✗ {}", step.name)
            } else {
                format!("✗ {}: {}", step.name, detail)
            }
        }
        StepStatus::Running => start_line(step),
    }
}

/// First line of the text, capped at [`OUTPUT_PREVIEW_LIMIT`] characters.
fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    match line.char_indices().nth(OUTPUT_PREVIEW_LIMIT) {
        Some((i, _)) => format!("{}...", &line[..i]),
        None => line.to_string(),
    }
}

fn clock(raw: &str) -> String {
    parse_timestamp(raw)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn short_id(run: &RunRecord) -> &str {
    run.run_id.split('-').next().unwrap_or(&run.run_id)
}

fn run_duration(run: &RunRecord) -> Option<chrono::TimeDelta> {
    let start = parse_timestamp(&run.start_time)?;
    let end = parse_timestamp(run.end_time.as_deref()?)?;
    (end >= start).then(|| end - start)
}

fn format_duration(delta: chrono::TimeDelta) -> String {
    let secs = delta.num_seconds();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
