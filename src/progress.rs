//! Stage progress reporting.
//!
//! Reports observable progress while a stage command runs, so operators see
//! which batch and member the engine is working on during multi-hour runs.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::Stage;

/// A single progress event for a stage run.
#[derive(Clone, Debug)]
pub enum StageProgressEvent {
    /// Starting batch `n` of `total` for the transition out of `stage`.
    Batch {
        stage: Stage,
        batch_id: String,
        n: u64,
        total: u64,
        members: u64,
    },
    /// Engine call `step` started for member `n` of `total` (or for the
    /// whole batch, when `id` is `None`).
    Step {
        stage: Stage,
        batch_id: String,
        id: Option<String>,
        step: String,
        n: u64,
        total: u64,
    },
}

/// Reports stage progress. Implementations write to stderr (human or JSON).
pub trait StageProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the stage runner.
    fn report(&self, event: StageProgressEvent);
}

/// Human-friendly progress on stderr: "extracted  b001-1a2b3c4d  extract  TCRMP..._T2  2 / 5".
pub struct StderrProgress;

impl StageProgressReporter for StderrProgress {
    fn report(&self, event: StageProgressEvent) {
        let line = match &event {
            StageProgressEvent::Batch {
                stage,
                batch_id,
                n,
                total,
                members,
            } => format!(
                "{}  batch {} / {}  {}  ({} members)\n",
                stage,
                format_number(*n),
                format_number(*total),
                batch_id,
                format_number(*members)
            ),
            StageProgressEvent::Step {
                stage,
                batch_id,
                id,
                step,
                n,
                total,
            } => format!(
                "{}  {}  {}  {}  {} / {}\n",
                stage,
                batch_id,
                step,
                id.as_deref().unwrap_or("*"),
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl StageProgressReporter for JsonProgress {
    fn report(&self, event: StageProgressEvent) {
        let obj = match &event {
            StageProgressEvent::Batch {
                stage,
                batch_id,
                n,
                total,
                members,
            } => serde_json::json!({
                "event": "batch",
                "stage": stage,
                "batch_id": batch_id,
                "n": n,
                "total": total,
                "members": members
            }),
            StageProgressEvent::Step {
                stage,
                batch_id,
                id,
                step,
                n,
                total,
            } => serde_json::json!({
                "event": "step",
                "stage": stage,
                "batch_id": batch_id,
                "id": id,
                "step": step,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl StageProgressReporter for NoProgress {
    fn report(&self, _event: StageProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn StageProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1200), "1,200");
        assert_eq!(format_number(3_000_000), "3,000,000");
    }
}
