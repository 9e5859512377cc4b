//! Sync progress reporting.
//!
//! Reports observable progress during `gsync sync` so users see which gallery
//! is in which stage and how many files are left. Progress is emitted on
//! **stderr** so the stdout summary remains parseable for scripts.

use std::io::Write;

use crate::pipeline::Stage;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Gallery entered a new pipeline stage.
    Stage { gallery: String, stage: Stage },
    /// Normalizing: n files processed out of total.
    Normalizing { gallery: String, n: u64, total: u64 },
    /// Uploading: n files attempted out of total.
    Uploading { gallery: String, n: u64, total: u64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the pipeline.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync newborn  uploading  12 / 1,048 files".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Stage { gallery, stage } => {
                format!("sync {}  {}...\n", gallery, stage)
            }
            SyncProgressEvent::Normalizing { gallery, n, total } => format!(
                "sync {}  normalizing  {} / {} files\n",
                gallery,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Uploading { gallery, n, total } => format!(
                "sync {}  uploading  {} / {} files\n",
                gallery,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &SyncProgressEvent) -> serde_json::Value {
        match event {
            SyncProgressEvent::Stage { gallery, stage } => serde_json::json!({
                "event": "stage",
                "gallery": gallery,
                "stage": stage.to_string(),
            }),
            SyncProgressEvent::Normalizing { gallery, n, total } => serde_json::json!({
                "event": "progress",
                "gallery": gallery,
                "phase": "normalizing",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Uploading { gallery, n, total } => serde_json::json!({
                "event": "progress",
                "gallery": gallery,
                "phase": "uploading",
                "n": n,
                "total": total
            }),
        }
    }
}

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
