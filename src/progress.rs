//! Run progress reporting.
//!
//! Reports observable progress during `integrator run` so users see which
//! sources are being fetched and how far merging has got. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::pipeline::RunStage;

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// The run entered a new stage.
    Stage { stage: RunStage },
    /// A page was fetched from a source.
    Fetched {
        source: String,
        pages: u64,
        records: u64,
    },
    /// A source gave up after exhausting its retries.
    SourceFailed { source: String, reason: String },
    /// Merge + persist: n groups done out of total.
    Merging { n: u64, total: u64 },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the fetch workers and the pipeline.
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run http:openlibrary  fetched 1,200 records (12 pages)".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Stage { stage } => format!("run  {}\n", stage),
            RunProgressEvent::Fetched {
                source,
                pages,
                records,
            } => format!(
                "run {}  fetched {} records ({} page{})\n",
                source,
                format_number(*records),
                format_number(*pages),
                if *pages == 1 { "" } else { "s" }
            ),
            RunProgressEvent::SourceFailed { source, reason } => {
                format!("run {}  FAILED: {}\n", source, reason)
            }
            RunProgressEvent::Merging { n, total } => format!(
                "run  merging  {} / {} groups\n",
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Stage { stage } => serde_json::json!({
                "event": "stage",
                "stage": stage,
            }),
            RunProgressEvent::Fetched {
                source,
                pages,
                records,
            } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "fetching",
                "pages": pages,
                "records": records
            }),
            RunProgressEvent::SourceFailed { source, reason } => serde_json::json!({
                "event": "source_failed",
                "source": source,
                "reason": reason
            }),
            RunProgressEvent::Merging { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "merging",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
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

    /// Parse `off`, `human` or `json`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> std::sync::Arc<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
