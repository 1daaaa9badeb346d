//! Build log events and sinks.
//!
//! The engine records one [`LogEvent`] per executed command (plus section
//! entries and parser errors) in `Engine::events`, and forwards each event
//! to an optional [`LogSink`]:
//!
//! | Sink | Output |
//! |------|--------|
//! | [`TracingSink`] | `tracing` events at a level matching the state |
//! | [`JsonLinesSink`] | one JSON object per line |

use std::collections::BTreeMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::script::command::ScriptId;
use crate::script::handler::Severity;

/// State of one log event, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogState {
    Success,
    Ignore,
    Overwrite,
    Info,
    Warning,
    Error,
    ParserError,
    CriticalError,
}

impl From<Severity> for LogState {
    fn from(s: Severity) -> Self {
        match s {
            Severity::Success => LogState::Success,
            Severity::Ignore => LogState::Ignore,
            Severity::Overwrite => LogState::Overwrite,
            Severity::Info => LogState::Info,
            Severity::Warning => LogState::Warning,
            Severity::Error => LogState::Error,
            Severity::CriticalError => LogState::CriticalError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub script_id: ScriptId,
    pub section: String,
    pub line_no: usize,
    /// Keyword of the command, or `None` for engine events.
    pub command_keyword: Option<String>,
    pub state: LogState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Call depth at the time of the event (1 = script entry section).
    pub depth: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// Receives every log event as it is recorded.
pub trait LogSink {
    fn record(&mut self, event: &LogEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&mut self, e: &LogEvent) {
        let keyword = e.command_keyword.as_deref().unwrap_or("-");
        match e.state {
            LogState::Success | LogState::Ignore | LogState::Overwrite => {
                tracing::debug!(section = %e.section, line = e.line_no, keyword, state = ?e.state, "{}", e.message)
            }
            LogState::Info => {
                tracing::info!(section = %e.section, line = e.line_no, keyword, "{}", e.message)
            }
            LogState::Warning => {
                tracing::warn!(section = %e.section, line = e.line_no, keyword, "{}", e.message)
            }
            LogState::Error | LogState::ParserError | LogState::CriticalError => {
                tracing::error!(section = %e.section, line = e.line_no, keyword, state = ?e.state, "{}", e.message)
            }
        }
    }
}

/// Writes each event as a JSON line.
pub struct JsonLinesSink<W: Write> {
    out: W,
    failed: bool,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesSink { out, failed: false }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> LogSink for JsonLinesSink<W> {
    fn record(&mut self, event: &LogEvent) {
        if self.failed {
            return;
        }
        let result = serde_json::to_writer(&mut self.out, event)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        if let Err(e) = result {
            // Report once; the run itself carries on.
            tracing::warn!(error = %e, "JSON log sink failed, disabling");
            self.failed = true;
        }
    }
}

/// Fans one event out to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn LogSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn LogSink>) {
        self.sinks.push(sink);
    }
}

impl LogSink for MultiSink {
    fn record(&mut self, event: &LogEvent) {
        for sink in &mut self.sinks {
            sink.record(event);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
