//! Logging setup
//!
//! Installs the `tracing` subscriber and provides [`LogTail`], a bounded
//! in-memory copy of recent log lines for a live log view.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::lock;

/// Default number of lines kept by a [`LogTail`]
pub const DEFAULT_TAIL_CAPACITY: usize = 500;

/// One captured log event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub level: String,
    /// Module path of the event
    pub target: String,
    pub message: String,
}

/// Collects the message and structured fields of an event
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Ring buffer of recent log lines, shareable between the subscriber and a UI
#[derive(Debug, Clone)]
pub struct LogTail {
    capacity: usize,
    lines: Arc<Mutex<VecDeque<LogLine>>>,
}

impl Default for LogTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_CAPACITY)
    }
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// Append a line, evicting the oldest once full
    pub fn push(&self, line: LogLine) {
        let mut lines = lock(&self.lines);
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot, oldest first
    pub fn lines(&self) -> Vec<LogLine> {
        lock(&self.lines).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.lines).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.lines).clear();
    }
}

impl<S> Layer<S> for LogTail
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        self.push(LogLine {
            timestamp: Local::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: format!("{}{}", visitor.message, visitor.fields),
        });
    }
}

/// Install the global subscriber: `RUST_LOG` if set, otherwise
/// `default_filter`, printing to stderr and optionally feeding `tail`.
///
/// Returns `Ok(false)` if a global subscriber was already installed.
pub fn init(default_filter: &str, tail: Option<LogTail>) -> Result<bool, ParseError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(tail)
        .try_init()
        .is_ok();
    Ok(installed)
}
