//! Structured logging for the protocol engine.
//!
//! Hand-rolled and allocation-light: a bounded set of key/value fields
//! per entry, rendered either as a single JSON object or as a compact
//! line. The logger is a value owned by the engine (no global registry)
//! and writes through a [`LogSink`] so embedders and tests can capture
//! output.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Hard cap on fields per entry; extra fields are dropped silently.
pub const MAX_LOG_FIELDS: usize = 16;

/// Log severity levels, in increasing order of importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lowercase name, as emitted in JSON output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Single-character tag for compact output.
    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Self::Trace => 'T',
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
        }
    }
}

/// One log record: level, target module, message, optional connection
/// id, and bounded key/value fields.
#[derive(Debug)]
pub struct LogEntry {
    level: LogLevel,
    target: &'static str,
    message: String,
    conn: Option<u64>,
    fields: Vec<(&'static str, String)>,
    timestamp_ns: u64,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, target: &'static str, message: impl Into<String>) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            level,
            target,
            message: message.into(),
            conn: None,
            fields: Vec::new(),
            timestamp_ns,
        }
    }

    /// Attach the connection this entry concerns.
    #[must_use]
    pub fn conn(mut self, id: u64) -> Self {
        self.conn = Some(id);
        self
    }

    /// Attach one key/value field; entries beyond [`MAX_LOG_FIELDS`]
    /// are dropped.
    #[must_use]
    pub fn field(mut self, key: &'static str, value: impl std::fmt::Display) -> Self {
        if self.fields.len() < MAX_LOG_FIELDS {
            self.fields.push((key, value.to_string()));
        }
        self
    }

    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Render as a single-line JSON object.
    #[must_use]
    pub fn to_json(&self, include_target: bool, max_fields: usize) -> String {
        let mut out = String::with_capacity(96);
        out.push('{');
        let _ = write!(out, "\"ts\":{}", self.timestamp_ns);
        let _ = write!(out, ",\"level\":\"{}\"", self.level.as_str());
        if include_target {
            out.push_str(",\"target\":\"");
            escape_json(self.target, &mut out);
            out.push('"');
        }
        out.push_str(",\"msg\":\"");
        escape_json(&self.message, &mut out);
        out.push('"');
        if let Some(conn) = self.conn {
            let _ = write!(out, ",\"conn\":{conn}");
        }
        if !self.fields.is_empty() {
            out.push_str(",\"fields\":{");
            for (i, (key, value)) in self.fields.iter().take(max_fields).enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                escape_json(key, &mut out);
                out.push_str("\":\"");
                escape_json(value, &mut out);
                out.push('"');
            }
            out.push('}');
        }
        out.push('}');
        out
    }

    /// Render as a compact human-readable line.
    #[must_use]
    pub fn to_compact(&self, include_target: bool, max_fields: usize) -> String {
        let mut out = String::with_capacity(64);
        out.push(self.level.as_char());
        if include_target {
            let _ = write!(out, " {}", self.target);
        }
        let _ = write!(out, " {}", self.message);
        if let Some(conn) = self.conn {
            let _ = write!(out, " conn={conn}");
        }
        for (key, value) in self.fields.iter().take(max_fields) {
            let _ = write!(out, " {key}={value}");
        }
        out
    }
}

fn escape_json(input: &str, out: &mut String) {
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if u32::from(c) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", u32::from(c));
            }
            c => out.push(c),
        }
    }
}

/// Logger configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Entries below this level are discarded.
    pub min_level: LogLevel,
    /// Render JSON objects instead of compact lines.
    pub json_output: bool,
    /// Include the target module in rendered output.
    pub include_target: bool,
    /// Fields rendered per entry, capped at [`MAX_LOG_FIELDS`].
    pub max_fields: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            json_output: false,
            include_target: true,
            max_fields: MAX_LOG_FIELDS,
        }
    }
}

impl LogConfig {
    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    #[must_use]
    pub fn with_json_output(mut self, json: bool) -> Self {
        self.json_output = json;
        self
    }

    #[must_use]
    pub fn with_include_target(mut self, include: bool) -> Self {
        self.include_target = include;
        self
    }
}

/// Receives rendered log lines.
pub trait LogSink: Send {
    fn write_line(&mut self, line: &str);
}

/// Default sink: standard error, one line per entry.
#[derive(Debug, Default)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

/// Test sink collecting rendered lines behind a shared handle.
#[derive(Debug, Default)]
pub struct CaptureSink {
    lines: std::sync::Arc<Mutex<Vec<String>>>,
}

impl CaptureSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that stays valid after the sink moves into a logger.
    #[must_use]
    pub fn handle(&self) -> std::sync::Arc<Mutex<Vec<String>>> {
        std::sync::Arc::clone(&self.lines)
    }
}

impl LogSink for CaptureSink {
    fn write_line(&mut self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Engine-owned logger: level filter, renderer, sink.
pub struct Logger {
    config: LogConfig,
    sink: Mutex<Box<dyn LogSink>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

impl Logger {
    /// Logger writing compact or JSON lines to standard error.
    #[must_use]
    pub fn new(config: LogConfig) -> Self {
        Self::with_sink(config, Box::new(StderrSink))
    }

    /// Logger writing to a caller-supplied sink.
    #[must_use]
    pub fn with_sink(config: LogConfig, sink: Box<dyn LogSink>) -> Self {
        Self {
            config,
            sink: Mutex::new(sink),
        }
    }

    /// True when entries at `level` would be emitted; lets callers
    /// skip building expensive entries.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.config.min_level
    }

    /// Filter, render and write one entry.
    pub fn log(&self, entry: &LogEntry) {
        if !self.enabled(entry.level) {
            return;
        }
        let line = if self.config.json_output {
            entry.to_json(self.config.include_target, self.config.max_fields)
        } else {
            entry.to_compact(self.config.include_target, self.config.max_fields)
        };
        self.sink.lock().write_line(&line);
    }
}

// ============================================================================
// Tests
// ============================================================================
