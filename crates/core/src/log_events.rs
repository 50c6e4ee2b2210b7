//! Pattern table for the ComfyUI process log stream.
//!
//! The launched process writes progress bars, percent lines and a
//! terminal "Prompt executed" line to stdout. Each line is matched
//! against a table of patterns supplied as data; the first match is
//! turned into a typed [`LogEvent`] and handed to a [`LogEventSink`].

use std::sync::LazyLock;

use regex::Regex;

/// Typed event recognized on a single log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// `"  4%|4         | 1/25 [00:02<00:59,  2.50s/it]"`
    StepProgress { percent: f64, current: u32, total: u32 },
    /// `"Progress: 45.5%"`
    PercentProgress { percent: f64 },
    /// `"Prompt executed in 12.34 seconds"`
    PromptExecuted { seconds: f64 },
    /// The HTTP server is up and accepting prompts.
    ServerStarted,
    /// A line mentioning an error or exception.
    ErrorLine { line: String },
}

/// Which event a pattern produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEventKind {
    StepProgress,
    PercentProgress,
    PromptExecuted,
    ServerStarted,
    ErrorLine,
}

/// Receives events recognized on the log stream.
///
/// Called from the I/O task that reads the child process output, so
/// implementations must be cheap and thread-safe.
pub trait LogEventSink: Send + Sync {
    fn on_event(&self, event: LogEvent);
}

/// A single pattern → event mapping.
#[derive(Debug, Clone)]
pub struct LogPattern {
    pub kind: LogEventKind,
    pub regex: Regex,
}

impl LogPattern {
    pub fn new(kind: LogEventKind, regex: Regex) -> Self {
        Self { kind, regex }
    }
}

pub const STEP_PROGRESS_PATTERN: &str = r"\s*([0-9]+)%\|.*\|\s*([0-9]+)/([0-9]+)";
pub const PERCENT_PROGRESS_PATTERN: &str = r"Progress: ([0-9.]+)%";
pub const PROMPT_EXECUTED_PATTERN: &str = r"Prompt executed in ([0-9.]+) seconds";
pub const SERVER_STARTED_PATTERN: &str = r"Starting server|To see the GUI go to";
pub const ERROR_LINE_PATTERN: &str = r"Error:|Exception:";

static STANDARD_PATTERNS: LazyLock<Vec<LogPattern>> = LazyLock::new(|| {
    [
        (LogEventKind::PromptExecuted, PROMPT_EXECUTED_PATTERN),
        (LogEventKind::StepProgress, STEP_PROGRESS_PATTERN),
        (LogEventKind::PercentProgress, PERCENT_PROGRESS_PATTERN),
        (LogEventKind::ServerStarted, SERVER_STARTED_PATTERN),
        (LogEventKind::ErrorLine, ERROR_LINE_PATTERN),
    ]
    .into_iter()
    .map(|(kind, pattern)| LogPattern::new(kind, Regex::new(pattern).expect("valid regex")))
    .collect()
});

/// Ordered list of patterns; the first match wins.
#[derive(Debug, Clone)]
pub struct LogPatternTable {
    patterns: Vec<LogPattern>,
}

impl Default for LogPatternTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl LogPatternTable {
    pub fn new(patterns: Vec<LogPattern>) -> Self {
        Self { patterns }
    }

    /// The ComfyUI patterns: completion, step bar, percent, server
    /// start, error lines.
    pub fn standard() -> Self {
        Self::new(STANDARD_PATTERNS.clone())
    }

    /// Match `line` against the table.
    ///
    /// A line that matches a pattern but whose captures do not parse is
    /// logged and skipped; later patterns are still tried.
    pub fn parse_line(&self, line: &str) -> Option<LogEvent> {
        for pattern in &self.patterns {
            let Some(caps) = pattern.regex.captures(line) else {
                continue;
            };
            let capture = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();

            let event = match pattern.kind {
                LogEventKind::StepProgress => {
                    match (capture(1).parse(), capture(2).parse(), capture(3).parse()) {
                        (Ok(percent), Ok(current), Ok(total)) => Some(LogEvent::StepProgress {
                            percent,
                            current,
                            total,
                        }),
                        _ => None,
                    }
                }
                LogEventKind::PercentProgress => capture(1)
                    .parse()
                    .ok()
                    .map(|percent| LogEvent::PercentProgress { percent }),
                LogEventKind::PromptExecuted => capture(1)
                    .parse()
                    .ok()
                    .map(|seconds| LogEvent::PromptExecuted { seconds }),
                LogEventKind::ServerStarted => Some(LogEvent::ServerStarted),
                LogEventKind::ErrorLine => Some(LogEvent::ErrorLine {
                    line: line.trim().to_string(),
                }),
            };

            match event {
                Some(event) => return Some(event),
                None => tracing::warn!(line = %line, kind = ?pattern.kind, "Could not parse log line"),
            }
        }
        None
    }

    /// Parse `line` and forward any event to `sink`.
    pub fn dispatch(&self, line: &str, sink: &dyn LogEventSink) -> bool {
        match self.parse_line(line) {
            Some(event) => {
                sink.on_event(event);
                true
            }
            None => false,
        }
    }
}
