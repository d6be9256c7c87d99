//! Stack-trace assembler state machine (spec.md §4.3).
//!
//! The assembler only decides what belongs together; it owns no timer.
//! The caller (the Log Watcher) is responsible for polling `should_flush`
//! against its own clock and calling `flush` once the idle window elapses.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::classify::{self, Language};

pub const IDLE_TIMEOUT_MS: i64 = 2_000;
pub const MAX_BUFFER_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    Collecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedError {
    pub language: Option<Language>,
    pub lines: Vec<String>,
    pub started_at_ms: i64,
    pub truncated: bool,
}

impl CompletedError {
    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}

pub struct Assembler {
    state: AssemblerState,
    language: Option<Language>,
    buffer: Vec<String>,
    started_at_ms: i64,
    last_line_at_ms: i64,
    truncated: bool,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
            language: None,
            buffer: Vec::new(),
            started_at_ms: 0,
            last_line_at_ms: 0,
            truncated: false,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Feed one line observed at `ts_ms`. Returns a completed error if
    /// feeding this line closed out a trace already in progress (i.e. this
    /// line does not continue it and instead starts something new, or
    /// nothing at all).
    pub fn feed(&mut self, line: &str, ts_ms: i64) -> Option<CompletedError> {
        match self.state {
            AssemblerState::Idle => {
                if let Some(language) = classify::is_trace_start(line) {
                    self.begin(language, line, ts_ms);
                    return None;
                }
                if classify::classify(line).is_error {
                    return Some(CompletedError {
                        language: None,
                        lines: vec![line.to_owned()],
                        started_at_ms: ts_ms,
                        truncated: false,
                    });
                }
                None
            }
            AssemblerState::Collecting => {
                if self.is_continuation(line) {
                    self.push_line(line, ts_ms);
                    None
                } else {
                    let completed = self.flush();
                    if let Some(language) = classify::is_trace_start(line) {
                        self.begin(language, line, ts_ms);
                    }
                    completed
                }
            }
        }
    }

    /// True once `now_ms` has exceeded the idle window since the last line
    /// accepted into the in-progress trace. The caller is expected to call
    /// `flush` immediately after observing `true`.
    pub fn should_flush(&self, now_ms: i64) -> bool {
        self.state == AssemblerState::Collecting
            && now_ms.saturating_sub(self.last_line_at_ms) >= IDLE_TIMEOUT_MS
    }

    /// Close out whatever is currently being collected, if anything.
    pub fn flush(&mut self) -> Option<CompletedError> {
        if self.state == AssemblerState::Idle || self.buffer.is_empty() {
            self.reset();
            return None;
        }
        let completed = CompletedError {
            language: self.language,
            lines: std::mem::take(&mut self.buffer),
            started_at_ms: self.started_at_ms,
            truncated: self.truncated,
        };
        self.reset();
        Some(completed)
    }

    fn begin(&mut self, language: Language, line: &str, ts_ms: i64) {
        self.state = AssemblerState::Collecting;
        self.language = Some(language);
        self.buffer.clear();
        self.buffer.push(line.to_owned());
        self.started_at_ms = ts_ms;
        self.last_line_at_ms = ts_ms;
        self.truncated = false;
    }

    fn push_line(&mut self, line: &str, ts_ms: i64) {
        self.last_line_at_ms = ts_ms;
        if self.buffer.len() < MAX_BUFFER_LINES {
            self.buffer.push(line.to_owned());
        } else {
            self.truncated = true;
        }
    }

    fn is_continuation(&self, line: &str) -> bool {
        if CAUSE_MARKER.is_match(line) {
            return true;
        }
        match self.language {
            Some(Language::Node) => AT_FRAME.is_match(line),
            Some(Language::Python) => {
                PYTHON_FRAME.is_match(line) || PYTHON_EXC_LINE.is_match(line) || INDENTED.is_match(line)
            }
            Some(Language::Go) => {
                INDENTED.is_match(line) || GO_GOROUTINE.is_match(line) || GO_FRAME.is_match(line)
            }
            Some(Language::Java) => {
                AT_FRAME.is_match(line) || JAVA_MORE_FRAMES.is_match(line)
            }
            Some(Language::Ruby) => RUBY_FRAME.is_match(line),
            Some(Language::Rust) => RUST_FRAME.is_match(line),
            Some(Language::Php) => PHP_FRAME.is_match(line),
            Some(Language::DotNet) => {
                DOTNET_FRAME.is_match(line) || DOTNET_END_OF_STACK.is_match(line)
            }
            None => self.is_generic_continuation(line),
        }
    }

    fn is_generic_continuation(&self, line: &str) -> bool {
        INDENTED.is_match(line) && !looks_like_fresh_structured_log(line)
    }
}

static AT_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+at\s+\S").unwrap());
static CAUSE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(Caused by:|\[cause\]:)").unwrap());
static PYTHON_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s+File "[^"]+""#).unwrap());
static PYTHON_EXC_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+(Error|Exception):").unwrap());
static GO_GOROUTINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^goroutine \d+").unwrap());
static GO_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.go:\d+").unwrap());
static JAVA_MORE_FRAMES: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\.\.\.\s+\d+\s+more").unwrap());
static RUBY_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*from\s+/").unwrap());
static RUST_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+at src/|^\s+\d+:\s").unwrap());
static PHP_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*#\d+\s+").unwrap());
static DOTNET_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+at [\w.]+\(").unwrap());
static DOTNET_END_OF_STACK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^--- End of ").unwrap());
static INDENTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s{2,}|\t)\S").unwrap());

static FRESH_STRUCTURED_LOG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(\{|\[?\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2})"#).unwrap()
});

fn looks_like_fresh_structured_log(line: &str) -> bool {
    FRESH_STRUCTURED_LOG.is_match(line)
}
