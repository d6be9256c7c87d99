//! Single-line classification (spec.md §4.2).
//!
//! `classify` never fails — a line that matches nothing is simply
//! `is_error: false`. Decision order matters for the info/debug/trace
//! override (see the first branch below); severity then has its own,
//! separate precedence, applied only once a line is known to be an error.

use errly_protocol::Severity;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Node,
    Python,
    Go,
    Java,
    Ruby,
    Rust,
    Php,
    DotNet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub is_error: bool,
    pub severity: Option<Severity>,
    pub message: String,
    pub endpoint: Option<String>,
}

fn not_error(line: &str) -> Classification {
    Classification {
        is_error: false,
        severity: None,
        message: line.to_owned(),
        endpoint: None,
    }
}

static STRUCTURED_NON_ERROR_LEVEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(level=(info|debug|trace)\b|"level"\s*:\s*"(info|debug|trace)")"#).unwrap()
});

static STRUCTURED_FATAL_LEVEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(level=(fatal|critical)\b|"level"\s*:\s*"(fatal|critical)")"#).unwrap()
});
static STRUCTURED_ERROR_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(level=error\b|"level"\s*:\s*"error")"#).unwrap());
static STRUCTURED_WARN_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(level=warn(ing)?\b|"level"\s*:\s*"warn(ing)?")"#).unwrap());

static EXPLICIT_FATAL_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[(FATAL|CRITICAL)\]|\bFATAL:").unwrap());
static EXPLICIT_ERROR_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[ERROR\]|\bERROR:").unwrap());
static EXPLICIT_WARN_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[WARN\]|\bWARNING:").unwrap());

static UNCAUGHT_EXCEPTION_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(TypeError|ReferenceError|RangeError|SyntaxError|Unhandled\w*|unhandledRejection)\b")
        .unwrap()
});

static HTTP_5XX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[A-Z]+\s+/\S*"\s+5\d{2}\b"#).unwrap());
static HTTP_5XX_LOOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bstatus(?:=|:)\s*5\d{2}\b").unwrap());
static HTTP_4XX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[A-Z]+\s+/\S*"\s+4\d{2}\b"#).unwrap());
static HTTP_4XX_LOOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bstatus(?:=|:)\s*4\d{2}\b").unwrap());

static EXIT_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(process\s+)?exited with code (\d+)|exit status (\d+)").unwrap());

static PYTHON_TRACEBACK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Traceback \(most recent").unwrap());
static PYTHON_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s+File "[^"]+""#).unwrap());
static PYTHON_EXC_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+(Error|Exception):").unwrap());

static JAVA_EXCEPTION_IN_THREAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Exception in thread ").unwrap());
static JAVA_CAUSED_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Caused by:").unwrap());
static AT_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+at\s+\S").unwrap());
static JAVA_OR_KOTLIN_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((?:[\w$.]+\.(java|kt)):\d+\)").unwrap());
static DOTNET_FRAME_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bSystem\.").unwrap());

static GO_PANIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^panic:").unwrap());
static GO_GOROUTINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^goroutine \d+").unwrap());
static GO_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.go:\d+").unwrap());

static RUBY_EXCEPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\w*(Error|Exception)\b.*\(\w*(Error|Exception)\)$").unwrap()
});
static RUBY_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*from\s+/").unwrap());

static RUST_PANIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"thread '[^']*' panicked at").unwrap());
static RUST_BACKTRACE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^stack backtrace:").unwrap());

static PHP_FATAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)PHP Fatal|^Fatal error:").unwrap());

static DOTNET_UNHANDLED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Unhandled exception").unwrap());
static DOTNET_EXCEPTION_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bSystem\.\w*Exception\b").unwrap());

static INFRA_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)ECONNREFUSED|ETIMEDOUT|connection refused|pool exhausted|FATAL:\s*too many connections|NOAUTH",
    )
    .unwrap()
});

static DEPRECATION_OR_SLOW_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)deprecat(ed|ion)|slow query").unwrap());

static FATAL_SIGNAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)SIGTERM|SIGSEGV|SIGABRT|\bOOM\b|out of memory|\bkilled\b").unwrap()
});

static TRACE_START_SET: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        UNCAUGHT_EXCEPTION_NAME.as_str(),
        AT_FRAME.as_str(),
        PYTHON_TRACEBACK.as_str(),
        GO_PANIC.as_str(),
        GO_GOROUTINE.as_str(),
        RUST_PANIC.as_str(),
        RUST_BACKTRACE_HEADER.as_str(),
        PHP_FATAL.as_str(),
        DOTNET_UNHANDLED.as_str(),
        PYTHON_EXC_LINE.as_str(),
        RUBY_EXCEPTION.as_str(),
        DOTNET_EXCEPTION_TYPE.as_str(),
    ])
    .unwrap()
});

/// Endpoint extraction (spec.md §4.2): try progressively looser patterns,
/// return the first `"METHOD /path"` match.
static METHOD_PATH_5XX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([A-Z]+\s+/\S*)"\s+5\d{2}\b"#).unwrap());
static METHOD_PATH_4XX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([A-Z]+\s+/\S*)"\s+4\d{2}\b"#).unwrap());
static METHOD_PATH_FIELDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"method=([A-Z]+)\s+path=(/\S*)\s+status=[45]\d{2}\b").unwrap()
});
static METHOD_PATH_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]+)\s+(/\S*)\s+failed\b").unwrap());
static METHOD_PATH_GENERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([A-Z]+\s+/\S*)""#).unwrap());

fn extract_endpoint(line: &str) -> Option<String> {
    if let Some(c) = METHOD_PATH_5XX.captures(line) {
        return Some(c[1].to_owned());
    }
    if let Some(c) = METHOD_PATH_4XX.captures(line) {
        return Some(c[1].to_owned());
    }
    if let Some(c) = METHOD_PATH_FIELDS.captures(line) {
        return Some(format!("{} {}", &c[1], &c[2]));
    }
    if let Some(c) = METHOD_PATH_FAILED.captures(line) {
        return Some(format!("{} {}", &c[1], &c[2]));
    }
    if let Some(c) = METHOD_PATH_GENERIC.captures(line) {
        return Some(c[1].to_owned());
    }
    None
}

/// True when `line` carries a structured info/debug/trace marker, the
/// override `classify` itself applies first (decision 1 below). Exposed so
/// callers that synthesize severity from other metadata (the Log Watcher's
/// platform-severity fallback) can defer to the same contradiction rule.
pub fn is_structured_non_error(line: &str) -> bool {
    STRUCTURED_NON_ERROR_LEVEL.is_match(line)
}

/// Returns `Some(language)` when `line` opens a multi-line stack trace, used
/// by the assembler's `IDLE -> COLLECTING` transition (spec.md §4.3).
pub fn is_trace_start(line: &str) -> Option<Language> {
    if !TRACE_START_SET.is_match(line) {
        return None;
    }
    infer_language(line)
}

/// Language inference (spec.md §4.2).
pub fn infer_language(line: &str) -> Option<Language> {
    if PYTHON_TRACEBACK.is_match(line) || PYTHON_FRAME.is_match(line) {
        return Some(Language::Python);
    }
    if GO_GOROUTINE.is_match(line) || GO_PANIC.is_match(line) || GO_FRAME.is_match(line) {
        return Some(Language::Go);
    }
    if JAVA_CAUSED_BY.is_match(line) || JAVA_EXCEPTION_IN_THREAD.is_match(line) {
        return Some(Language::Java);
    }
    if RUST_PANIC.is_match(line) || RUST_BACKTRACE_HEADER.is_match(line) {
        return Some(Language::Rust);
    }
    if PHP_FATAL.is_match(line) {
        return Some(Language::Php);
    }
    if DOTNET_UNHANDLED.is_match(line) || DOTNET_EXCEPTION_TYPE.is_match(line) {
        return Some(Language::DotNet);
    }
    if RUBY_EXCEPTION.is_match(line) || RUBY_FRAME.is_match(line) {
        return Some(Language::Ruby);
    }
    if AT_FRAME.is_match(line) {
        if JAVA_OR_KOTLIN_FRAME.is_match(line) {
            return Some(Language::Java);
        }
        if DOTNET_FRAME_MARKER.is_match(line) {
            return Some(Language::DotNet);
        }
        return Some(Language::Node);
    }
    if UNCAUGHT_EXCEPTION_NAME.is_match(line) {
        return Some(Language::Node);
    }
    None
}

/// Classify one log line (spec.md §4.2).
pub fn classify(line: &str) -> Classification {
    // Decision 1: a structured info/debug/trace marker overrides everything
    // else, even an `[err]`-bracketed outer line (spec.md §9 open question:
    // kept as specified, flagged for operator review rather than "fixed").
    if STRUCTURED_NON_ERROR_LEVEL.is_match(line) {
        return not_error(line);
    }

    let is_fatal_pattern = FATAL_SIGNAL.is_match(line)
        || STRUCTURED_FATAL_LEVEL.is_match(line)
        || EXPLICIT_FATAL_MARKER.is_match(line)
        || PHP_FATAL.is_match(line)
        || DOTNET_UNHANDLED.is_match(line);

    let is_error_pattern = is_fatal_pattern
        || EXPLICIT_ERROR_MARKER.is_match(line)
        || STRUCTURED_ERROR_LEVEL.is_match(line)
        || UNCAUGHT_EXCEPTION_NAME.is_match(line)
        || HTTP_5XX.is_match(line)
        || HTTP_5XX_LOOSE.is_match(line)
        || EXIT_CODE.is_match(line)
        || PYTHON_TRACEBACK.is_match(line)
        || PYTHON_EXC_LINE.is_match(line)
        || JAVA_EXCEPTION_IN_THREAD.is_match(line)
        || JAVA_CAUSED_BY.is_match(line)
        || GO_PANIC.is_match(line)
        || GO_GOROUTINE.is_match(line)
        || RUBY_EXCEPTION.is_match(line)
        || RUST_PANIC.is_match(line)
        || DOTNET_EXCEPTION_TYPE.is_match(line)
        || INFRA_ERROR.is_match(line);

    let is_warn_pattern = HTTP_4XX.is_match(line)
        || HTTP_4XX_LOOSE.is_match(line)
        || DEPRECATION_OR_SLOW_QUERY.is_match(line)
        || EXPLICIT_WARN_MARKER.is_match(line)
        || STRUCTURED_WARN_LEVEL.is_match(line);

    let is_error = is_error_pattern || is_warn_pattern;
    if !is_error {
        return not_error(line);
    }

    // Severity selection: fatal first, explicit fatal marker, any error
    // pattern, then 4xx/warn, default error (spec.md §4.2 step 3).
    let severity = if is_fatal_pattern {
        Severity::Fatal
    } else if is_error_pattern {
        Severity::Error
    } else if is_warn_pattern {
        Severity::Warn
    } else {
        Severity::Error
    };

    Classification {
        is_error: true,
        severity: Some(severity),
        message: line.to_owned(),
        endpoint: extract_endpoint(line),
    }
}
