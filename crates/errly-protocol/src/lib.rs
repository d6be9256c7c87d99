// errly-protocol: wire DTOs shared between the store, the push hub, the
// platform client and the HTTP layer.
//
// All push-hub events use a top-level `type` field for discriminated
// serialization (spec.md §4.7: "all events use the same generic framing").

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Severity / status / source
// ---------------------------------------------------------------------------

/// Escalation order: `Warn < Error < Fatal`. Stored severity only ever moves
/// up this ordering (spec.md §3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn max(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Lifecycle status of an `ErrorGroup`. `Resolved` reverts to `New` on
/// recurrence (spec.md §3); other statuses persist through recurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    New,
    Investigating,
    InProgress,
    Resolved,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Investigating => "investigating",
            Status::InProgress => "in-progress",
            Status::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "investigating" => Some(Self::Investigating),
            "in-progress" => Some(Self::InProgress),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// How an occurrence arrived at the Error Grouper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    AutoCapture,
    Direct,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::AutoCapture => "auto-capture",
            Source::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto-capture" => Some(Self::AutoCapture),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorGroup — the canonical persisted + wire representation
// ---------------------------------------------------------------------------

/// One logical error, keyed by fingerprint (spec.md §3).
///
/// This is both what the Store returns from a read and what gets sent over
/// the wire (HTTP list/detail responses and push-hub `new-error`/
/// `error-updated` payloads) — there is no separate "summary" projection,
/// mirroring how the teacher's `RaceRow` (`repo/races.rs`) doubles as both
/// the query result and the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorGroup {
    pub id: Uuid,
    pub service: String,
    pub deployment_id: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub severity: Severity,
    pub status: Status,
    pub endpoint: Option<String>,
    pub raw_log: String,
    pub source: Source,
    pub metadata: Option<serde_json::Value>,
    pub fingerprint: String,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub occurrence_count: i64,
    pub status_changed_at: i64,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Push Hub wire events (spec.md §4.7)
// ---------------------------------------------------------------------------

/// The push-hub event union. Serializes with a `type` tag; every variant's
/// payload is inlined per spec.md's `data: <json>\n\n` framing — there are
/// no separately named SSE event types on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PushEvent {
    NewError(Box<ErrorGroup>),
    ErrorUpdated(Box<ErrorGroup>),
    ErrorCleared { ids: Vec<Uuid> },
    BulkCleared {},
    AuthExpired {},
}

// ---------------------------------------------------------------------------
// HTTP error envelope (frozen schema, reused from the teacher verbatim)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Platform API DTOs (discovery + log streaming)
// ---------------------------------------------------------------------------

/// Deployment status values the Log Watcher treats as "active"
/// (spec.md §4.8, step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Success,
    Deploying,
    Initializing,
    Building,
    Waiting,
    Sleeping,
    Removed,
    Crashed,
    Failed,
}

impl DeploymentStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Deploying
                | Self::Initializing
                | Self::Building
                | Self::Waiting
                | Self::Sleeping
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: String,
    pub service_name: String,
    pub environment_name: String,
    pub status: DeploymentStatus,
}

/// One line delivered on a deployment's log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub message: String,
    pub timestamp_ms: i64,
    /// Platform-reported severity, independent of the text classifier
    /// (spec.md §4.8 "Consuming a subscription").
    #[serde(default)]
    pub severity: Option<String>,
}

/// Parsed `x-ratelimit-*` response headers (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: i64,
    pub limit: i64,
    pub resets_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Store list filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeRange {
    LastHour,
    Last24h,
    Last7d,
    Last30d,
}

impl TimeRange {
    /// Window width in milliseconds.
    pub fn millis(self) -> i64 {
        const HOUR: i64 = 3_600_000;
        match self {
            Self::LastHour => HOUR,
            Self::Last24h => HOUR * 24,
            Self::Last7d => HOUR * 24 * 7,
            Self::Last30d => HOUR * 24 * 30,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last-hour" => Some(Self::LastHour),
            "24h" => Some(Self::Last24h),
            "7d" => Some(Self::Last7d),
            "30d" => Some(Self::Last30d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub service: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<Status>,
    pub time_range: Option<TimeRange>,
    pub query: Option<String>,
}
