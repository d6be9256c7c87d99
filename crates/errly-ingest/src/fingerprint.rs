//! Stable content fingerprinting (spec.md §4.1).
//!
//! `fingerprint` hashes `(service, message, normalized stack)`; the stack is
//! run through `normalize_stack` first so that the same logical error keeps
//! the same fingerprint across redeploys, hosts, and process restarts, even
//! though line numbers, addresses, pids, and timestamps differ between
//! occurrences.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static ISO_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?").unwrap()
});
static COMMON_TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(\.\d+)?").unwrap());
static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});
static HEX_ADDR: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]{4,}").unwrap());
static NODE_INTERNAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(node:internal/[\w/-]+):\d+(?::\d+)?").unwrap());
static FILE_LINE_COL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z0-9_.\-]+\.[A-Za-z]{1,10}):\d+(?::\d+)?").unwrap());
static TRAILING_LINE_COL_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+(?::\d+)?\)").unwrap());
static PATH_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[A-Za-z]:[\\/])?(?:[^\s()\\/:]+[\\/])+[^\s()\\/:]+").unwrap());
static PID: Lazy<Regex> = Lazy::new(|| Regex::new(r"pid=\d+").unwrap());
static THREAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"thread-\d+").unwrap());
static GOROUTINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"goroutine \d+").unwrap());
static LOCALHOST_PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"localhost:\d+").unwrap());
static LONG_DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{10,13}\b").unwrap());

/// Normalize a stack trace so that two occurrences of the same logical error
/// produce identical text regardless of line numbers, memory addresses,
/// pids, hostnames, or absolute file paths. Idempotent: applying this twice
/// yields the same result as applying it once.
pub fn normalize_stack(stack: &str) -> String {
    // File/line/col and trailing-paren stripping must run before the
    // UUID/hex-addr/timestamp substitutions: those insert `<...>` markers
    // that a placeholder embedded inside a filename (e.g.
    // `handler-<uuid>.js:42:7`) would otherwise carry past
    // `FILE_LINE_COL`'s basename character class, which excludes `<`/`>`.
    let s = FILE_LINE_COL.replace_all(stack, "$1");
    let s = TRAILING_LINE_COL_PAREN.replace_all(&s, ")");
    let s = NODE_INTERNAL.replace_all(&s, "$1");
    let s = ISO_TIMESTAMP.replace_all(&s, "<timestamp>");
    let s = COMMON_TIMESTAMP.replace_all(&s, "<timestamp>");
    let s = UUID.replace_all(&s, "<uuid>");
    let s = HEX_ADDR.replace_all(&s, "<addr>");
    let s = PATH_SEGMENT.replace_all(&s, |caps: &regex::Captures| basename(&caps[0]));
    let s = PID.replace_all(&s, "pid=<pid>");
    let s = THREAD.replace_all(&s, "thread-<tid>");
    let s = GOROUTINE.replace_all(&s, "goroutine <id>");
    let s = LOCALHOST_PORT.replace_all(&s, "localhost:<port>");
    let s = LONG_DIGIT_RUN.replace_all(&s, "<timestamp>");
    s.into_owned()
}

fn basename(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_owned()
}

/// Hex SHA-256 over `service \0 message \0 normalized(stack)`.
pub fn fingerprint(service: &str, message: &str, stack: Option<&str>) -> String {
    let normalized_stack = stack.map(normalize_stack).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized_stack.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_produce_equal_fingerprints() {
        let a = fingerprint("api", "TypeError: x", Some("at f (a.ts:10:1)"));
        let b = fingerprint("api", "TypeError: x", Some("at f (a.ts:10:1)"));
        assert_eq!(a, b);
    }

    #[test]
    fn changing_service_changes_fingerprint() {
        let a = fingerprint("api", "TypeError: x", None);
        let b = fingerprint("worker", "TypeError: x", None);
        assert_ne!(a, b);
    }

    #[test]
    fn changing_message_changes_fingerprint() {
        let a = fingerprint("api", "TypeError: x", None);
        let b = fingerprint("api", "TypeError: y", None);
        assert_ne!(a, b);
    }

    #[test]
    fn changing_stack_changes_fingerprint() {
        let a = fingerprint("api", "TypeError: x", Some("at f (a.ts:1:1)"));
        let b = fingerprint("api", "TypeError: x", Some("at g (b.ts:1:1)"));
        assert_ne!(a, b);
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = "Error at /home/app/src/service-550e8400-e29b-41d4-a716-446655440000.ts:42:7 pid=1234 thread-9 goroutine 7 2024-01-02T03:04:05.678Z 1700000000000 0xdeadbeef localhost:5432";
        let once = normalize_stack(raw);
        let twice = normalize_stack(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn stable_across_redeploy_line_number_and_path_changes() {
        let stack_a = "TypeError: x\n    at f (/srv/releases/v1/src/a.ts:10:1)\n    at g (/srv/releases/v1/src/a.ts:20:2)";
        let stack_b = "TypeError: x\n    at f (/srv/releases/v2/src/a.ts:15:3)\n    at g (/srv/releases/v2/src/a.ts:25:9)";
        let a = fingerprint("api", "TypeError: x", Some(stack_a));
        let b = fingerprint("api", "TypeError: x", Some(stack_b));
        assert_eq!(a, b);
    }

    #[test]
    fn uuid_embedded_in_filename_still_drops_trailing_line_col() {
        let a = normalize_stack("at /tmp/handler-8f14e45f-ceea-467e-bd2b-b1246d02c17d.js:42:7");
        let b = normalize_stack("at /tmp/handler-1a2b3c4d-5e6f-7890-abcd-ef1234567890.js:99:3");
        assert_eq!(a, b);
        assert_eq!(a, "at /handler-<uuid>.js");
    }

    #[test]
    fn uuid_is_replaced() {
        let s = normalize_stack("session 550e8400-e29b-41d4-a716-446655440000 failed");
        assert!(s.contains("<uuid>"));
        assert!(!s.contains("550e8400"));
    }

    #[test]
    fn windows_path_reduces_to_basename() {
        let s = normalize_stack(r"at Program.Main() in C:\src\app\Program.cs:line 42");
        // basename reduction strips directory components regardless of trailing suffix handling
        assert!(s.contains("Program.cs"));
        assert!(!s.contains(r"C:\src"));
    }

    #[test]
    fn node_internal_keeps_path_drops_line() {
        let s = normalize_stack("at node:internal/modules/cjs/loader:1105:19");
        assert_eq!(s, "at node:internal/modules/cjs/loader");
    }

    #[test]
    fn goroutine_number_is_replaced() {
        assert_eq!(normalize_stack("goroutine 42 [running]:"), "goroutine <id> [running]:");
    }

    #[test]
    fn localhost_port_is_replaced() {
        assert_eq!(
            normalize_stack("dial tcp localhost:5432: connection refused"),
            "dial tcp localhost:<port>: connection refused"
        );
    }

    #[test]
    fn pid_and_thread_are_replaced() {
        let s = normalize_stack("worker pid=4821 thread-3 crashed");
        assert_eq!(s, "worker pid=<pid> thread-<tid> crashed");
    }
}
