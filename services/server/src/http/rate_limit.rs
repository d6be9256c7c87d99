//! Fixed-window per-client rate limiting for direct ingestion
//! (spec.md §6: 100 req/min per client).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

const WINDOW_MS: i64 = 60_000;
const LIMIT_PER_WINDOW: u32 = 100;

struct Window {
    started_at_ms: i64,
    count: u32,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { windows: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` when the client is still within its quota for the
    /// current window, bumping the counter as a side effect.
    pub fn check(&self, client: IpAddr, now_ms: i64) -> bool {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let entry = windows.entry(client).or_insert(Window { started_at_ms: now_ms, count: 0 });
        if now_ms - entry.started_at_ms >= WINDOW_MS {
            entry.started_at_ms = now_ms;
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= LIMIT_PER_WINDOW
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
