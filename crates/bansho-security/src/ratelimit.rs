//! Fixed-window rate limiting over a shared counter store.
//!
//! Time is partitioned into non-overlapping windows; the window index is
//! `now / window_seconds` and is baked into the counter key, so state per
//! (scope, window) is O(1) with natural expiry. The counter store performs
//! the increment atomically and sets the TTL to the window length on the
//! first increment, which keeps the TTL accurate regardless of clock skew
//! between the limiter and the store.
//!
//! Two backends behind the [`CounterStore`] trait:
//!
//! - [`RedisCounterStore`]: a single Lua script per check.
//! - [`InMemoryCounterStore`]: for tests and development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;

use bansho_types::{BanshoError, CounterStore, RateLimitResult, RateLimitWindow};

/// Atomic increment with expire-on-first-increment.
pub const FIXED_WINDOW_INCR_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 then
  redis.call("EXPIRE", KEYS[1], ARGV[1])
end
return current
"#;

const UNKNOWN_API_KEY_SEGMENT: &str = "__unknown_key__";
const UNKNOWN_TOOL_SEGMENT: &str = "__unknown_tool__";

/// Counter key for the per-key limit: `rl:<api_key_id>:<bucket>`.
pub fn api_key_rate_limit_key(api_key_id: &str, window_bucket: u64) -> String {
    let key_id = normalize_segment(api_key_id, UNKNOWN_API_KEY_SEGMENT);
    format!("rl:{key_id}:{window_bucket}")
}

/// Counter key for the per-tool limit: `rl:<api_key_id>:<tool>:<bucket>`.
pub fn tool_rate_limit_key(api_key_id: &str, tool_name: &str, window_bucket: u64) -> String {
    let key_id = normalize_segment(api_key_id, UNKNOWN_API_KEY_SEGMENT);
    let tool = normalize_segment(tool_name, UNKNOWN_TOOL_SEGMENT);
    format!("rl:{key_id}:{tool}:{window_bucket}")
}

fn normalize_segment<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}

fn current_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================
// FixedWindowLimiter
// ============================================================

/// The fixed-window limiter. Holds no state of its own; all counters live in
/// the shared store.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Check the per-key window for `api_key_id` at the current time.
    pub async fn check_api_key_limit(
        &self,
        api_key_id: &str,
        window: &RateLimitWindow,
    ) -> Result<RateLimitResult, BanshoError> {
        self.check_api_key_limit_at(api_key_id, window, current_epoch())
            .await
    }

    /// Check the per-key window at an explicit epoch second (clock injection
    /// for tests).
    pub async fn check_api_key_limit_at(
        &self,
        api_key_id: &str,
        window: &RateLimitWindow,
        now_s: u64,
    ) -> Result<RateLimitResult, BanshoError> {
        validate_window(window)?;
        let key = api_key_rate_limit_key(api_key_id, now_s / window.window_seconds);
        self.check(&key, window, now_s).await
    }

    /// Check the per-tool window for `(api_key_id, tool_name)` at the
    /// current time.
    pub async fn check_tool_limit(
        &self,
        api_key_id: &str,
        tool_name: &str,
        window: &RateLimitWindow,
    ) -> Result<RateLimitResult, BanshoError> {
        self.check_tool_limit_at(api_key_id, tool_name, window, current_epoch())
            .await
    }

    /// Check the per-tool window at an explicit epoch second.
    pub async fn check_tool_limit_at(
        &self,
        api_key_id: &str,
        tool_name: &str,
        window: &RateLimitWindow,
        now_s: u64,
    ) -> Result<RateLimitResult, BanshoError> {
        validate_window(window)?;
        let key = tool_rate_limit_key(api_key_id, tool_name, now_s / window.window_seconds);
        self.check(&key, window, now_s).await
    }

    async fn check(
        &self,
        key: &str,
        window: &RateLimitWindow,
        now_s: u64,
    ) -> Result<RateLimitResult, BanshoError> {
        let count = self
            .store
            .incr_with_window(key, window.window_seconds)
            .await?;

        Ok(RateLimitResult {
            // The limit is inclusive: the limit-th request passes, the next
            // one is rejected.
            allowed: count <= window.requests,
            remaining: window.requests.saturating_sub(count),
            reset_s: seconds_until_reset(now_s, window.window_seconds),
        })
    }
}

/// Non-positive windows are programmer errors and surface as internal
/// failures, never as 429.
fn validate_window(window: &RateLimitWindow) -> Result<(), BanshoError> {
    if window.requests == 0 {
        return Err(BanshoError::Internal(
            "rate limit requests must be greater than 0".to_string(),
        ));
    }
    if window.window_seconds == 0 {
        return Err(BanshoError::Internal(
            "rate limit window_seconds must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

fn seconds_until_reset(now_s: u64, window_seconds: u64) -> u64 {
    let remainder = now_s % window_seconds;
    if remainder == 0 {
        window_seconds
    } else {
        window_seconds - remainder
    }
}

// ============================================================
// RedisCounterStore
// ============================================================

/// Redis-backed counter store. The increment-and-expire runs as a single
/// script execution, which is what makes concurrent checks atomic.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: redis::aio::MultiplexedConnection,
    script: Arc<redis::Script>,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self, BanshoError> {
        let client = redis::Client::open(url)
            .map_err(|e| BanshoError::CounterStore(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BanshoError::CounterStore(format!("failed to connect to redis: {e}")))?;
        Ok(Self {
            conn,
            script: Arc::new(redis::Script::new(FIXED_WINDOW_INCR_SCRIPT)),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_window(&self, key: &str, window_seconds: u64) -> Result<u64, BanshoError> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .script
            .key(key)
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BanshoError::CounterStore(format!("rate limit script failed: {e}")))?;
        Ok(count.max(0) as u64)
    }

    async fn ping(&self) -> Result<(), BanshoError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BanshoError::CounterStore(format!("redis ping failed: {e}")))?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(BanshoError::CounterStore(format!(
                "unexpected ping reply: {reply}"
            )))
        }
    }
}

// ============================================================
// InMemoryCounterStore
// ============================================================

/// In-memory counter store for tests and development. Honors the same
/// expire-on-first-increment contract as the Redis backend.
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<Mutex<HashMap<String, CounterEntry>>>,
}

struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_with_window(&self, key: &str, window_seconds: u64) -> Result<u64, BanshoError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        counters.retain(|_, entry| entry.expires_at > now);

        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now + Duration::from_secs(window_seconds),
        });
        entry.count += 1;
        Ok(entry.count)
    }

    async fn ping(&self) -> Result<(), BanshoError> {
        Ok(())
    }
}

// ============================================================
// Tests
// ============================================================
