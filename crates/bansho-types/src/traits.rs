/// Trait contracts for the Bansho subsystems.
///
/// Every external collaborator is defined here as a trait so the gateway can
/// be wired with production backends (Postgres, Redis, a live MCP transport)
/// or with in-memory fakes in tests. All traits live in `bansho-types` so
/// every crate can depend on them without circular dependencies.
use async_trait::async_trait;

use crate::errors::BanshoError;
use crate::model::{ApiKeyRecord, CreatedApiKey, JsonRpcMessage, ResolvedIdentity};

// ============================================================
// Credential Store
// ============================================================

/// Hash, store, look up, and revoke API keys.
///
/// The cleartext key is never stored; only its PBKDF2 hash. Verification
/// honors each record's own salt and iteration count, so resolution scans
/// all non-revoked rows rather than querying by hash. The bound is small
/// (operators, not end users).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Generate a key for `role`, persist its hash, and return the cleartext
    /// exactly once. `role` is trimmed and lower-cased; empty falls back to
    /// `readonly`.
    async fn create(&self, role: &str) -> Result<CreatedApiKey, BanshoError>;

    /// Resolve a presented key to an identity, or `None` when it matches no
    /// live record. A blank key returns `None` without touching the store.
    async fn resolve(&self, presented_key: &str) -> Result<Option<ResolvedIdentity>, BanshoError>;

    /// All keys, newest first.
    async fn list(&self) -> Result<Vec<ApiKeyRecord>, BanshoError>;

    /// Set `revoked_at` where currently null. Returns whether a row changed.
    /// An unparseable id returns `false` without error.
    async fn revoke(&self, api_key_id: &str) -> Result<bool, BanshoError>;
}

// ============================================================
// Counter Store
// ============================================================

/// Shared counter store backing the fixed-window rate limiter.
///
/// `incr_with_window` must be atomic with respect to concurrent callers:
/// increment the key, and if the post-increment value is 1, set the key to
/// expire `window_seconds` from now. The TTL equals the window length so a
/// brand-new bucket's counter expires cleanly one window after its first
/// request.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the new count.
    async fn incr_with_window(&self, key: &str, window_seconds: u64) -> Result<u64, BanshoError>;

    /// Liveness check, run once at startup.
    async fn ping(&self) -> Result<(), BanshoError>;
}

// ============================================================
// Audit Sink
// ============================================================

/// Append-only persistence for audit events.
///
/// One insert per event; events are never updated or deleted. Sink failures
/// must never fail the request that produced the event — callers log and
/// move on.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, event: crate::model::AuditEvent) -> Result<(), BanshoError>;
}

// ============================================================
// MCP Transport
// ============================================================

/// MCP transport abstraction — unifies the stdio child process and the
/// streamable HTTP endpoint. The upstream session uses this trait and never
/// knows which transport it is talking through.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC message to the MCP server.
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), BanshoError>;

    /// Receive the next JSON-RPC message from the MCP server.
    async fn recv(&mut self) -> Result<JsonRpcMessage, BanshoError>;

    /// Close the transport connection.
    async fn close(&mut self) -> Result<(), BanshoError>;

    /// Whether the transport is still connected.
    fn is_connected(&self) -> bool;
}
