/// Security subsystems for the Bansho gateway:
///
/// - **hash**: PBKDF2-HMAC-SHA-256 API key generation and verification
/// - **keys**: the credential store (Postgres + in-memory backends)
/// - **sanitize**: bounded, redacting JSON sanitizer for audit payloads
/// - **audit**: audit event construction and sinks (Postgres + in-memory)
/// - **ratelimit**: fixed-window limiter over a shared counter store
///   (Redis + in-memory backends)
pub mod audit;
pub mod hash;
pub mod keys;
pub mod ratelimit;
pub mod sanitize;

pub use audit::{build_event, InMemoryAuditSink, PostgresAuditSink};
pub use keys::{InMemoryCredentialStore, PostgresCredentialStore};
pub use ratelimit::{FixedWindowLimiter, InMemoryCounterStore, RedisCounterStore};
