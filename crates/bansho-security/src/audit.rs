//! Audit event construction and sinks.
//!
//! [`build_event`] is the only way an [`AuditEvent`] comes into existence:
//! it normalizes the text fields and bounds all three JSON payloads through
//! the sanitizer, so nothing over-sized or credential-bearing can reach a
//! sink. Two sink backends:
//!
//! - [`InMemoryAuditSink`]: a `Vec` behind `RwLock`, for tests.
//! - [`PostgresAuditSink`]: append-only INSERT into `audit_events`.
//!
//! Audit writes are best-effort from the hot path's perspective: callers log
//! sink failures to stderr and never fail the original request.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use bansho_types::{AuditEvent, AuditSink, BanshoError};

use crate::sanitize::{bound_payload, truncate_text, MAX_JSON_STRING_CHARS};

/// SQL migration for the `audit_events` table. Assumes `api_keys` exists.
pub const CREATE_AUDIT_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_events (
    id uuid PRIMARY KEY,
    ts timestamptz NOT NULL DEFAULT NOW(),
    api_key_id uuid REFERENCES api_keys(id) ON DELETE SET NULL,
    role text NOT NULL DEFAULT 'unknown',
    method text NOT NULL,
    tool_name text NOT NULL,
    request_json jsonb NOT NULL DEFAULT '{}'::jsonb,
    response_json jsonb NOT NULL DEFAULT '{}'::jsonb,
    decision jsonb NOT NULL DEFAULT '{}'::jsonb,
    status_code integer NOT NULL,
    latency_ms integer NOT NULL CHECK (latency_ms >= 0)
);

CREATE INDEX IF NOT EXISTS idx_audit_events_ts ON audit_events (ts);
CREATE INDEX IF NOT EXISTS idx_audit_events_tool_name ON audit_events (tool_name);
"#;

/// Create the `audit_events` table and indexes if they do not exist.
pub async fn run_migrations(pool: &PgPool) -> Result<(), BanshoError> {
    sqlx::query(CREATE_AUDIT_EVENTS_TABLE)
        .execute(pool)
        .await
        .map_err(|e| BanshoError::Database(format!("failed to run audit migration: {e}")))?;
    info!("audit_events table and indexes created or already exist");
    Ok(())
}

/// Build a normalized, sanitized audit event.
///
/// - `api_key_id` and `role` are trimmed; empty collapses to `None` /
///   `"unknown"`.
/// - `method` is upper-cased and must be non-empty; `tool_name` must be
///   non-empty.
/// - `status_code` must be in `0..=999`; `latency_ms` must be non-negative.
/// - The three payloads are bounded independently.
#[allow(clippy::too_many_arguments)]
pub fn build_event(
    api_key_id: Option<&str>,
    role: &str,
    method: &str,
    tool_name: &str,
    request_json: &serde_json::Value,
    response_json: &serde_json::Value,
    decision: &serde_json::Value,
    status_code: i32,
    latency_ms: i64,
) -> Result<AuditEvent, BanshoError> {
    let method = method.trim();
    if method.is_empty() {
        return Err(BanshoError::Audit(
            "method must be a non-empty string".to_string(),
        ));
    }
    let tool_name = tool_name.trim();
    if tool_name.is_empty() {
        return Err(BanshoError::Audit(
            "tool_name must be a non-empty string".to_string(),
        ));
    }
    if !(0..=999).contains(&status_code) {
        return Err(BanshoError::Audit(format!(
            "status_code must be in 0..=999, got {status_code}"
        )));
    }
    if latency_ms < 0 {
        return Err(BanshoError::Audit(format!(
            "latency_ms must be non-negative, got {latency_ms}"
        )));
    }

    let api_key_id = api_key_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| truncate_text(id, MAX_JSON_STRING_CHARS));
    let role = {
        let role = role.trim();
        if role.is_empty() {
            "unknown".to_string()
        } else {
            truncate_text(role, MAX_JSON_STRING_CHARS)
        }
    };

    Ok(AuditEvent {
        id: Uuid::new_v4(),
        ts: Utc::now(),
        api_key_id,
        role,
        method: truncate_text(&method.to_uppercase(), MAX_JSON_STRING_CHARS),
        tool_name: truncate_text(tool_name, MAX_JSON_STRING_CHARS),
        request_json: bound_payload(request_json),
        response_json: bound_payload(response_json),
        decision: bound_payload(decision),
        status_code,
        latency_ms,
    })
}

/// Parse the recorded key id for the UUID column. Unparseable ids are stored
/// as NULL rather than failing the event.
fn api_key_uuid(event: &AuditEvent) -> Option<Uuid> {
    event
        .api_key_id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id.trim()).ok())
}

// ============================================================
// InMemoryAuditSink
// ============================================================

/// In-memory audit sink for tests and development.
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn log(&self, event: AuditEvent) -> Result<(), BanshoError> {
        self.events.write().await.push(event);
        Ok(())
    }
}

// ============================================================
// PostgresAuditSink
// ============================================================

/// Postgres-backed audit sink for production use. INSERT only — events are
/// never updated or deleted.
#[derive(Clone)]
pub struct PostgresAuditSink {
    pool: PgPool,
}

impl PostgresAuditSink {
    /// The caller is responsible for running [`run_migrations`] first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    async fn log(&self, event: AuditEvent) -> Result<(), BanshoError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                id, ts, api_key_id, role, method, tool_name,
                request_json, response_json, decision, status_code, latency_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(event.ts)
        .bind(api_key_uuid(&event))
        .bind(&event.role)
        .bind(&event.method)
        .bind(&event.tool_name)
        .bind(&event.request_json)
        .bind(&event.response_json)
        .bind(&event.decision)
        .bind(event.status_code)
        .bind(event.latency_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| BanshoError::Audit(format!("failed to insert audit event: {e}")))?;

        Ok(())
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_event(api_key_id: Option<&str>) -> AuditEvent {
        build_event(
            api_key_id,
            "readonly",
            "tools/call",
            "list_customers",
            &json!({}),
            &json!({}),
            &json!({}),
            200,
            5,
        )
        .unwrap()
    }

    #[test]
    fn method_is_uppercased_and_required() {
        let event = minimal_event(None);
        assert_eq!(event.method, "TOOLS/CALL");

        let err = build_event(
            None,
            "readonly",
            "  ",
            "tool",
            &json!({}),
            &json!({}),
            &json!({}),
            200,
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("method"));
    }

    #[test]
    fn tool_name_is_required() {
        let err = build_event(
            None,
            "readonly",
            "tools/call",
            "",
            &json!({}),
            &json!({}),
            &json!({}),
            200,
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tool_name"));
    }

    #[test]
    fn role_and_key_id_normalize() {
        let event = build_event(
            Some("  "),
            "",
            "tools/call",
            "tool",
            &json!({}),
            &json!({}),
            &json!({}),
            401,
            0,
        )
        .unwrap();
        assert_eq!(event.api_key_id, None);
        assert_eq!(event.role, "unknown");
    }

    #[test]
    fn status_and_latency_bounds() {
        for status in [-1, 1000] {
            assert!(build_event(
                None,
                "r",
                "m",
                "t",
                &json!({}),
                &json!({}),
                &json!({}),
                status,
                0
            )
            .is_err());
        }
        assert!(build_event(
            None,
            "r",
            "m",
            "t",
            &json!({}),
            &json!({}),
            &json!({}),
            0,
            -1
        )
        .is_err());
    }

    #[test]
    fn payloads_are_sanitized_on_build() {
        let event = build_event(
            None,
            "user",
            "tools/call",
            "tool",
            &json!({ "token": "cleartext", "argument": "ok" }),
            &json!("r".repeat(10_000)),
            &json!({}),
            200,
            1,
        )
        .unwrap();
        assert_eq!(event.request_json["token"], json!("[REDACTED]"));
        assert_eq!(event.request_json["argument"], json!("ok"));
        assert!(
            serde_json::to_string(&event.response_json).unwrap().len()
                <= crate::sanitize::MAX_JSON_BYTES
        );
    }

    #[test]
    fn unparseable_key_id_maps_to_null_column() {
        let parseable = minimal_event(Some("0d4b8e0e-14ff-4ab8-9e55-7f3dbf6a8e41"));
        assert!(api_key_uuid(&parseable).is_some());

        let junk = minimal_event(Some("key-readonly"));
        assert_eq!(junk.api_key_id.as_deref(), Some("key-readonly"));
        assert!(api_key_uuid(&junk).is_none());
    }

    #[tokio::test]
    async fn in_memory_sink_appends() {
        let sink = InMemoryAuditSink::new();
        sink.log(minimal_event(None)).await.unwrap();
        sink.log(minimal_event(None)).await.unwrap();
        assert_eq!(sink.count().await, 2);
    }

    /// Requires a running PostgreSQL instance; set DATABASE_URL to run.
    mod integration {
        use super::*;

        #[tokio::test]
        #[ignore]
        async fn postgres_insert_roundtrip() {
            let Ok(url) = std::env::var("DATABASE_URL") else {
                return;
            };
            let pool = PgPool::connect(&url).await.unwrap();
            crate::keys::run_migrations(&pool).await.unwrap();
            run_migrations(&pool).await.unwrap();

            let sink = PostgresAuditSink::new(pool.clone());
            let event = minimal_event(None);
            sink.log(event.clone()).await.unwrap();

            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM audit_events WHERE id = $1")
                    .bind(event.id)
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            assert_eq!(count, 1);
        }
    }
}
