/// Shared data types used across the Bansho gateway.
///
/// These types are the lingua franca of the system: the JSON-RPC frames the
/// transports carry, the per-request identity and decision records, and the
/// audit event shape the sink persists.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================
// JSON-RPC / MCP Types
// ============================================================

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 message for MCP communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID (None for notifications).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Method name (for requests/notifications).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters (for requests/notifications).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Result (for responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error (for error responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Build a request frame.
    pub fn request(id: serde_json::Value, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification frame (no id, expects no response).
    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a success response frame.
    pub fn response(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response frame.
    pub fn error_response(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// Whether this frame is a notification (request without an id).
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code. The gateway uses the HTTP-style taxonomy (401/403/429/500/502).
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    /// 401 — missing or unresolved credential. Never says which.
    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized")
    }

    /// 403 — policy denies the tool for the caller's role.
    pub fn forbidden() -> Self {
        Self::new(403, "Forbidden")
    }

    /// 429 — a rate-limit window was exceeded.
    pub fn too_many_requests() -> Self {
        Self::new(429, "Too Many Requests")
    }

    /// 500 — invariant violation or limiter misconfiguration.
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    /// 502 — the upstream returned an error or the transport failed.
    pub fn upstream_failed() -> Self {
        Self::new(502, "Upstream request failed")
    }

    /// -32601 — the gateway does not understand the method.
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    /// -32700 — the inbound frame was not parseable.
    pub fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }
}

/// An MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    /// Tool name — the unit of authorization.
    pub name: String,
    /// Tool description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input.
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

// ============================================================
// Identity & Rate-Limit Types
// ============================================================

/// The identity resolved from a presented API key, valid for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub api_key_id: String,
    pub role: String,
}

/// A freshly created API key. The cleartext is returned exactly once.
#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub api_key_id: Uuid,
    pub api_key: String,
}

/// A key row as reported by `keys list`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub api_key_id: Uuid,
    pub role: String,
    pub revoked: bool,
}

/// Outcome of one fixed-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request is within the window. The limit is inclusive.
    pub allowed: bool,
    /// Requests left in the current window, saturating at zero.
    pub remaining: u64,
    /// Seconds until the current window rolls over, in `[1, window_seconds]`.
    pub reset_s: u64,
}

// ============================================================
// Decision Types
// ============================================================

/// Machine-readable record of how the authentication stage ruled.
#[derive(Debug, Clone, Serialize)]
pub struct AuthDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl AuthDecision {
    pub fn not_evaluated() -> Self {
        Self {
            allowed: false,
            reason: Some(NOT_EVALUATED_REASON.to_string()),
            api_key_id: None,
            role: None,
        }
    }

    pub fn granted(identity: &ResolvedIdentity) -> Self {
        Self {
            allowed: true,
            reason: None,
            api_key_id: Some(identity.api_key_id.clone()),
            role: Some(identity.role.clone()),
        }
    }

    pub fn denied() -> Self {
        Self {
            allowed: false,
            reason: Some("unauthorized".to_string()),
            api_key_id: None,
            role: None,
        }
    }
}

/// Machine-readable record of how the authorization stage ruled.
#[derive(Debug, Clone, Serialize)]
pub struct AuthzDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
}

impl AuthzDecision {
    pub fn not_evaluated() -> Self {
        Self {
            allowed: false,
            role: None,
            reason: NOT_EVALUATED_REASON.to_string(),
            matched_rule: None,
        }
    }
}

/// Per-scope slice of the rate decision. A scope that was never consulted
/// (per-tool after a per-key reject) stays in the `Pending` shape.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RateScopeDecision {
    Pending { allowed: bool, reason: String },
    Evaluated(RateLimitResult),
}

impl RateScopeDecision {
    pub fn not_evaluated() -> Self {
        Self::Pending {
            allowed: false,
            reason: NOT_EVALUATED_REASON.to_string(),
        }
    }
}

/// Machine-readable record of how the rate-limit stage ruled.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_api_key: Option<RateScopeDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_tool: Option<RateScopeDecision>,
}

impl RateDecision {
    pub fn not_evaluated() -> Self {
        Self {
            allowed: false,
            reason: NOT_EVALUATED_REASON.to_string(),
            tool_name: None,
            per_api_key: None,
            per_tool: None,
        }
    }
}

pub const NOT_EVALUATED_REASON: &str = "not_evaluated";

/// The full decision object persisted with every audit event. Each pipeline
/// stage overwrites its own sub-key, so every persisted event is well-shaped
/// even when the pipeline short-circuits.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionSet {
    pub auth: AuthDecision,
    pub authz: AuthzDecision,
    pub rate: RateDecision,
}

impl Default for DecisionSet {
    fn default() -> Self {
        Self {
            auth: AuthDecision::not_evaluated(),
            authz: AuthzDecision::not_evaluated(),
            rate: RateDecision::not_evaluated(),
        }
    }
}

impl DecisionSet {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

// ============================================================
// Audit Types
// ============================================================

/// One persisted audit record. Constructed through
/// `bansho_security::audit::build_event`, which normalizes the text fields
/// and bounds the JSON payloads before anything reaches a sink.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    /// Raw identifier as extracted; sinks store NULL when it does not parse
    /// as a UUID.
    pub api_key_id: Option<String>,
    pub role: String,
    pub method: String,
    pub tool_name: String,
    pub request_json: serde_json::Value,
    pub response_json: serde_json::Value,
    pub decision: serde_json::Value,
    pub status_code: i32,
    pub latency_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_decision_set_is_well_shaped() {
        let decision = DecisionSet::default().to_json();
        for stage in ["auth", "authz", "rate"] {
            assert_eq!(decision[stage]["allowed"], serde_json::json!(false));
            assert_eq!(decision[stage]["reason"], serde_json::json!("not_evaluated"));
        }
    }

    #[test]
    fn rate_scope_serializes_flat() {
        let evaluated = RateScopeDecision::Evaluated(RateLimitResult {
            allowed: true,
            remaining: 3,
            reset_s: 42,
        });
        let value = serde_json::to_value(&evaluated).unwrap();
        assert_eq!(value["remaining"], serde_json::json!(3));
        assert_eq!(value["reset_s"], serde_json::json!(42));

        let pending = serde_json::to_value(RateScopeDecision::not_evaluated()).unwrap();
        assert_eq!(pending["reason"], serde_json::json!("not_evaluated"));
    }

    #[test]
    fn notification_frames_have_no_id() {
        let note = JsonRpcMessage::notification("notifications/initialized", serde_json::json!({}));
        assert!(note.is_notification());
        let encoded = serde_json::to_string(&note).unwrap();
        assert!(!encoded.contains("\"id\""));
        assert!(!encoded.contains("\"result\""));
    }

    #[test]
    fn wire_error_taxonomy_messages() {
        assert_eq!(JsonRpcError::unauthorized().message, "Unauthorized");
        assert_eq!(JsonRpcError::forbidden().message, "Forbidden");
        assert_eq!(JsonRpcError::too_many_requests().message, "Too Many Requests");
        assert_eq!(JsonRpcError::internal_error().message, "Internal Server Error");
        assert_eq!(JsonRpcError::upstream_failed().message, "Upstream request failed");
    }
}
