//! The gateway middleware — the hot path.
//!
//! Wires together the pipeline: authenticate → authorize → rate-limit →
//! forward → audit. Every `tools/call` runs the stages in order; a failure
//! at any stage short-circuits to the mapped wire error, and an audit event
//! is written regardless of outcome. The downstream side is a stdio server
//! loop: one task per request, responses serialized through a writer task.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use bansho_security::audit::build_event;
use bansho_security::ratelimit::FixedWindowLimiter;
use bansho_types::{
    AuditSink, AuthDecision, BanshoError, CounterStore, CredentialStore, DecisionSet,
    JsonRpcError, JsonRpcMessage, Policy, RateDecision, RateScopeDecision, ResolvedIdentity,
};

use crate::authz::authorize_tool;
use crate::credentials::extract_api_key;
use crate::registry::ToolRegistry;
use crate::upstream::{InitializeSnapshot, Upstream};

const METHOD_TOOLS_CALL: &str = "tools/call";

/// A pipeline stage failure, carrying both the wire error and the payload
/// recorded in the audit row.
struct PipelineFailure {
    status: i32,
    wire: JsonRpcError,
    /// Internal error kind, recorded as `error.type` for 500/502 responses.
    error_type: Option<&'static str>,
}

impl PipelineFailure {
    fn unauthorized() -> Self {
        Self {
            status: 401,
            wire: JsonRpcError::unauthorized(),
            error_type: None,
        }
    }

    fn forbidden() -> Self {
        Self {
            status: 403,
            wire: JsonRpcError::forbidden(),
            error_type: None,
        }
    }

    fn too_many_requests() -> Self {
        Self {
            status: 429,
            wire: JsonRpcError::too_many_requests(),
            error_type: None,
        }
    }

    fn internal(err: &BanshoError) -> Self {
        Self {
            status: 500,
            wire: JsonRpcError::internal_error(),
            error_type: Some(err.kind()),
        }
    }

    fn upstream(err: &BanshoError) -> Self {
        Self {
            status: 502,
            wire: JsonRpcError::upstream_failed(),
            error_type: Some(err.kind()),
        }
    }

    /// The `response_json` shape persisted for failed calls.
    fn response_payload(&self) -> Value {
        match self.error_type {
            Some(error_type) => json!({
                "error": {
                    "code": self.status,
                    "message": self.wire.message,
                    "type": error_type,
                }
            }),
            None => json!({
                "error": {
                    "code": self.status,
                    "message": self.wire.message,
                }
            }),
        }
    }
}

/// The gateway. All collaborators are dependency-injected singletons owned
/// here; tests build one with in-memory fakes and a scripted transport.
pub struct Gateway {
    policy: Policy,
    registry: ToolRegistry,
    credentials: Arc<dyn CredentialStore>,
    limiter: FixedWindowLimiter,
    audit: Arc<dyn AuditSink>,
    upstream: Arc<Upstream>,
    advertised_init: Value,
}

impl Gateway {
    /// Connect the upstream, snapshot its tool registry, and assemble the
    /// pipeline. Fails fast — a gateway that cannot see its upstream or its
    /// stores must not start serving.
    pub async fn new(
        policy: Policy,
        credentials: Arc<dyn CredentialStore>,
        counter_store: Arc<dyn CounterStore>,
        audit: Arc<dyn AuditSink>,
        upstream: Arc<Upstream>,
    ) -> Result<Self, BanshoError> {
        let init = upstream.connect().await?;
        let registry = ToolRegistry::discover(&upstream).await?;
        info!(
            tool_count = registry.len(),
            "gateway connected to upstream and mirrored its tool registry"
        );

        Ok(Self {
            policy,
            registry,
            credentials,
            limiter: FixedWindowLimiter::new(counter_store),
            audit,
            upstream,
            advertised_init: advertised_initialize_result(&init),
        })
    }

    /// Handle one inbound frame. Returns the response frame, or `None` for
    /// notifications and unpaired responses.
    pub async fn handle_message(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        let Some(method) = message.method.clone() else {
            debug!("ignoring frame without a method");
            return None;
        };
        let Some(id) = message.id.clone() else {
            debug!(%method, "ignoring notification");
            return None;
        };
        let params = message.params;

        let reply = match method.as_str() {
            "initialize" => JsonRpcMessage::response(id, self.advertised_init.clone()),
            "ping" => JsonRpcMessage::response(id, json!({})),
            "tools/list" => self.handle_tools_list(id, params).await,
            METHOD_TOOLS_CALL => self.handle_tools_call(id, params).await,
            "resources/list" | "resources/read" | "prompts/list" | "prompts/get" => {
                self.handle_passthrough(id, &method, params).await
            }
            other => JsonRpcMessage::error_response(id, JsonRpcError::method_not_found(other)),
        };
        Some(reply)
    }

    /// `tools/list`: authenticate, delegate to the upstream, filter what the
    /// caller's role may see. The cursor passes through unchanged. A 401
    /// here is not logged as a tool call — it is a list request.
    async fn handle_tools_list(&self, id: Value, params: Option<Value>) -> JsonRpcMessage {
        let identity = match self.authenticate(params.as_ref()).await {
            Ok(identity) => identity,
            Err(failure) => return JsonRpcMessage::error_response(id, failure.wire),
        };

        let upstream_params = params.unwrap_or_else(|| json!({}));
        let mut result = match self.upstream.request("tools/list", upstream_params).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "tools/list forward failed");
                return JsonRpcMessage::error_response(
                    id,
                    PipelineFailure::upstream(&err).wire,
                );
            }
        };

        if let Some(tools) = result.get_mut("tools").and_then(Value::as_array_mut) {
            tools.retain(|tool| {
                let name = tool.get("name").and_then(Value::as_str).unwrap_or("");
                authorize_tool(&self.policy, &self.registry, &identity.role, name).allowed
            });
        }

        JsonRpcMessage::response(id, result)
    }

    /// `resources/*` and `prompts/*`: authenticate, then forward with the
    /// original parameters. No per-resource policy in this version.
    async fn handle_passthrough(
        &self,
        id: Value,
        method: &str,
        params: Option<Value>,
    ) -> JsonRpcMessage {
        if let Err(failure) = self.authenticate(params.as_ref()).await {
            return JsonRpcMessage::error_response(id, failure.wire);
        }

        match self
            .upstream
            .request(method, params.unwrap_or_else(|| json!({})))
            .await
        {
            Ok(result) => JsonRpcMessage::response(id, result),
            Err(err) => {
                warn!(method, error = %err, "passthrough forward failed");
                JsonRpcMessage::error_response(id, PipelineFailure::upstream(&err).wire)
            }
        }
    }

    /// `tools/call`: the central pipeline. Audits every outcome.
    async fn handle_tools_call(&self, id: Value, params: Option<Value>) -> JsonRpcMessage {
        let params = params.unwrap_or_else(|| json!({}));
        let tool_name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let request_payload = json!({ "name": tool_name, "arguments": arguments });

        let started = Instant::now();
        let mut decision = DecisionSet::default();
        let mut identity: Option<ResolvedIdentity> = None;

        let outcome = self
            .tool_call_pipeline(&params, &tool_name, &arguments, &mut decision, &mut identity)
            .await;

        let (status_code, response_json, reply) = match outcome {
            Ok(result) => (
                200,
                result.clone(),
                JsonRpcMessage::response(id, result),
            ),
            Err(failure) => (
                failure.status,
                failure.response_payload(),
                JsonRpcMessage::error_response(id, failure.wire.clone()),
            ),
        };

        let latency_ms = started.elapsed().as_millis().min(i64::MAX as u128) as i64;
        self.write_audit(
            identity.as_ref(),
            &tool_name,
            &request_payload,
            &response_json,
            &decision,
            status_code,
            latency_ms,
        )
        .await;

        reply
    }

    async fn tool_call_pipeline(
        &self,
        params: &Value,
        tool_name: &str,
        arguments: &Value,
        decision: &mut DecisionSet,
        identity_slot: &mut Option<ResolvedIdentity>,
    ) -> Result<Value, PipelineFailure> {
        // 1. Authenticate.
        let identity = match self.authenticate(Some(params)).await {
            Ok(identity) => identity,
            Err(failure) => {
                if failure.status == 401 {
                    decision.auth = AuthDecision::denied();
                }
                return Err(failure);
            }
        };
        decision.auth = AuthDecision::granted(&identity);
        *identity_slot = Some(identity.clone());

        // 2. Authorize.
        let authz = authorize_tool(&self.policy, &self.registry, &identity.role, tool_name);
        decision.authz = (&authz).into();
        if !authz.allowed {
            return Err(PipelineFailure::forbidden());
        }

        // 3. Rate-limit: per-key first, then per-tool. A per-key reject
        // leaves the per-tool counter untouched.
        let per_key_window = self.policy.per_api_key_limit();
        let per_key = self
            .limiter
            .check_api_key_limit(&identity.api_key_id, &per_key_window)
            .await
            .map_err(|e| PipelineFailure::internal(&e))?;
        if !per_key.allowed {
            decision.rate = RateDecision {
                allowed: false,
                reason: "too_many_requests".to_string(),
                tool_name: Some(authz.tool_name.clone()),
                per_api_key: Some(RateScopeDecision::Evaluated(per_key)),
                per_tool: Some(RateScopeDecision::not_evaluated()),
            };
            return Err(PipelineFailure::too_many_requests());
        }

        let tool_window = self.policy.limit_for(&authz.tool_name);
        let per_tool = self
            .limiter
            .check_tool_limit(&identity.api_key_id, &authz.tool_name, &tool_window)
            .await
            .map_err(|e| PipelineFailure::internal(&e))?;
        if !per_tool.allowed {
            decision.rate = RateDecision {
                allowed: false,
                reason: "too_many_requests".to_string(),
                tool_name: Some(authz.tool_name.clone()),
                per_api_key: Some(RateScopeDecision::Evaluated(per_key)),
                per_tool: Some(RateScopeDecision::Evaluated(per_tool)),
            };
            return Err(PipelineFailure::too_many_requests());
        }
        decision.rate = RateDecision {
            allowed: true,
            reason: "within_limits".to_string(),
            tool_name: Some(authz.tool_name.clone()),
            per_api_key: Some(RateScopeDecision::Evaluated(per_key)),
            per_tool: Some(RateScopeDecision::Evaluated(per_tool)),
        };

        // 4. Forward. The upstream result is returned to the client unchanged.
        self.upstream
            .call_tool(&authz.tool_name, arguments)
            .await
            .map_err(|e| PipelineFailure::upstream(&e))
    }

    /// Resolve the caller. Missing and invalid keys are indistinguishable on
    /// the wire; credential-store failures surface as 500, not 401.
    async fn authenticate(
        &self,
        params: Option<&Value>,
    ) -> Result<ResolvedIdentity, PipelineFailure> {
        let Some(presented) = extract_api_key(params) else {
            return Err(PipelineFailure::unauthorized());
        };
        match self.credentials.resolve(&presented).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(PipelineFailure::unauthorized()),
            Err(err) => {
                error!(error = %err, "credential resolution failed");
                Err(PipelineFailure::internal(&err))
            }
        }
    }

    /// Compose and write the audit event. Never fails the request: sink
    /// errors go to stderr. Runs after the response is computed, outside any
    /// client-cancellable path.
    #[allow(clippy::too_many_arguments)]
    async fn write_audit(
        &self,
        identity: Option<&ResolvedIdentity>,
        tool_name: &str,
        request_json: &Value,
        response_json: &Value,
        decision: &DecisionSet,
        status_code: i32,
        latency_ms: i64,
    ) {
        let event = build_event(
            identity.map(|i| i.api_key_id.as_str()),
            identity.map(|i| i.role.as_str()).unwrap_or("unknown"),
            METHOD_TOOLS_CALL,
            tool_name,
            request_json,
            response_json,
            &decision.to_json(),
            status_code,
            latency_ms,
        );

        match event {
            Ok(event) => {
                if let Err(err) = self.audit.log(event).await {
                    error!(
                        tool = tool_name,
                        status = status_code,
                        error_type = err.kind(),
                        "audit_log_failed"
                    );
                }
            }
            Err(err) => {
                error!(
                    tool = tool_name,
                    status = status_code,
                    error_type = err.kind(),
                    "audit_event_rejected"
                );
            }
        }
    }

    /// Serve line-delimited JSON-RPC on stdin/stdout.
    pub async fn serve_stdio(self: Arc<Self>) -> Result<(), BanshoError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve line-delimited JSON-RPC over arbitrary streams. Each request is
    /// handled on its own task; a writer task serializes responses so
    /// concurrent handlers never interleave frames.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<(), BanshoError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<JsonRpcMessage>(64);

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = rx.recv().await {
                let mut line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        error!(error = %err, "failed to encode response frame");
                        continue;
                    }
                };
                line.push('\n');
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| BanshoError::Mcp(format!("failed to read downstream frame: {e}")))?;
            let Some(line) = line else {
                info!("downstream closed, draining responses");
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcMessage>(line) {
                Ok(message) => {
                    let gateway = Arc::clone(&self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = gateway.handle_message(message).await {
                            let _ = tx.send(reply).await;
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "unparseable downstream frame");
                    let _ = tx
                        .send(JsonRpcMessage::error_response(
                            Value::Null,
                            JsonRpcError::parse_error(),
                        ))
                        .await;
                }
            }
        }

        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }
}

/// The initialize result the gateway advertises downstream: the upstream's
/// identity verbatim, with the gateway's own name substituted only when the
/// upstream omitted server-info.
fn advertised_initialize_result(init: &InitializeSnapshot) -> Value {
    let server_info = init.server_info.clone().unwrap_or_else(|| {
        json!({
            "name": "bansho",
            "version": env!("CARGO_PKG_VERSION"),
        })
    });

    let mut result = json!({
        "protocolVersion": init.protocol_version,
        "capabilities": init.capabilities,
        "serverInfo": server_info,
    });
    if let Some(instructions) = &init.instructions {
        result["instructions"] = json!(instructions);
    }
    result
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use bansho_security::audit::InMemoryAuditSink;
    use bansho_security::keys::InMemoryCredentialStore;
    use bansho_security::ratelimit::InMemoryCounterStore;
    use bansho_types::McpTransport;

    // ── Scripted transport ───────────────────────────────────

    /// Replays scripted results in order, attaching each to the id of the
    /// most recent request.
    struct ScriptedTransport {
        replies: StdMutex<Vec<Result<Value, JsonRpcError>>>,
        last_id: StdMutex<Option<Value>>,
        connected: bool,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<Value, JsonRpcError>>) -> Self {
            Self {
                replies: StdMutex::new(replies),
                last_id: StdMutex::new(None),
                connected: true,
            }
        }
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn send(&mut self, message: JsonRpcMessage) -> Result<(), BanshoError> {
            if let Some(id) = &message.id {
                *self.last_id.lock().unwrap() = Some(id.clone());
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<JsonRpcMessage, BanshoError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(BanshoError::Mcp("upstream connection lost".to_string()));
            }
            let id = self.last_id.lock().unwrap().clone().unwrap_or(Value::Null);
            Ok(match replies.remove(0) {
                Ok(result) => JsonRpcMessage::response(id, result),
                Err(error) => JsonRpcMessage::error_response(id, error),
            })
        }

        async fn close(&mut self) -> Result<(), BanshoError> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    // ── Fixture ──────────────────────────────────────────────

    fn init_result() -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "crm-upstream", "version": "2.3.0" },
        })
    }

    fn upstream_tools() -> Value {
        json!({
            "tools": [
                { "name": "list_customers", "description": "List", "inputSchema": {} },
                { "name": "delete_customer", "description": "Delete", "inputSchema": {} },
            ]
        })
    }

    fn test_policy() -> Policy {
        let policy: Policy = serde_json::from_value(json!({
            "roles": {
                "admin": { "allow": ["*"] },
                "user": { "allow": ["list_customers", "delete_customer"] },
                "readonly": { "allow": ["list_customers"] },
            },
            "rate_limits": {
                "per_api_key": { "requests": 120, "window_seconds": 60 },
                "per_tool": {
                    "default": { "requests": 30, "window_seconds": 60 },
                    "overrides": {
                        "list_customers": { "requests": 2, "window_seconds": 60 },
                    },
                },
            },
        }))
        .unwrap();
        policy.normalize().unwrap()
    }

    struct Harness {
        gateway: Arc<Gateway>,
        credentials: Arc<InMemoryCredentialStore>,
        audit: InMemoryAuditSink,
    }

    /// Gateway wired with in-memory fakes. `call_replies` are the scripted
    /// upstream responses after the handshake + registry discovery.
    async fn harness(call_replies: Vec<Result<Value, JsonRpcError>>) -> Harness {
        let mut replies = vec![Ok(init_result()), Ok(upstream_tools())];
        replies.extend(call_replies);

        let credentials = Arc::new(InMemoryCredentialStore::with_iterations(1));
        let audit = InMemoryAuditSink::new();
        let upstream = Arc::new(Upstream::new(Box::new(ScriptedTransport::new(replies))));

        let gateway = Gateway::new(
            test_policy(),
            credentials.clone(),
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(audit.clone()),
            upstream,
        )
        .await
        .unwrap();

        Harness {
            gateway: Arc::new(gateway),
            credentials,
            audit,
        }
    }

    async fn create_key(harness: &Harness, role: &str) -> String {
        harness.credentials.create(role).await.unwrap().api_key
    }

    fn call_request(id: u64, tool: &str, api_key: Option<&str>) -> JsonRpcMessage {
        let mut params = json!({ "name": tool, "arguments": { "q": "acme" } });
        if let Some(api_key) = api_key {
            params["_meta"] = json!({ "headers": { "x-api-key": api_key } });
        }
        JsonRpcMessage::request(json!(id), "tools/call", params)
    }

    // ── Seed scenarios ───────────────────────────────────────

    #[tokio::test]
    async fn missing_credential_is_401_and_audited_as_unknown() {
        let harness = harness(vec![]).await;

        let reply = harness
            .gateway
            .handle_message(call_request(1, "list_customers", None))
            .await
            .unwrap();

        let error = reply.error.unwrap();
        assert_eq!(error.code, 401);
        assert_eq!(error.message, "Unauthorized");

        let events = harness.audit.all_events().await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.role, "unknown");
        assert_eq!(event.api_key_id, None);
        assert_eq!(event.status_code, 401);
        assert_eq!(event.decision["auth"]["allowed"], json!(false));
        assert_eq!(event.tool_name, "list_customers");
    }

    #[tokio::test]
    async fn readonly_denied_on_sensitive_tool() {
        let harness = harness(vec![]).await;
        let api_key = create_key(&harness, "readonly").await;

        let reply = harness
            .gateway
            .handle_message(call_request(1, "delete_customer", Some(&api_key)))
            .await
            .unwrap();

        assert_eq!(reply.error.as_ref().unwrap().code, 403);
        assert_eq!(reply.error.unwrap().message, "Forbidden");

        let events = harness.audit.all_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status_code, 403);
        assert_eq!(
            events[0].decision["authz"]["reason"],
            json!("tool_not_allowed_for_role")
        );
        assert_eq!(events[0].role, "readonly");
    }

    #[tokio::test]
    async fn per_tool_override_limits_second_call() {
        // Override: list_customers at 2/60. Two upstream replies cover the
        // two allowed calls; the third is rejected before forwarding.
        let harness = harness(vec![
            Ok(json!({ "content": [{ "type": "text", "text": "page 1" }] })),
            Ok(json!({ "content": [{ "type": "text", "text": "page 2" }] })),
        ])
        .await;
        let api_key = create_key(&harness, "readonly").await;

        for id in 1..=2 {
            let reply = harness
                .gateway
                .handle_message(call_request(id, "list_customers", Some(&api_key)))
                .await
                .unwrap();
            assert!(reply.error.is_none(), "call {id} should pass");
        }

        let reply = harness
            .gateway
            .handle_message(call_request(3, "list_customers", Some(&api_key)))
            .await
            .unwrap();
        assert_eq!(reply.error.unwrap().code, 429);

        let events = harness.audit.all_events().await;
        assert_eq!(events.len(), 3);
        let rejected = &events[2];
        assert_eq!(rejected.status_code, 429);
        assert_eq!(rejected.decision["rate"]["reason"], json!("too_many_requests"));
        assert_eq!(rejected.decision["rate"]["per_tool"]["remaining"], json!(0));
        // The allowed calls recorded their snapshots too.
        assert_eq!(events[0].decision["rate"]["per_tool"]["remaining"], json!(1));
    }

    #[tokio::test]
    async fn admin_wildcard_reaches_upstream() {
        let harness = harness(vec![Ok(json!({ "content": [] }))]).await;
        let api_key = create_key(&harness, "admin").await;

        let reply = harness
            .gateway
            .handle_message(call_request(1, "delete_customer", Some(&api_key)))
            .await
            .unwrap();
        assert!(reply.error.is_none());

        let events = harness.audit.all_events().await;
        assert_eq!(events[0].status_code, 200);
        assert_eq!(
            events[0].decision["authz"]["matched_rule"],
            json!("roles.admin.allow:*")
        );
    }

    #[tokio::test]
    async fn revoked_key_is_401() {
        let harness = harness(vec![]).await;
        let created = harness.credentials.create("admin").await.unwrap();
        harness
            .credentials
            .revoke(&created.api_key_id.to_string())
            .await
            .unwrap();

        let reply = harness
            .gateway
            .handle_message(call_request(1, "list_customers", Some(&created.api_key)))
            .await
            .unwrap();
        assert_eq!(reply.error.unwrap().code, 401);
    }

    #[tokio::test]
    async fn upstream_failure_is_502_with_error_type() {
        // No scripted reply for the call: recv fails mid-call.
        let harness = harness(vec![]).await;
        let api_key = create_key(&harness, "admin").await;

        let reply = harness
            .gateway
            .handle_message(call_request(1, "delete_customer", Some(&api_key)))
            .await
            .unwrap();
        let error = reply.error.unwrap();
        assert_eq!(error.code, 502);
        assert_eq!(error.message, "Upstream request failed");

        let events = harness.audit.all_events().await;
        let response = &events[0].response_json;
        assert_eq!(response["error"]["code"], json!(502));
        assert_eq!(response["error"]["type"], json!("Upstream"));
        assert_eq!(events[0].decision["rate"]["reason"], json!("within_limits"));
    }

    // ── Other handlers ───────────────────────────────────────

    #[tokio::test]
    async fn tools_list_filters_by_role_and_passes_cursor() {
        let harness = harness(vec![Ok(json!({
            "tools": [
                { "name": "list_customers", "inputSchema": {} },
                { "name": "delete_customer", "inputSchema": {} },
            ],
            "nextCursor": "page-2",
        }))])
        .await;
        let api_key = create_key(&harness, "readonly").await;

        let request = JsonRpcMessage::request(
            json!(1),
            "tools/list",
            json!({ "_meta": { "headers": { "x-api-key": api_key } } }),
        );
        let reply = harness.gateway.handle_message(request).await.unwrap();
        let result = reply.result.unwrap();

        let names: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["list_customers"]);
        assert_eq!(result["nextCursor"], json!("page-2"));

        // List requests are not audited as tool calls.
        assert_eq!(harness.audit.count().await, 0);
    }

    #[tokio::test]
    async fn tools_list_without_credential_is_401_and_unaudited() {
        let harness = harness(vec![]).await;
        let request = JsonRpcMessage::request(json!(1), "tools/list", json!({}));
        let reply = harness.gateway.handle_message(request).await.unwrap();
        assert_eq!(reply.error.unwrap().code, 401);
        assert_eq!(harness.audit.count().await, 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_403_even_for_admin() {
        let harness = harness(vec![]).await;
        let api_key = create_key(&harness, "admin").await;

        let reply = harness
            .gateway
            .handle_message(call_request(1, "not_a_tool", Some(&api_key)))
            .await
            .unwrap();
        assert_eq!(reply.error.unwrap().code, 403);

        let events = harness.audit.all_events().await;
        assert_eq!(events[0].decision["authz"]["reason"], json!("unknown_tool"));
    }

    #[tokio::test]
    async fn initialize_advertises_upstream_identity() {
        let harness = harness(vec![]).await;
        let request = JsonRpcMessage::request(json!(1), "initialize", json!({}));
        let reply = harness.gateway.handle_message(request).await.unwrap();
        let result = reply.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], json!("crm-upstream"));
        assert_eq!(result["capabilities"]["tools"], json!({}));
    }

    #[tokio::test]
    async fn passthrough_forwards_resources_after_auth() {
        let harness = harness(vec![Ok(json!({ "resources": [] }))]).await;
        let api_key = create_key(&harness, "readonly").await;

        let request = JsonRpcMessage::request(
            json!(1),
            "resources/list",
            json!({ "_meta": { "headers": { "x-api-key": api_key } } }),
        );
        let reply = harness.gateway.handle_message(request).await.unwrap();
        assert_eq!(reply.result.unwrap()["resources"], json!([]));

        let unauthenticated =
            JsonRpcMessage::request(json!(2), "resources/read", json!({ "uri": "db://x" }));
        let reply = harness.gateway.handle_message(unauthenticated).await.unwrap();
        assert_eq!(reply.error.unwrap().code, 401);
    }

    #[tokio::test]
    async fn notifications_and_unknown_methods() {
        let harness = harness(vec![]).await;

        let note = JsonRpcMessage::notification("notifications/initialized", json!({}));
        assert!(harness.gateway.handle_message(note).await.is_none());

        let request = JsonRpcMessage::request(json!(1), "sampling/createMessage", json!({}));
        let reply = harness.gateway.handle_message(request).await.unwrap();
        assert_eq!(reply.error.unwrap().code, -32601);

        let ping = JsonRpcMessage::request(json!(2), "ping", json!({}));
        let reply = harness.gateway.handle_message(ping).await.unwrap();
        assert_eq!(reply.result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn request_arguments_are_sanitized_in_audit() {
        let harness = harness(vec![]).await;
        let api_key = create_key(&harness, "readonly").await;

        let mut request = call_request(1, "list_customers", Some(&api_key));
        request.params.as_mut().unwrap()["arguments"] =
            json!({ "password": "hunter2", "filter": "active" });
        // No scripted reply: the forward fails, but the audit row must still
        // carry the sanitized arguments.
        let _ = harness.gateway.handle_message(request).await.unwrap();

        let events = harness.audit.all_events().await;
        assert_eq!(
            events[0].request_json["arguments"]["password"],
            json!("[REDACTED]")
        );
        assert_eq!(
            events[0].request_json["arguments"]["filter"],
            json!("active")
        );
    }

    #[tokio::test]
    async fn serve_loop_round_trips_frames() {
        let harness = harness(vec![]).await;
        let api_key = create_key(&harness, "readonly").await;

        let request = call_request(7, "delete_customer", Some(&api_key));
        let mut input = serde_json::to_string(&request).unwrap();
        input.push('\n');
        input.push_str("this is not json\n");

        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let serve = tokio::spawn(harness.gateway.clone().serve(server_read, server_write));

        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();
        drop(client_write);

        let mut output = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client_read, &mut output)
            .await
            .unwrap();
        serve.await.unwrap().unwrap();

        let frames: Vec<JsonRpcMessage> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        let call_reply = frames
            .iter()
            .find(|f| f.id == Some(json!(7)))
            .expect("reply for the tool call");
        assert_eq!(call_reply.error.as_ref().unwrap().code, 403);
        // "id": null round-trips to None through Option<Value>.
        let parse_reply = frames
            .iter()
            .find(|f| f.error.as_ref().map(|e| e.code) == Some(-32700))
            .expect("parse error frame");
        assert!(parse_reply.id.is_none());
    }
}
