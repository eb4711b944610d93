//! The upstream MCP client session.
//!
//! One [`Upstream`] owns one session for the lifetime of the process. The
//! transport is handed in already constructed; `connect()` performs the MCP
//! `initialize` handshake (idempotently — later calls return the cached
//! snapshot) and captures the upstream's identity for re-advertisement
//! downstream. Requests are serialized through the session lock, which is
//! the per-channel ordering the wire protocol requires; ids increment per
//! session and responses are paired to requests by id.

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use bansho_types::{BanshoError, JsonRpcMessage, McpToolDef, McpTransport};
use bansho_types::{Settings, UpstreamTransportKind};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// What the upstream reported in its `initialize` response.
#[derive(Debug, Clone)]
pub struct InitializeSnapshot {
    pub protocol_version: Value,
    pub capabilities: Value,
    /// Absent when the upstream omitted server-info; the gateway substitutes
    /// its own name downstream in that case.
    pub server_info: Option<Value>,
    pub instructions: Option<String>,
}

impl InitializeSnapshot {
    fn from_result(result: &Value) -> Self {
        Self {
            protocol_version: result
                .get("protocolVersion")
                .cloned()
                .unwrap_or_else(|| json!(MCP_PROTOCOL_VERSION)),
            capabilities: result.get("capabilities").cloned().unwrap_or_else(|| json!({})),
            server_info: result.get("serverInfo").cloned(),
            instructions: result
                .get("instructions")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// Where the upstream lives, validated from settings.
#[derive(Debug, Clone)]
pub enum UpstreamTarget {
    Stdio { command: String },
    Http { url: String },
}

impl UpstreamTarget {
    pub fn from_settings(settings: &Settings) -> Result<Self, BanshoError> {
        match settings.upstream_transport {
            UpstreamTransportKind::Stdio => {
                if settings.upstream_cmd.trim().is_empty() {
                    return Err(BanshoError::Config(
                        "UPSTREAM_CMD is required when UPSTREAM_TRANSPORT=stdio".to_string(),
                    ));
                }
                Ok(Self::Stdio {
                    command: settings.upstream_cmd.clone(),
                })
            }
            UpstreamTransportKind::Http => {
                if settings.upstream_url.trim().is_empty() {
                    return Err(BanshoError::Config(
                        "UPSTREAM_URL is required when UPSTREAM_TRANSPORT=http".to_string(),
                    ));
                }
                Ok(Self::Http {
                    url: settings.upstream_url.clone(),
                })
            }
        }
    }
}

enum SessionState {
    /// Transport constructed, handshake not yet performed.
    Pending(Box<dyn McpTransport>),
    /// Handshake complete; requests flow.
    Ready {
        transport: Box<dyn McpTransport>,
        init: InitializeSnapshot,
        next_id: u64,
    },
    /// Shut down; further calls fail.
    Closed,
}

pub struct Upstream {
    state: Mutex<SessionState>,
}

impl Upstream {
    /// Wrap an already-constructed transport. The session stays uninitialized
    /// until [`Upstream::connect`].
    pub fn new(transport: Box<dyn McpTransport>) -> Self {
        Self {
            state: Mutex::new(SessionState::Pending(transport)),
        }
    }

    /// Perform the initialize handshake, or return the cached snapshot when
    /// already connected. After [`Upstream::shutdown`] this fails.
    pub async fn connect(&self) -> Result<InitializeSnapshot, BanshoError> {
        let mut state = self.state.lock().await;
        Self::ensure_ready(&mut state).await?;
        match &*state {
            SessionState::Ready { init, .. } => Ok(init.clone()),
            _ => Err(BanshoError::Upstream(
                "upstream session is not connected".to_string(),
            )),
        }
    }

    /// Send one request and wait for its response. Connects first if the
    /// handshake has not happened yet.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BanshoError> {
        let mut state = self.state.lock().await;
        Self::ensure_ready(&mut state).await?;
        let SessionState::Ready {
            transport, next_id, ..
        } = &mut *state
        else {
            return Err(BanshoError::Upstream(
                "upstream session is not connected".to_string(),
            ));
        };

        *next_id += 1;
        let request_id = *next_id;
        transport
            .send(JsonRpcMessage::request(json!(request_id), method, params))
            .await
            .map_err(|e| BanshoError::Upstream(format!("failed to send {method}: {e}")))?;

        let response = Self::recv_response(transport.as_mut(), request_id, method).await?;
        if let Some(error) = response.error {
            return Err(BanshoError::Upstream(format!(
                "upstream returned error for {method}: {} (code {})",
                error.message, error.code
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Page `tools/list` until the upstream returns no cursor.
    pub async fn list_all_tools(&self) -> Result<Vec<McpToolDef>, BanshoError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.request("tools/list", params).await?;

            let page = result
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    BanshoError::Upstream("tools/list result has no 'tools' array".to_string())
                })?;
            for tool in page {
                let tool: McpToolDef = serde_json::from_value(tool.clone()).map_err(|e| {
                    BanshoError::Upstream(format!("failed to parse tool definition: {e}"))
                })?;
                tools.push(tool);
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        debug!(tool_count = tools.len(), "enumerated upstream tools");
        Ok(tools)
    }

    /// Forward a `tools/call` with the original arguments.
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value, BanshoError> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    /// Close the session. Further calls fail.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let SessionState::Ready { transport, .. } | SessionState::Pending(transport) =
            &mut *state
        {
            let _ = transport.close().await;
        }
        *state = SessionState::Closed;
    }

    async fn ensure_ready(state: &mut SessionState) -> Result<(), BanshoError> {
        match state {
            SessionState::Ready { .. } => Ok(()),
            SessionState::Closed => Err(BanshoError::Upstream(
                "upstream session was shut down".to_string(),
            )),
            SessionState::Pending(_) => {
                let SessionState::Pending(mut transport) =
                    std::mem::replace(state, SessionState::Closed)
                else {
                    unreachable!("matched Pending above");
                };

                match Self::handshake(transport.as_mut()).await {
                    Ok(init) => {
                        info!(
                            server_info = %init.server_info.clone().unwrap_or_else(|| json!(null)),
                            "upstream session initialized"
                        );
                        *state = SessionState::Ready {
                            transport,
                            init,
                            next_id: 1,
                        };
                        Ok(())
                    }
                    Err(e) => {
                        let _ = transport.close().await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn handshake(
        transport: &mut dyn McpTransport,
    ) -> Result<InitializeSnapshot, BanshoError> {
        let init_request = JsonRpcMessage::request(
            json!(1),
            "initialize",
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "bansho",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );
        transport
            .send(init_request)
            .await
            .map_err(|e| BanshoError::Upstream(format!("failed to send initialize: {e}")))?;

        let response = Self::recv_response(transport, 1, "initialize").await?;
        if let Some(error) = response.error {
            return Err(BanshoError::Upstream(format!(
                "upstream rejected initialize: {} (code {})",
                error.message, error.code
            )));
        }
        let result = response.result.unwrap_or(Value::Null);

        transport
            .send(JsonRpcMessage::notification(
                "notifications/initialized",
                json!({}),
            ))
            .await
            .map_err(|e| {
                BanshoError::Upstream(format!("failed to send initialized notification: {e}"))
            })?;

        Ok(InitializeSnapshot::from_result(&result))
    }

    /// Read frames until the response for `request_id` arrives. Server
    /// notifications and stale responses are skipped.
    async fn recv_response(
        transport: &mut dyn McpTransport,
        request_id: u64,
        method: &str,
    ) -> Result<JsonRpcMessage, BanshoError> {
        loop {
            let message = transport
                .recv()
                .await
                .map_err(|e| BanshoError::Upstream(format!("no response for {method}: {e}")))?;
            if message.is_notification() {
                continue;
            }
            if message.id == Some(json!(request_id)) {
                return Ok(message);
            }
            debug!(id = ?message.id, expected = request_id, "skipping unmatched upstream frame");
        }
    }
}
