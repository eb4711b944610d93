//! MCP streamable HTTP transport.
//!
//! HTTP client for a remote upstream MCP server:
//! - HTTP POST for JSON-RPC requests
//! - JSON or SSE (`text/event-stream`) response bodies
//! - Session tracking via the `Mcp-Session-Id` header
//!
//! Responses are buffered as they arrive; `recv()` drains the buffer in
//! order. The upstream session pairs requests and responses by id, so
//! interleaved server notifications pass through the buffer harmlessly.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use bansho_types::{BanshoError, JsonRpcMessage, McpTransport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_HEADER: &str = "mcp-session-id";

// ============================================================
// SSE Event Parser
// ============================================================

/// A parsed SSE event from a `text/event-stream` response.
#[derive(Debug, Clone, Default)]
struct SseEvent {
    /// The `data:` field (accumulated across multiple `data:` lines).
    data: String,
}

/// Parse a raw SSE body into individual events.
///
/// Events are separated by blank lines. Only `data:` fields matter here;
/// `id:`, `event:`, `retry:` and comment lines are skipped.
fn parse_sse_events(body: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    for raw_event in body.split("\n\n") {
        let trimmed = raw_event.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut event = SseEvent::default();
        let mut has_data = false;
        for line in trimmed.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.find(':') {
                Some(pos) => {
                    let value = &line[pos + 1..];
                    (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
                }
                None => (line, ""),
            };
            if field == "data" {
                if has_data {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                has_data = true;
            }
        }

        if has_data {
            events.push(event);
        }
    }
    events
}

// ============================================================
// HttpTransport
// ============================================================

#[derive(Debug)]
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    session_id: Option<String>,
    recv_buffer: VecDeque<JsonRpcMessage>,
    connected: bool,
}

impl HttpTransport {
    pub fn new(url: &str) -> Result<Self, BanshoError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(BanshoError::Config(
                "UPSTREAM_URL is required when UPSTREAM_TRANSPORT=http".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| BanshoError::Mcp(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.to_string(),
            client,
            session_id: None,
            recv_buffer: VecDeque::new(),
            connected: true,
        })
    }

    fn buffer_json_body(&mut self, body: &str) -> Result<(), BanshoError> {
        let message: JsonRpcMessage = serde_json::from_str(body)
            .map_err(|e| BanshoError::Mcp(format!("upstream sent an unparseable body: {e}")))?;
        self.recv_buffer.push_back(message);
        Ok(())
    }

    fn buffer_sse_body(&mut self, body: &str) -> Result<(), BanshoError> {
        for event in parse_sse_events(body) {
            let message: JsonRpcMessage = serde_json::from_str(&event.data).map_err(|e| {
                BanshoError::Mcp(format!("upstream sent an unparseable SSE event: {e}"))
            })?;
            self.recv_buffer.push_back(message);
        }
        Ok(())
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), BanshoError> {
        if !self.connected {
            return Err(BanshoError::Mcp("HTTP transport is closed".to_string()));
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&message);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BanshoError::Mcp(format!("upstream POST failed: {e}")))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if self.session_id.as_deref() != Some(session_id) {
                debug!(session_id, "captured upstream MCP session id");
                self.session_id = Some(session_id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(BanshoError::Mcp(format!(
                "upstream returned HTTP {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| BanshoError::Mcp(format!("failed to read upstream body: {e}")))?;

        // Notifications are acknowledged with an empty body; nothing to buffer.
        if body.trim().is_empty() {
            return Ok(());
        }

        if content_type.starts_with("text/event-stream") {
            self.buffer_sse_body(&body)
        } else {
            self.buffer_json_body(&body)
        }
    }

    async fn recv(&mut self) -> Result<JsonRpcMessage, BanshoError> {
        if !self.connected {
            return Err(BanshoError::Mcp("HTTP transport is closed".to_string()));
        }
        self.recv_buffer
            .pop_front()
            .ok_or_else(|| BanshoError::Mcp("no buffered upstream response".to_string()))
    }

    async fn close(&mut self) -> Result<(), BanshoError> {
        self.connected = false;
        self.recv_buffer.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_url_is_a_config_error() {
        assert!(matches!(
            HttpTransport::new("  ").unwrap_err(),
            BanshoError::Config(_)
        ));
    }

    #[test]
    fn sse_parser_extracts_data_fields() {
        let body = concat!(
            ": comment\n",
            "id: 1\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\n",
            "data: \"method\":\"notifications/progress\"}\n",
            "\n",
        );
        let events = parse_sse_events(body);
        assert_eq!(events.len(), 2);
        assert!(events[0].data.contains("\"id\":1"));
        // Multi-line data fields join with a newline.
        assert!(events[1].data.contains('\n'));
    }

    #[test]
    fn sse_parser_skips_dataless_events() {
        assert!(parse_sse_events("event: ping\n\n: keepalive\n\n").is_empty());
    }

    #[tokio::test]
    async fn sse_body_fills_recv_buffer() {
        let mut transport = HttpTransport::new("http://127.0.0.1:1/mcp").unwrap();
        transport
            .buffer_sse_body("data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n\n")
            .unwrap();
        let message = transport.recv().await.unwrap();
        assert_eq!(message.id, Some(serde_json::json!(3)));
        assert!(transport.recv().await.is_err());
    }
}
