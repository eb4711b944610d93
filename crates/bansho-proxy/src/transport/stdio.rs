//! MCP stdio transport.
//!
//! Spawns the upstream MCP server as a child process from a shell-split
//! command line and speaks line-delimited JSON-RPC over its stdin/stdout.
//! The child's stderr is drained into tracing so upstream diagnostics stay
//! visible without corrupting the framing.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use bansho_types::{BanshoError, JsonRpcMessage, McpTransport};

#[derive(Debug)]
pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    connected: bool,
}

impl StdioTransport {
    /// Shell-split `command_line` and spawn it with piped stdio.
    pub fn spawn(command_line: &str) -> Result<Self, BanshoError> {
        let parts = shlex::split(command_line)
            .ok_or_else(|| BanshoError::Config("UPSTREAM_CMD is not valid shell syntax".into()))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(BanshoError::Config(
                "UPSTREAM_CMD is required when UPSTREAM_TRANSPORT=stdio".to_string(),
            ));
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BanshoError::Mcp(format!("failed to spawn upstream '{program}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BanshoError::Mcp("upstream child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BanshoError::Mcp("upstream child has no stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "bansho::upstream", "upstream stderr: {line}");
                }
            });
        }

        debug!(command = %command_line, "spawned upstream MCP server");

        Ok(Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            connected: true,
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), BanshoError> {
        if !self.connected {
            return Err(BanshoError::Mcp("stdio transport is closed".to_string()));
        }
        let mut line = serde_json::to_string(&message)
            .map_err(|e| BanshoError::Serialization(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BanshoError::Mcp(format!("failed to write to upstream stdin: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| BanshoError::Mcp(format!("failed to flush upstream stdin: {e}")))
    }

    async fn recv(&mut self) -> Result<JsonRpcMessage, BanshoError> {
        if !self.connected {
            return Err(BanshoError::Mcp("stdio transport is closed".to_string()));
        }
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| BanshoError::Mcp(format!("failed to read upstream stdout: {e}")))?;

            let Some(line) = line else {
                self.connected = false;
                return Err(BanshoError::Mcp("upstream closed its stdout".to_string()));
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map_err(|e| BanshoError::Mcp(format!("upstream sent an unparseable frame: {e}")));
        }
    }

    async fn close(&mut self) -> Result<(), BanshoError> {
        self.connected = false;
        self.child
            .kill()
            .await
            .map_err(|e| BanshoError::Mcp(format!("failed to stop upstream child: {e}")))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
