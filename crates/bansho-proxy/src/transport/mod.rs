//! MCP transports for the upstream server.

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

use bansho_types::{BanshoError, McpTransport};

use crate::upstream::UpstreamTarget;

/// Build the transport for the configured upstream target. The returned
/// transport is connected but not yet initialized; the upstream session
/// performs the MCP handshake.
pub fn open_transport(target: &UpstreamTarget) -> Result<Box<dyn McpTransport>, BanshoError> {
    match target {
        UpstreamTarget::Stdio { command } => Ok(Box::new(StdioTransport::spawn(command)?)),
        UpstreamTarget::Http { url } => Ok(Box::new(HttpTransport::new(url)?)),
    }
}
