/// The Bansho proxy engine:
///
/// - **transport**: MCP transports for the upstream server (stdio child
///   process, streamable HTTP)
/// - **upstream**: the single long-lived MCP client session
/// - **registry**: the startup snapshot of upstream tools
/// - **credentials**: presented-key extraction from request metadata
/// - **authz**: the per-call authorization decision
/// - **gateway**: the downstream server loop and the request-interception
///   pipeline (authenticate → authorize → rate-limit → forward → audit)
pub mod authz;
pub mod credentials;
pub mod gateway;
pub mod registry;
pub mod transport;
pub mod upstream;

pub use gateway::Gateway;
pub use registry::ToolRegistry;
pub use transport::open_transport;
pub use upstream::{InitializeSnapshot, Upstream, UpstreamTarget};
