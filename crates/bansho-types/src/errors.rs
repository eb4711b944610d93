/// Unified error type for the Bansho gateway.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors are converted into the appropriate variant. The
/// gateway boundary is the only place these become JSON-RPC wire errors.
#[derive(Debug, thiserror::Error)]
pub enum BanshoError {
    /// Error from configuration or policy loading and validation.
    #[error("config error: {0}")]
    Config(String),

    /// Error from the relational store (connection, query, migration).
    #[error("database error: {0}")]
    Database(String),

    /// Error from the counter store backing the rate limiter.
    #[error("counter store error: {0}")]
    CounterStore(String),

    /// Error from credential generation or hashing.
    #[error("credential error: {0}")]
    Credential(String),

    /// Error from the audit sink.
    #[error("audit error: {0}")]
    Audit(String),

    /// Error at the MCP transport layer (framing, process, connection).
    #[error("MCP transport error: {0}")]
    Mcp(String),

    /// Error from the upstream MCP session (handshake, request failure).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BanshoError {
    /// Short variant name, recorded in audit payloads as `error.type` so that
    /// upstream failures can be diagnosed after the fact.
    pub fn kind(&self) -> &'static str {
        match self {
            BanshoError::Config(_) => "Config",
            BanshoError::Database(_) => "Database",
            BanshoError::CounterStore(_) => "CounterStore",
            BanshoError::Credential(_) => "Credential",
            BanshoError::Audit(_) => "Audit",
            BanshoError::Mcp(_) => "Mcp",
            BanshoError::Upstream(_) => "Upstream",
            BanshoError::Serialization(_) => "Serialization",
            BanshoError::Internal(_) => "Internal",
        }
    }
}

impl From<serde_json::Error> for BanshoError {
    fn from(err: serde_json::Error) -> Self {
        BanshoError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BanshoError {
    fn from(err: serde_yaml::Error) -> Self {
        BanshoError::Serialization(err.to_string())
    }
}
