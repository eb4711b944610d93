/// Shared types, traits, and errors for the Bansho MCP gateway.
///
/// This crate is the foundation the other Bansho crates depend on:
/// - **Trait contracts** (`traits`) for the credential store, counter store,
///   audit sink, and MCP transport
/// - **Shared data types** (`model`) used across the pipeline
/// - **Error types** (`errors`) for unified error handling
/// - **Policy model** (`policy`) parsed from the YAML policy document
/// - **Settings** (`config`) resolved from the environment
pub mod config;
pub mod errors;
pub mod model;
pub mod policy;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use config::{Settings, UpstreamTransportKind};
pub use errors::BanshoError;
pub use model::*;
pub use policy::{Policy, RateLimitWindow};
pub use traits::*;
