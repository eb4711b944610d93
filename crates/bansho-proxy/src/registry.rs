//! The tool registry mirror.
//!
//! A snapshot taken once at startup: the name set answers `unknown_tool`
//! decisions in O(1), the full metadata array is what the gateway
//! re-advertises downstream. There is no dynamic refresh — if the upstream
//! adds a tool after startup, the gateway will not expose it until restart.

use std::collections::HashSet;

use bansho_types::{BanshoError, McpToolDef};

use crate::upstream::Upstream;

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    names: HashSet<String>,
    tools: Vec<McpToolDef>,
}

impl ToolRegistry {
    pub fn from_tools(tools: Vec<McpToolDef>) -> Self {
        let names = tools.iter().map(|tool| tool.name.clone()).collect();
        Self { names, tools }
    }

    /// Enumerate the upstream's tools by paging `tools/list` to exhaustion.
    pub async fn discover(upstream: &Upstream) -> Result<Self, BanshoError> {
        Ok(Self::from_tools(upstream.list_all_tools().await?))
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.names.contains(tool_name.trim())
    }

    pub fn tools(&self) -> &[McpToolDef] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
