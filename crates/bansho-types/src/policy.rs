/// The role / rate-limit policy document.
///
/// Parsed from YAML at process start, normalized once, immutable afterwards
/// (reload requires a restart). Normalization is a pure function; the query
/// operations drive both authorization and the rate limiter.
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::BanshoError;

/// Sentinel tool name meaning "all tools". Permitted only for role `admin`.
pub const TOOL_WILDCARD: &str = "*";

/// Default on-disk location of the policy document.
pub const DEFAULT_POLICY_PATH: &str = "config/policies.yaml";

// ============================================================
// Document Types
// ============================================================

/// Ordered allow-list of tool names for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RoleToolPolicy {
    pub allow: Vec<String>,
}

impl RoleToolPolicy {
    fn wildcard() -> Self {
        Self {
            allow: vec![TOOL_WILDCARD.to_string()],
        }
    }

    /// Whether this role may call `tool_name`. Empty names never match.
    pub fn allows(&self, tool_name: &str) -> bool {
        let tool = tool_name.trim();
        if tool.is_empty() {
            return false;
        }
        self.allow.iter().any(|t| t == TOOL_WILDCARD || t == tool)
    }

    fn normalized(&self, role_name: &str) -> Result<Self, BanshoError> {
        let mut allow: Vec<String> = Vec::new();
        for tool in &self.allow {
            let tool = tool.trim();
            if tool.is_empty() {
                return Err(BanshoError::Config(format!(
                    "roles.{role_name}.allow: tool names must be non-empty"
                )));
            }
            if tool == TOOL_WILDCARD {
                return Ok(Self::wildcard());
            }
            if !allow.iter().any(|t| t == tool) {
                allow.push(tool.to_string());
            }
        }
        Ok(Self { allow })
    }
}

/// The three fixed roles and their allow-lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RolesPolicy {
    pub admin: RoleToolPolicy,
    pub user: RoleToolPolicy,
    pub readonly: RoleToolPolicy,
}

impl Default for RolesPolicy {
    fn default() -> Self {
        Self {
            admin: RoleToolPolicy::wildcard(),
            user: RoleToolPolicy::default(),
            readonly: RoleToolPolicy::default(),
        }
    }
}

impl RolesPolicy {
    /// Look up the policy for a role name, trimmed and case-insensitive.
    /// Unknown roles return `None`.
    pub fn for_role(&self, role: &str) -> Option<&RoleToolPolicy> {
        match role.trim().to_lowercase().as_str() {
            "admin" => Some(&self.admin),
            "user" => Some(&self.user),
            "readonly" => Some(&self.readonly),
            _ => None,
        }
    }
}

/// One fixed window: at most `requests` calls per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitWindow {
    pub requests: u64,
    pub window_seconds: u64,
}

impl Default for RateLimitWindow {
    fn default() -> Self {
        Self {
            requests: 60,
            window_seconds: 60,
        }
    }
}

impl RateLimitWindow {
    fn validate(&self, context: &str) -> Result<(), BanshoError> {
        if self.requests == 0 {
            return Err(BanshoError::Config(format!(
                "{context}: requests must be greater than 0"
            )));
        }
        if self.window_seconds == 0 {
            return Err(BanshoError::Config(format!(
                "{context}: window_seconds must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// A partial window for a per-tool override. Unset fields inherit from the
/// per-tool default at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
}

impl RateLimitOverride {
    fn resolve(&self, default: &RateLimitWindow) -> RateLimitWindow {
        RateLimitWindow {
            requests: self.requests.unwrap_or(default.requests),
            window_seconds: self.window_seconds.unwrap_or(default.window_seconds),
        }
    }
}

/// Per-tool rate-limit policy: a default window plus named overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolRateLimitPolicy {
    pub default: RateLimitWindow,
    pub overrides: HashMap<String, RateLimitOverride>,
}

impl Default for ToolRateLimitPolicy {
    fn default() -> Self {
        Self {
            default: RateLimitWindow {
                requests: 30,
                window_seconds: 60,
            },
            overrides: HashMap::new(),
        }
    }
}

impl ToolRateLimitPolicy {
    /// The effective window for `tool_name`: the override by exact trimmed
    /// name if present, otherwise the tool default.
    pub fn for_tool(&self, tool_name: &str) -> RateLimitWindow {
        let tool = tool_name.trim();
        if tool.is_empty() {
            return self.default;
        }
        match self.overrides.get(tool) {
            Some(over) => over.resolve(&self.default),
            None => self.default,
        }
    }
}

/// The rate-limit section of the policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitsPolicy {
    pub per_api_key: RateLimitWindow,
    pub per_tool: ToolRateLimitPolicy,
}

impl Default for RateLimitsPolicy {
    fn default() -> Self {
        Self {
            per_api_key: RateLimitWindow {
                requests: 120,
                window_seconds: 60,
            },
            per_tool: ToolRateLimitPolicy::default(),
        }
    }
}

// ============================================================
// Policy
// ============================================================

/// The whole policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Policy {
    pub roles: RolesPolicy,
    pub rate_limits: RateLimitsPolicy,
}

impl Policy {
    /// Normalize and validate the document.
    ///
    /// 1. Each role's allow-list collapses to exactly `["*"]` when it contains
    ///    the wildcard, otherwise deduplicates in input order; empty names are
    ///    rejected.
    /// 2. `"*"` outside role `admin` is a load-time error.
    /// 3. Every window, including each override resolved against the tool
    ///    default, must be positive.
    ///
    /// Normalization is idempotent: `normalize(normalize(p)) == normalize(p)`.
    pub fn normalize(&self) -> Result<Policy, BanshoError> {
        let roles = RolesPolicy {
            admin: self.roles.admin.normalized("admin")?,
            user: self.roles.user.normalized("user")?,
            readonly: self.roles.readonly.normalized("readonly")?,
        };

        for (role_name, role) in [("user", &roles.user), ("readonly", &roles.readonly)] {
            if role.allow.iter().any(|t| t == TOOL_WILDCARD) {
                return Err(BanshoError::Config(format!(
                    "roles.{role_name}.allow: \"*\" is permitted only for role admin"
                )));
            }
        }

        let rate_limits = &self.rate_limits;
        rate_limits
            .per_api_key
            .validate("rate_limits.per_api_key")?;
        rate_limits
            .per_tool
            .default
            .validate("rate_limits.per_tool.default")?;

        let mut overrides = HashMap::with_capacity(rate_limits.per_tool.overrides.len());
        for (tool_name, over) in &rate_limits.per_tool.overrides {
            let tool = tool_name.trim();
            if tool.is_empty() {
                return Err(BanshoError::Config(
                    "rate_limits.per_tool.overrides: tool names must be non-empty".to_string(),
                ));
            }
            over.resolve(&rate_limits.per_tool.default)
                .validate(&format!("rate_limits.per_tool.overrides.{tool}"))?;
            overrides.insert(tool.to_string(), *over);
        }

        Ok(Policy {
            roles,
            rate_limits: RateLimitsPolicy {
                per_api_key: rate_limits.per_api_key,
                per_tool: ToolRateLimitPolicy {
                    default: rate_limits.per_tool.default,
                    overrides,
                },
            },
        })
    }

    /// Whether `role` may call `tool_name`. Unknown roles and empty tool
    /// names are always denied.
    pub fn is_tool_allowed(&self, role: &str, tool_name: &str) -> bool {
        match self.roles.for_role(role) {
            Some(role_policy) => role_policy.allows(tool_name),
            None => false,
        }
    }

    /// The effective per-tool window for `tool_name`.
    pub fn limit_for(&self, tool_name: &str) -> RateLimitWindow {
        self.rate_limits.per_tool.for_tool(tool_name)
    }

    /// The per-key window applied to every call regardless of tool.
    pub fn per_api_key_limit(&self) -> RateLimitWindow {
        self.rate_limits.per_api_key
    }
}

/// Load and normalize the policy document at `path`.
///
/// Any failure (missing file, invalid YAML, schema violation, wildcard in a
/// non-admin role) is a startup error — the gateway refuses to serve with a
/// policy it cannot fully validate.
pub fn load_policy(path: impl AsRef<Path>) -> Result<Policy, BanshoError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| BanshoError::Config(format!("failed to read policy {}: {e}", path.display())))?;
    let policy: Policy = serde_yaml::from_str(&raw)
        .map_err(|e| BanshoError::Config(format!("failed to parse policy {}: {e}", path.display())))?;
    policy.normalize()
}
