//! Per-call authorization.
//!
//! Combines the policy's role allow-lists with the startup tool registry. A
//! tool missing from the registry denies with `unknown_tool` rather than a
//! distinct wire code, so unauthorized callers cannot probe which tools
//! exist — every denial is the same 403 on the wire.

use bansho_types::policy::{Policy, TOOL_WILDCARD};
use bansho_types::AuthzDecision;

use crate::registry::ToolRegistry;

/// How the authorization stage ruled for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    pub allowed: bool,
    pub role: String,
    pub tool_name: String,
    pub reason: &'static str,
    pub matched_rule: String,
}

impl From<&AuthorizationDecision> for AuthzDecision {
    fn from(decision: &AuthorizationDecision) -> Self {
        AuthzDecision {
            allowed: decision.allowed,
            role: Some(decision.role.clone()),
            reason: decision.reason.to_string(),
            matched_rule: Some(decision.matched_rule.clone()),
        }
    }
}

/// Evaluate whether `role` may call `tool_name`.
pub fn authorize_tool(
    policy: &Policy,
    registry: &ToolRegistry,
    role: &str,
    tool_name: &str,
) -> AuthorizationDecision {
    let role = role.trim().to_lowercase();
    let tool = tool_name.trim().to_string();

    if tool.is_empty() {
        return AuthorizationDecision {
            allowed: false,
            role,
            tool_name: tool,
            reason: "empty_tool_name",
            matched_rule: "deny:empty_tool_name".to_string(),
        };
    }

    let Some(role_policy) = policy.roles.for_role(&role) else {
        return AuthorizationDecision {
            allowed: false,
            role,
            tool_name: tool,
            reason: "unknown_role",
            matched_rule: "deny:unknown_role".to_string(),
        };
    };

    if !registry.contains(&tool) {
        return AuthorizationDecision {
            allowed: false,
            role,
            tool_name: tool,
            reason: "unknown_tool",
            matched_rule: "deny:unknown_tool".to_string(),
        };
    }

    if role_policy.allows(&tool) {
        let matched_tool = if role_policy.allow.iter().any(|t| t == TOOL_WILDCARD) {
            TOOL_WILDCARD
        } else {
            tool.as_str()
        };
        let matched_rule = format!("roles.{role}.allow:{matched_tool}");
        return AuthorizationDecision {
            allowed: true,
            role,
            tool_name: tool,
            reason: "allowed",
            matched_rule,
        };
    }

    AuthorizationDecision {
        allowed: false,
        matched_rule: format!("roles.{role}.allow"),
        role,
        tool_name: tool,
        reason: "tool_not_allowed_for_role",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bansho_types::McpToolDef;
    use serde_json::json;

    fn registry(names: &[&str]) -> ToolRegistry {
        ToolRegistry::from_tools(
            names
                .iter()
                .map(|name| McpToolDef {
                    name: name.to_string(),
                    description: None,
                    input_schema: json!({}),
                })
                .collect(),
        )
    }

    fn policy() -> Policy {
        serde_yaml::from_str::<Policy>(
            r#"
roles:
  admin: { allow: ["*"] }
  user: { allow: ["public.echo"] }
  readonly: { allow: ["public.echo"] }
"#,
        )
        .unwrap()
        .normalize()
        .unwrap()
    }

    #[test]
    fn wildcard_admin_matches_any_registered_tool() {
        let decision = authorize_tool(
            &policy(),
            &registry(&["public.echo", "sensitive.delete"]),
            "admin",
            "sensitive.delete",
        );
        assert!(decision.allowed);
        assert_eq!(decision.reason, "allowed");
        assert_eq!(decision.matched_rule, "roles.admin.allow:*");
    }

    #[test]
    fn explicit_allow_names_the_tool_in_the_rule() {
        let decision = authorize_tool(
            &policy(),
            &registry(&["public.echo"]),
            " User ",
            " public.echo ",
        );
        assert!(decision.allowed);
        assert_eq!(decision.matched_rule, "roles.user.allow:public.echo");
    }

    #[test]
    fn registered_but_disallowed_tool_is_denied_for_role() {
        let decision = authorize_tool(
            &policy(),
            &registry(&["public.echo", "sensitive.delete"]),
            "readonly",
            "sensitive.delete",
        );
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "tool_not_allowed_for_role");
        assert_eq!(decision.matched_rule, "roles.readonly.allow");
    }

    #[test]
    fn unregistered_tool_is_unknown_even_for_admin() {
        let decision = authorize_tool(
            &policy(),
            &registry(&["public.echo"]),
            "admin",
            "sensitive.delete",
        );
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "unknown_tool");
    }

    #[test]
    fn unknown_role_and_empty_tool_are_denied_first() {
        let registry = registry(&["public.echo"]);

        let decision = authorize_tool(&policy(), &registry, "operator", "public.echo");
        assert_eq!(decision.reason, "unknown_role");

        let decision = authorize_tool(&policy(), &registry, "admin", "   ");
        assert_eq!(decision.reason, "empty_tool_name");
    }
}
