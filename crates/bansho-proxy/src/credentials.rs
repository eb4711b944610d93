//! Presented-key extraction from MCP request metadata.
//!
//! The downstream transport is stdio, so HTTP headers reach the gateway only
//! through the request's `_meta` mapping. Precedence, first match wins:
//!
//! 1. `authorization: Bearer <token>` (scheme case-insensitive)
//! 2. `x-api-key`
//! 3. `_meta.query` / `_meta.query_params` mapping, key `api_key`
//!
//! All names are matched case-insensitively; all values are trimmed.

use std::collections::HashMap;

use serde_json::Value;

/// Extract the presented API key from a request's params, or `None`.
pub fn extract_api_key(params: Option<&Value>) -> Option<String> {
    let meta = params?.get("_meta")?;

    let headers = string_mapping(meta.get("headers"));
    if let Some(token) = bearer_token(headers.get("authorization").map(String::as_str)) {
        return Some(token);
    }
    if let Some(key) = headers.get("x-api-key") {
        return Some(key.clone());
    }

    let mut query = string_mapping(meta.get("query"));
    for (name, value) in string_mapping(meta.get("query_params")) {
        query.entry(name).or_insert(value);
    }
    query.get("api_key").cloned()
}

/// Collect a JSON mapping into lower-cased, trimmed, non-empty string pairs.
fn string_mapping(value: Option<&Value>) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    let Some(Value::Object(entries)) = value else {
        return mapping;
    };
    for (name, value) in entries {
        let name = name.trim().to_lowercase();
        let Some(value) = value.as_str().map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        mapping.insert(name, value.to_string());
    }
    mapping
}

fn bearer_token(authorization: Option<&str>) -> Option<String> {
    let authorization = authorization?.trim();
    let (scheme, token) = authorization.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bearer_header_wins_over_everything() {
        let params = json!({
            "_meta": {
                "headers": {
                    "Authorization": "Bearer  msl_bearer ",
                    "X-API-Key": "msl_header",
                },
                "query": { "api_key": "msl_query" },
            }
        });
        assert_eq!(extract_api_key(Some(&params)).as_deref(), Some("msl_bearer"));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let params = json!({
            "_meta": { "headers": { "authorization": "BEARER msl_token" } }
        });
        assert_eq!(extract_api_key(Some(&params)).as_deref(), Some("msl_token"));
    }

    #[test]
    fn non_bearer_authorization_falls_through() {
        let params = json!({
            "_meta": {
                "headers": {
                    "authorization": "Basic dXNlcjpwYXNz",
                    "x-api-key": "msl_header",
                }
            }
        });
        assert_eq!(extract_api_key(Some(&params)).as_deref(), Some("msl_header"));
    }

    #[test]
    fn query_params_are_the_last_resort() {
        let params = json!({ "_meta": { "query_params": { "API_KEY": " msl_qp " } } });
        assert_eq!(extract_api_key(Some(&params)).as_deref(), Some("msl_qp"));

        let params = json!({
            "_meta": {
                "query": { "api_key": "msl_query" },
                "query_params": { "api_key": "msl_qp" },
            }
        });
        assert_eq!(extract_api_key(Some(&params)).as_deref(), Some("msl_query"));
    }

    #[test]
    fn blank_values_and_missing_meta_yield_none() {
        assert_eq!(extract_api_key(None), None);
        assert_eq!(extract_api_key(Some(&json!({}))), None);
        assert_eq!(extract_api_key(Some(&json!({ "_meta": {} }))), None);

        let params = json!({ "_meta": { "headers": { "x-api-key": "   " } } });
        assert_eq!(extract_api_key(Some(&params)), None);

        let params = json!({ "_meta": { "headers": { "authorization": "Bearer   " } } });
        assert_eq!(extract_api_key(Some(&params)), None);

        let params = json!({ "_meta": { "headers": { "authorization": "msl_no_scheme" } } });
        assert_eq!(extract_api_key(Some(&params)), None);
    }

    #[test]
    fn non_string_values_are_ignored() {
        let params = json!({ "_meta": { "headers": { "x-api-key": 42 } } });
        assert_eq!(extract_api_key(Some(&params)), None);
    }
}
