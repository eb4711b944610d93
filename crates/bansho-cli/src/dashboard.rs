//! `bansho dashboard` — a read-only admin view over the audit table.
//!
//! Admin keys only: the presented key (X-API-Key header, bearer token, or
//! `api_key` query parameter) is resolved through the credential store and
//! any non-admin role is refused. `/` renders an HTML table of recent
//! events, `/api/events` returns the same data as JSON.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{error, info};

use bansho_security::keys::PostgresCredentialStore;
use bansho_types::{CredentialStore, Settings};

const DEFAULT_EVENT_LIMIT: i64 = 50;
const MAX_EVENT_LIMIT: i64 = 200;

#[derive(Clone)]
struct DashboardState {
    pool: PgPool,
    credentials: Arc<dyn CredentialStore>,
}

pub async fn run(settings: &Settings) -> anyhow::Result<()> {
    let pool = crate::db::connect_and_migrate(settings).await?;
    let state = DashboardState {
        pool: pool.clone(),
        credentials: Arc::new(PostgresCredentialStore::new(pool)),
    };

    let app = Router::new()
        .route("/", get(dashboard_html))
        .route("/dashboard", get(dashboard_html))
        .route("/api/events", get(events_json))
        .with_state(state);

    let addr = format!("{}:{}", settings.dashboard_host, settings.dashboard_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "bansho dashboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}

struct DashboardFilters {
    api_key_id: Option<String>,
    tool_name: Option<String>,
    limit: i64,
}

fn extract_filters(params: &HashMap<String, String>) -> Result<DashboardFilters, Response> {
    let limit = match params.get("limit") {
        Some(raw) => raw.trim().parse::<i64>().ok().filter(|n| *n > 0).ok_or_else(|| {
            json_error(StatusCode::BAD_REQUEST, 400, "limit must be a positive integer")
        })?,
        None => DEFAULT_EVENT_LIMIT,
    };

    Ok(DashboardFilters {
        api_key_id: non_empty(params.get("api_key_id")),
        tool_name: non_empty(params.get("tool_name")),
        limit: limit.min(MAX_EVENT_LIMIT),
    })
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Resolve the presented key and require role `admin`.
async fn authenticate_admin(
    state: &DashboardState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<(), Response> {
    let presented = presented_api_key(headers, params)
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, 401, "Unauthorized"))?;

    let identity = match state.credentials.resolve(&presented).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return Err(json_error(StatusCode::UNAUTHORIZED, 401, "Unauthorized")),
        Err(err) => {
            error!(error = %err, "dashboard credential resolution failed");
            return Err(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                500,
                "Dashboard query failed",
            ));
        }
    };

    if !identity.role.trim().eq_ignore_ascii_case("admin") {
        return Err(json_error(StatusCode::FORBIDDEN, 403, "Forbidden"));
    }
    Ok(())
}

fn presented_api_key(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().split_once(char::is_whitespace))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
    {
        return Some(token.to_string());
    }

    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(key.to_string());
    }

    non_empty(params.get("api_key"))
}

async fn events_json(
    State(state): State<DashboardState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (filters, events) = match load_events(&state, &headers, &params).await {
        Ok(loaded) => loaded,
        Err(response) => return response,
    };

    Json(json!({
        "count": events.len(),
        "filters": {
            "api_key_id": filters.api_key_id,
            "tool_name": filters.tool_name,
            "limit": filters.limit,
        },
        "events": events,
    }))
    .into_response()
}

async fn dashboard_html(
    State(state): State<DashboardState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (filters, events) = match load_events(&state, &headers, &params).await {
        Ok(loaded) => loaded,
        Err(response) => return response,
    };
    Html(render_dashboard(&events, &filters)).into_response()
}

async fn load_events(
    state: &DashboardState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<(DashboardFilters, Vec<Value>), Response> {
    authenticate_admin(state, headers, params).await?;
    let filters = extract_filters(params)?;
    match fetch_recent_events(&state.pool, &filters).await {
        Ok(events) => Ok((filters, events)),
        Err(err) => {
            error!(error = %err, "dashboard event query failed");
            Err(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                500,
                "Dashboard query failed",
            ))
        }
    }
}

async fn fetch_recent_events(
    pool: &PgPool,
    filters: &DashboardFilters,
) -> Result<Vec<Value>, sqlx::Error> {
    let mut conditions: Vec<String> = Vec::new();
    let mut next_param = 1;
    if filters.api_key_id.is_some() {
        conditions.push(format!("api_key_id::text = ${next_param}"));
        next_param += 1;
    }
    if filters.tool_name.is_some() {
        conditions.push(format!("tool_name = ${next_param}"));
        next_param += 1;
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT ts, api_key_id::text, role, method, tool_name, status_code, latency_ms, \
         decision, request_json, response_json \
         FROM audit_events {where_clause} ORDER BY ts DESC LIMIT ${next_param}"
    );

    type EventRow = (
        DateTime<Utc>,
        Option<String>,
        String,
        String,
        String,
        i32,
        i32,
        Value,
        Value,
        Value,
    );
    let mut query = sqlx::query_as::<_, EventRow>(&sql);
    if let Some(api_key_id) = &filters.api_key_id {
        query = query.bind(api_key_id);
    }
    if let Some(tool_name) = &filters.tool_name {
        query = query.bind(tool_name);
    }
    let rows = query.bind(filters.limit).fetch_all(pool).await?;

    Ok(rows
        .into_iter()
        .map(
            |(
                ts,
                api_key_id,
                role,
                method,
                tool_name,
                status_code,
                latency_ms,
                decision,
                request_json,
                response_json,
            )| {
                json!({
                    "ts": ts.to_rfc3339(),
                    "api_key_id": api_key_id,
                    "role": role,
                    "method": method,
                    "tool_name": tool_name,
                    "status_code": status_code,
                    "latency_ms": latency_ms,
                    "decision": decision,
                    "request_json": request_json,
                    "response_json": response_json,
                })
            },
        )
        .collect())
}

fn render_dashboard(events: &[Value], filters: &DashboardFilters) -> String {
    let mut rows = String::new();
    for event in events {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(event["ts"].as_str().unwrap_or("")),
            escape_html(event["api_key_id"].as_str().unwrap_or("-")),
            escape_html(event["role"].as_str().unwrap_or("unknown")),
            escape_html(event["tool_name"].as_str().unwrap_or("")),
            event["status_code"].as_i64().unwrap_or(0),
            event["latency_ms"].as_i64().unwrap_or(0),
        ));
    }

    let filter_note = match (&filters.api_key_id, &filters.tool_name) {
        (None, None) => String::from("all keys, all tools"),
        (api_key_id, tool_name) => format!(
            "api_key_id={} tool_name={}",
            escape_html(api_key_id.as_deref().unwrap_or("*")),
            escape_html(tool_name.as_deref().unwrap_or("*")),
        ),
    };

    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Bansho audit dashboard</title>
<style>
body {{ font-family: monospace; margin: 2rem; }}
table {{ border-collapse: collapse; width: 100%; }}
th, td {{ border: 1px solid #ccc; padding: 4px 8px; text-align: left; }}
th {{ background: #f0f0f0; }}
</style>
</head>
<body>
<h1>Bansho audit events</h1>
<p>{count} events ({filter_note}, limit {limit})</p>
<table>
<tr><th>ts</th><th>api_key_id</th><th>role</th><th>tool</th><th>status</th><th>latency_ms</th></tr>
{rows}</table>
</body>
</html>
"#,
        count = events.len(),
        limit = filters.limit,
    )
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn json_error(status: StatusCode, code: i64, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_default_and_clamp() {
        let filters = extract_filters(&HashMap::new()).unwrap();
        assert_eq!(filters.limit, DEFAULT_EVENT_LIMIT);

        let mut params = HashMap::new();
        params.insert("limit".to_string(), "1000".to_string());
        assert_eq!(extract_filters(&params).unwrap().limit, MAX_EVENT_LIMIT);

        params.insert("limit".to_string(), "zero".to_string());
        assert!(extract_filters(&params).is_err());
    }

    #[test]
    fn presented_key_prefers_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "msl_header".parse().unwrap());
        let mut params = HashMap::new();
        params.insert("api_key".to_string(), "msl_query".to_string());
        assert_eq!(
            presented_api_key(&headers, &params).as_deref(),
            Some("msl_header")
        );

        headers.insert(AUTHORIZATION, "Bearer msl_bearer".parse().unwrap());
        assert_eq!(
            presented_api_key(&headers, &params).as_deref(),
            Some("msl_bearer")
        );

        assert_eq!(
            presented_api_key(&HeaderMap::new(), &params).as_deref(),
            Some("msl_query")
        );
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(
            escape_html("<script>\"&\""),
            "&lt;script&gt;&quot;&amp;&quot;"
        );
    }
}
