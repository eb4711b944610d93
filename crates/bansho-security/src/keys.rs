//! Credential store implementation.
//!
//! Two backends behind the [`CredentialStore`] trait:
//!
//! - [`InMemoryCredentialStore`]: rows in a `Vec` behind `RwLock`. Useful for
//!   testing and development.
//! - [`PostgresCredentialStore`]: the production store over `api_keys`.
//!
//! Resolution scans all non-revoked rows and verifies the presented key
//! against each record's own salt and iteration count, so the store cannot
//! be queried by hash. The bound is small (operators, not end users) and the
//! PBKDF2 cost per record is the same as any other verification.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use bansho_types::{ApiKeyRecord, BanshoError, CreatedApiKey, CredentialStore, ResolvedIdentity};

use crate::hash::{generate_api_key, hash_api_key_with_iterations, verify_api_key, PBKDF2_ITERATIONS};

pub const DEFAULT_API_KEY_ROLE: &str = "readonly";

/// SQL migration for the `api_keys` table.
pub const CREATE_API_KEYS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS api_keys (
    id uuid PRIMARY KEY,
    key_hash text NOT NULL UNIQUE,
    role text NOT NULL,
    created_at timestamptz NOT NULL DEFAULT NOW(),
    revoked_at timestamptz
);
"#;

/// Create the `api_keys` table if it does not exist.
pub async fn run_migrations(pool: &PgPool) -> Result<(), BanshoError> {
    sqlx::query(CREATE_API_KEYS_TABLE)
        .execute(pool)
        .await
        .map_err(|e| BanshoError::Database(format!("failed to run api_keys migration: {e}")))?;
    info!("api_keys table created or already exists");
    Ok(())
}

/// Trim and lower-case a role; empty falls back to `readonly`.
fn normalize_role(role: &str) -> String {
    let role = role.trim().to_lowercase();
    if role.is_empty() {
        DEFAULT_API_KEY_ROLE.to_string()
    } else {
        role
    }
}

fn parse_api_key_id(api_key_id: &str) -> Option<Uuid> {
    Uuid::parse_str(api_key_id.trim()).ok()
}

// ============================================================
// InMemoryCredentialStore
// ============================================================

#[derive(Debug, Clone)]
struct StoredKey {
    id: Uuid,
    key_hash: String,
    role: String,
    created_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

/// In-memory credential store for testing and development.
#[derive(Clone)]
pub struct InMemoryCredentialStore {
    rows: Arc<RwLock<Vec<StoredKey>>>,
    iterations: u32,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::with_iterations(PBKDF2_ITERATIONS)
    }

    /// Lower iteration counts keep test suites fast; verification still
    /// honors whatever count each stored hash carries.
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            rows: Arc::new(RwLock::new(Vec::new())),
            iterations,
        }
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn create(&self, role: &str) -> Result<CreatedApiKey, BanshoError> {
        let api_key = generate_api_key()?;
        let key_hash = hash_api_key_with_iterations(&api_key, self.iterations)?;
        let id = Uuid::new_v4();

        self.rows.write().await.push(StoredKey {
            id,
            key_hash,
            role: normalize_role(role),
            created_at: Utc::now(),
            revoked_at: None,
        });

        Ok(CreatedApiKey {
            api_key_id: id,
            api_key,
        })
    }

    async fn resolve(&self, presented_key: &str) -> Result<Option<ResolvedIdentity>, BanshoError> {
        let presented = presented_key.trim();
        if presented.is_empty() {
            return Ok(None);
        }

        let rows = self.rows.read().await;
        let mut resolved = None;
        for row in rows.iter().filter(|r| r.revoked_at.is_none()) {
            if verify_api_key(presented, &row.key_hash) {
                resolved = Some(ResolvedIdentity {
                    api_key_id: row.id.to_string(),
                    role: row.role.clone(),
                });
            }
        }
        Ok(resolved)
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, BanshoError> {
        let rows = self.rows.read().await;
        let mut records: Vec<(DateTime<Utc>, ApiKeyRecord)> = rows
            .iter()
            .map(|row| {
                (
                    row.created_at,
                    ApiKeyRecord {
                        api_key_id: row.id,
                        role: row.role.clone(),
                        revoked: row.revoked_at.is_some(),
                    },
                )
            })
            .collect();
        records.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    async fn revoke(&self, api_key_id: &str) -> Result<bool, BanshoError> {
        let Some(id) = parse_api_key_id(api_key_id) else {
            return Ok(false);
        };

        let mut rows = self.rows.write().await;
        match rows
            .iter_mut()
            .find(|row| row.id == id && row.revoked_at.is_none())
        {
            Some(row) => {
                row.revoked_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================
// PostgresCredentialStore
// ============================================================

/// Postgres-backed credential store for production use.
#[derive(Clone)]
pub struct PostgresCredentialStore {
    pool: PgPool,
}

impl PostgresCredentialStore {
    /// The caller is responsible for running [`run_migrations`] first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn create(&self, role: &str) -> Result<CreatedApiKey, BanshoError> {
        let api_key = generate_api_key()?;
        let key_hash = hash_api_key_with_iterations(&api_key, PBKDF2_ITERATIONS)?;
        let id = Uuid::new_v4();

        sqlx::query("INSERT INTO api_keys (id, key_hash, role) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(&key_hash)
            .bind(normalize_role(role))
            .execute(&self.pool)
            .await
            .map_err(|e| BanshoError::Database(format!("failed to insert api key: {e}")))?;

        Ok(CreatedApiKey {
            api_key_id: id,
            api_key,
        })
    }

    async fn resolve(&self, presented_key: &str) -> Result<Option<ResolvedIdentity>, BanshoError> {
        let presented = presented_key.trim();
        if presented.is_empty() {
            return Ok(None);
        }

        let rows = sqlx::query_as::<_, (Uuid, String, String)>(
            "SELECT id, key_hash, role FROM api_keys WHERE revoked_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BanshoError::Database(format!("failed to load api keys: {e}")))?;

        let mut resolved = None;
        for (id, key_hash, role) in rows {
            if verify_api_key(presented, &key_hash) {
                resolved = Some(ResolvedIdentity {
                    api_key_id: id.to_string(),
                    role,
                });
            }
        }
        Ok(resolved)
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, BanshoError> {
        let rows = sqlx::query_as::<_, (Uuid, String, bool)>(
            r#"
            SELECT id, role, (revoked_at IS NOT NULL) AS revoked
            FROM api_keys
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BanshoError::Database(format!("failed to list api keys: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(api_key_id, role, revoked)| ApiKeyRecord {
                api_key_id,
                role,
                revoked,
            })
            .collect())
    }

    async fn revoke(&self, api_key_id: &str) -> Result<bool, BanshoError> {
        let Some(id) = parse_api_key_id(api_key_id) else {
            return Ok(false);
        };

        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| BanshoError::Database(format!("failed to revoke api key: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================
// Tests
// ============================================================
