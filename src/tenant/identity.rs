use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{IdentityBackend, TenantConfig};
use crate::postgres::PostgresPool;

#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Identity backend misconfigured: {0}")]
    Config(String),
}

/// Answers whether a user belongs to a tenant.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn user_exists(&self, tenant_id: &str, user_id: &str) -> Result<bool, IdentityError>;
}

/// Static membership table
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    members: HashMap<String, HashSet<String>>,
}

impl MemoryIdentityStore {
    pub fn new(members: &HashMap<String, Vec<String>>) -> Self {
        Self {
            members: members
                .iter()
                .map(|(tenant, users)| (tenant.clone(), users.iter().cloned().collect()))
                .collect(),
        }
    }

    pub fn with_member(mut self, tenant_id: &str, user_id: &str) -> Self {
        self.members
            .entry(tenant_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        self
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn user_exists(&self, tenant_id: &str, user_id: &str) -> Result<bool, IdentityError> {
        Ok(self
            .members
            .get(tenant_id)
            .is_some_and(|users| users.contains(user_id)))
    }
}

/// Looks the user up in the tenant's own schema: `"{prefix}{tenant}"."{table}"`.
pub struct PostgresIdentityStore {
    pool: PostgresPool,
    schema_prefix: String,
    users_table: String,
}

impl PostgresIdentityStore {
    pub fn new(
        pool: PostgresPool,
        schema_prefix: &str,
        users_table: &str,
    ) -> Result<Self, IdentityError> {
        if !schema_prefix.is_empty() && !is_safe_identifier(schema_prefix) {
            return Err(IdentityError::InvalidIdentifier(schema_prefix.to_string()));
        }
        if !is_safe_identifier(users_table) {
            return Err(IdentityError::InvalidIdentifier(users_table.to_string()));
        }

        Ok(Self {
            pool,
            schema_prefix: schema_prefix.to_string(),
            users_table: users_table.to_string(),
        })
    }

    pub fn schema_for(&self, tenant_id: &str) -> Result<String, IdentityError> {
        let schema = format!("{}{}", self.schema_prefix, tenant_id.replace('-', "_"));
        if !is_safe_identifier(&schema) {
            return Err(IdentityError::InvalidIdentifier(schema));
        }
        Ok(schema)
    }

    fn exists_query(&self, schema: &str) -> String {
        format!(
            r#"SELECT EXISTS(SELECT 1 FROM "{}"."{}" WHERE id::text = $1)"#,
            schema, self.users_table
        )
    }
}

#[async_trait]
impl IdentityStore for PostgresIdentityStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn user_exists(&self, tenant_id: &str, user_id: &str) -> Result<bool, IdentityError> {
        let sql = self.exists_query(&self.schema_for(tenant_id)?);
        let user_id = user_id.to_string();

        self.pool
            .execute(move |pg| async move {
                sqlx::query_scalar::<_, bool>(&sql)
                    .bind(user_id)
                    .fetch_one(&pg)
                    .await
            })
            .await
            .map_err(|e| IdentityError::Database(e.to_string()))
    }
}

fn is_safe_identifier(ident: &str) -> bool {
    !ident.is_empty()
        && ident.len() <= 63
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn create_identity_store(
    config: &TenantConfig,
    pg_pool: Option<PostgresPool>,
) -> Result<Arc<dyn IdentityStore>, IdentityError> {
    match config.identity_backend {
        IdentityBackend::Memory => {
            tracing::info!(tenants = config.members.len(), "Using static identity store");
            Ok(Arc::new(MemoryIdentityStore::new(&config.members)))
        }
        IdentityBackend::Postgres => {
            let pool = pg_pool.ok_or_else(|| {
                IdentityError::Config("postgres identity backend requires a database".into())
            })?;
            tracing::info!(
                schema_prefix = %config.schema_prefix,
                users_table = %config.users_table,
                "Using PostgreSQL identity store"
            );
            Ok(Arc::new(PostgresIdentityStore::new(
                pool,
                &config.schema_prefix,
                &config.users_table,
            )?))
        }
    }
}
