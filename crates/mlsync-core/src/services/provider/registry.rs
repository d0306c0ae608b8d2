//! Provider Registry
//!
//! Maps configured source names to provider implementations. Sources are
//! persisted in `sync_sources`; the registry is built from them at startup
//! and handed to the orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;

use super::{ProviderClient, ResoClient};
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::models::SourceConfig;
use crate::utils::format_timestamp;

/// Provider kinds `build_provider` knows how to construct
pub const SUPPORTED_KINDS: &[&str] = &["reso"];

/// Source name → provider client
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own source name, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn ProviderClient>) {
        let name = provider.source_name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            log::warn!("[sync:provider] Replaced provider for source '{}'", name);
        }
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn ProviderClient>> {
        self.providers.get(source).cloned()
    }

    /// Registered source names, sorted
    pub fn sources(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build a registry from every enabled source in the database
    ///
    /// Sources with an unknown kind are logged and left out rather than
    /// failing the whole registry.
    pub async fn from_db(pool: &SqlitePool, settings: &SyncSettings) -> Result<Self> {
        let mut registry = Self::new();

        for source in list_sources(pool).await? {
            if !source.enabled {
                log::debug!("[sync:provider] Source '{}' is disabled, skipping", source.name);
                continue;
            }
            match build_provider(&source, settings) {
                Ok(provider) => registry.register(provider),
                Err(e) => log::error!(
                    "[sync:provider] Cannot build provider for '{}': {}",
                    source.name,
                    e
                ),
            }
        }

        log::info!("[sync:provider] Registered {} source(s)", registry.len());
        Ok(registry)
    }
}

/// Construct the provider client for a configured source
pub fn build_provider(
    source: &SourceConfig,
    settings: &SyncSettings,
) -> Result<Arc<dyn ProviderClient>> {
    match source.kind.as_str() {
        "reso" => Ok(Arc::new(ResoClient::new(
            source.name.clone(),
            source.base_url.clone(),
            source.access_token.clone(),
            settings.request_timeout(),
        )?)),
        other => Err(Error::config(format!(
            "Unknown provider kind '{}' for source '{}' (supported: {})",
            other,
            source.name,
            SUPPORTED_KINDS.join(", ")
        ))),
    }
}

// ============================================================================
// Source configuration store
// ============================================================================

/// List all configured sources
pub async fn list_sources(pool: &SqlitePool) -> Result<Vec<SourceConfig>> {
    let sources: Vec<SourceConfig> = sqlx::query_as(
        "SELECT name, kind, base_url, access_token, enabled, created_at FROM sync_sources ORDER BY name",
    )
    .fetch_all(pool)
    .await?;
    Ok(sources)
}

pub async fn get_source(pool: &SqlitePool, name: &str) -> Result<Option<SourceConfig>> {
    let source: Option<SourceConfig> = sqlx::query_as(
        "SELECT name, kind, base_url, access_token, enabled, created_at FROM sync_sources WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(source)
}

/// Add or update a source
pub async fn upsert_source(
    pool: &SqlitePool,
    name: &str,
    kind: &str,
    base_url: &str,
    access_token: Option<&str>,
) -> Result<SourceConfig> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("Source name cannot be empty"));
    }
    if !SUPPORTED_KINDS.contains(&kind) {
        return Err(Error::validation(format!(
            "Unsupported provider kind '{}' (supported: {})",
            kind,
            SUPPORTED_KINDS.join(", ")
        )));
    }
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(Error::validation(format!(
            "Base URL must start with http:// or https://: {}",
            base_url
        )));
    }

    let now = format_timestamp(&Utc::now());
    sqlx::query(
        r#"
        INSERT INTO sync_sources (name, kind, base_url, access_token, enabled, created_at)
        VALUES (?, ?, ?, ?, 1, ?)
        ON CONFLICT(name) DO UPDATE SET
            kind = excluded.kind,
            base_url = excluded.base_url,
            access_token = excluded.access_token
        "#,
    )
    .bind(name)
    .bind(kind)
    .bind(base_url)
    .bind(access_token)
    .bind(&now)
    .execute(pool)
    .await?;

    log::info!("[sync:provider] Saved source '{}' ({})", name, kind);

    get_source(pool, name)
        .await?
        .ok_or_else(|| Error::internal(format!("Source '{}' vanished after save", name)))
}

/// Remove a source; returns whether it existed
pub async fn remove_source(pool: &SqlitePool, name: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sync_sources WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_source_enabled(pool: &SqlitePool, name: &str, enabled: bool) -> Result<()> {
    let result = sqlx::query("UPDATE sync_sources SET enabled = ? WHERE name = ?")
        .bind(enabled)
        .bind(name)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("Source '{}'", name)));
    }
    Ok(())
}
