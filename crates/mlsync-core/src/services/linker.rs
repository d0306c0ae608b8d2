//! Agent-Listing Linker
//!
//! After a listing is written, makes sure its listing agent exists locally,
//! fetching the single agent from the provider when it does not. Failure to
//! resolve never blocks the listing: it stays stored with a dangling
//! `list_agent_key` and the run counts an unresolved link.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::normalizer::normalize_agent;
use super::provider::{ProviderClient, ProviderError};
use super::store::RecordStore;
use crate::error::Result;
use crate::models::{LinkRepairReport, Listing, RecordKind};

/// Result of linking one listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The listing has no agent key
    NoAgent,
    /// The agent is already stored
    AlreadyLinked,
    /// The agent was fetched from the provider and stored
    Resolved,
    /// The agent could not be resolved; carries the reason
    Unresolved(String),
}

/// Resolves listing agents for one source
///
/// Remembers agent keys that failed to resolve, so a run with many listings
/// for the same missing agent asks the provider once.
pub struct AgentLinker {
    provider: Arc<dyn ProviderClient>,
    store: RecordStore,
    request_timeout: Duration,
    failed: HashMap<String, String>,
}

impl AgentLinker {
    pub fn new(provider: Arc<dyn ProviderClient>, store: RecordStore, request_timeout: Duration) -> Self {
        Self {
            provider,
            store,
            request_timeout,
            failed: HashMap::new(),
        }
    }

    /// Ensure the listing's agent exists locally
    ///
    /// Only store errors are returned as `Err`; every provider-side failure
    /// becomes `LinkOutcome::Unresolved`.
    pub async fn link(&mut self, listing: &Listing) -> Result<LinkOutcome> {
        let agent_key = match listing.list_agent_key.as_deref() {
            Some(key) => key,
            None => return Ok(LinkOutcome::NoAgent),
        };

        if self.store.agent_exists(agent_key).await? {
            return Ok(LinkOutcome::AlreadyLinked);
        }

        if let Some(reason) = self.failed.get(agent_key) {
            return Ok(LinkOutcome::Unresolved(reason.clone()));
        }

        let outcome = self.resolve(agent_key).await?;
        match &outcome {
            LinkOutcome::Resolved => log::debug!(
                "[sync:linker] Resolved agent '{}' for listing '{}'",
                agent_key,
                listing.listing_key
            ),
            LinkOutcome::Unresolved(reason) => {
                log::warn!(
                    "[sync:linker] Listing '{}' keeps dangling agent '{}': {}",
                    listing.listing_key,
                    agent_key,
                    reason
                );
                self.failed.insert(agent_key.to_string(), reason.clone());
            }
            _ => {}
        }
        Ok(outcome)
    }

    async fn resolve(&self, agent_key: &str) -> Result<LinkOutcome> {
        let source = self.provider.source_name().to_string();

        let fetched = tokio::time::timeout(
            self.request_timeout,
            self.provider.fetch_one(RecordKind::Agent, agent_key),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderError::Transport("Request timed out".to_string())));

        let raw = match fetched {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(LinkOutcome::Unresolved("agent not found upstream".to_string())),
            Err(e) => return Ok(LinkOutcome::Unresolved(e.to_string())),
        };

        let agent = match normalize_agent(&source, &raw) {
            Ok(agent) => agent,
            Err(e) => return Ok(LinkOutcome::Unresolved(e.to_string())),
        };

        if agent.member_key != agent_key {
            return Ok(LinkOutcome::Unresolved(format!(
                "provider returned agent '{}' for key '{}'",
                agent.member_key, agent_key
            )));
        }

        self.store.upsert_looked_up_agent(&agent).await?;
        Ok(LinkOutcome::Resolved)
    }

    /// Retry resolution for every active listing of this source with a dangling agent key
    pub async fn repair_links(&mut self) -> Result<LinkRepairReport> {
        let source = self.provider.source_name().to_string();
        let dangling = self.store.dangling_agent_links(&source).await?;
        let mut report = LinkRepairReport::default();

        for link in dangling {
            report.checked += 1;

            let outcome = match self.store.get_listing(&link.listing_key).await? {
                Some(listing) => self.link(&listing).await?,
                None => continue,
            };

            match outcome {
                LinkOutcome::Resolved | LinkOutcome::AlreadyLinked => report.resolved += 1,
                LinkOutcome::Unresolved(_) => report.unresolved += 1,
                LinkOutcome::NoAgent => {}
            }
        }

        log::info!(
            "[sync:linker] Repaired links for '{}': {} checked, {} resolved, {} unresolved",
            source,
            report.checked,
            report.resolved,
            report.unresolved
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::services::provider::{Page, RawRecord};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves single agents from a fixed map and counts lookups
    struct AgentDirectory {
        agents: HashMap<String, RawRecord>,
        lookups: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ProviderClient for AgentDirectory {
        fn source_name(&self) -> &str {
            "mred"
        }

        async fn fetch_changes(
            &self,
            _kind: RecordKind,
            _watermark: Option<DateTime<Utc>>,
            _page_size: u32,
            _cursor: Option<&str>,
        ) -> std::result::Result<Page, ProviderError> {
            Ok(Page::default())
        }

        async fn fetch_one(
            &self,
            _kind: RecordKind,
            key: &str,
        ) -> std::result::Result<Option<RawRecord>, ProviderError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Transport("connection reset".to_string()));
            }
            Ok(self.agents.get(key).cloned())
        }
    }

    fn directory(keys: &[&str], fail: bool) -> Arc<AgentDirectory> {
        let agents = keys
            .iter()
            .map(|k| {
                let raw = json!({"MemberKey": k, "MemberFullName": "Agent"});
                (k.to_string(), raw.as_object().cloned().unwrap())
            })
            .collect();
        Arc::new(AgentDirectory {
            agents,
            lookups: AtomicUsize::new(0),
            fail,
        })
    }

    fn listing(key: &str, agent: Option<&str>) -> Listing {
        Listing {
            listing_key: key.to_string(),
            source: "mred".to_string(),
            list_price: None,
            street_number: None,
            street_name: None,
            unit_number: None,
            unparsed_address: None,
            city: None,
            state_or_province: None,
            postal_code: None,
            standard_status: None,
            list_agent_key: agent.map(str::to_string),
            modification_timestamp: None,
            is_archived: false,
            archived_at: None,
            archive_reason: None,
            raw_fields: json!({}),
        }
    }

    async fn store() -> (RecordStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("linker.db")).await.unwrap();
        (RecordStore::new(db.pool), dir)
    }

    #[tokio::test]
    async fn test_link_resolves_missing_agent() {
        let (store, _dir) = store().await;
        let provider = directory(&["A1"], false);
        let mut linker = AgentLinker::new(provider.clone(), store.clone(), Duration::from_secs(5));

        assert_eq!(linker.link(&listing("L0", None)).await.unwrap(), LinkOutcome::NoAgent);
        assert_eq!(linker.link(&listing("L1", Some("A1"))).await.unwrap(), LinkOutcome::Resolved);
        assert_eq!(
            linker.link(&listing("L2", Some("A1"))).await.unwrap(),
            LinkOutcome::AlreadyLinked
        );
        assert!(store.agent_exists("A1").await.unwrap());
        assert_eq!(provider.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_keys_are_not_refetched() {
        let (store, _dir) = store().await;
        let provider = directory(&[], true);
        let mut linker = AgentLinker::new(provider.clone(), store, Duration::from_secs(5));

        for key in ["L1", "L2", "L3"] {
            let outcome = linker.link(&listing(key, Some("A404"))).await.unwrap();
            assert!(matches!(outcome, LinkOutcome::Unresolved(_)));
        }
        assert_eq!(provider.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_unresolved() {
        let (store, _dir) = store().await;
        let mut linker = AgentLinker::new(directory(&[], false), store.clone(), Duration::from_secs(5));

        let outcome = linker.link(&listing("L1", Some("A404"))).await.unwrap();
        assert_eq!(
            outcome,
            LinkOutcome::Unresolved("agent not found upstream".to_string())
        );
        assert!(!store.agent_exists("A404").await.unwrap());
    }

    #[tokio::test]
    async fn test_repair_links() {
        let (store, _dir) = store().await;
        store.upsert_listing(&listing("L1", Some("A1"))).await.unwrap();
        store.upsert_listing(&listing("L2", Some("A2"))).await.unwrap();
        store.upsert_listing(&listing("L3", None)).await.unwrap();

        let mut linker = AgentLinker::new(directory(&["A1"], false), store.clone(), Duration::from_secs(5));
        let report = linker.repair_links().await.unwrap();

        assert_eq!(
            report,
            LinkRepairReport {
                checked: 2,
                resolved: 1,
                unresolved: 1
            }
        );
        assert_eq!(store.dangling_agent_links("mred").await.unwrap().len(), 1);
    }
}
