//! Reconciliation Engine
//!
//! Decides the write set for a batch of normalized records:
//!
//! - both modes upsert every incoming record by key, guarded by the
//!   modification timestamp (see `store::should_apply`)
//! - full mode additionally archives the complement: active stored listings
//!   the full fetch never reported
//!
//! Duplicate keys inside one batch are collapsed first so a page that
//! repeats a record cannot write an older copy after a newer one.

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use super::store::{should_apply, RecordStore};
use crate::error::{Error, Result};
use crate::models::{Agent, ArchiveReason, Keyed, Listing, SyncMode};

/// Outcome of applying one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome<T> {
    /// Records written (created or updated)
    pub upserted: u32,
    /// Records not written: older than stored, or superseded within the batch
    pub stale: u32,
    /// The records that were written, in batch order
    pub applied: Vec<T>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            upserted: 0,
            stale: 0,
            applied: Vec::new(),
        }
    }
}

/// Collapse duplicate keys, keeping the newest copy of each record
///
/// Ties (equal or both-absent timestamps) go to the later occurrence. The
/// result keeps the order in which keys first appeared; the second value is
/// the number of records dropped.
pub fn collapse_batch<T: Keyed>(records: Vec<T>) -> (Vec<T>, u32) {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut kept: Vec<T> = Vec::with_capacity(records.len());
    let mut dropped = 0;

    for record in records {
        match index.get(record.key()) {
            Some(&i) => {
                dropped += 1;
                if should_apply(record.modification_timestamp(), kept[i].modification_timestamp()) {
                    kept[i] = record;
                }
            }
            None => {
                index.insert(record.key().to_string(), kept.len());
                kept.push(record);
            }
        }
    }

    (kept, dropped)
}

/// Active stored keys a full fetch did not report, sorted
pub fn plan_archival(active: &HashSet<String>, seen: &HashSet<String>) -> Vec<String> {
    let mut missing: Vec<String> = active.difference(seen).cloned().collect();
    missing.sort();
    missing
}

/// Applies normalized batches to the record store
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: RecordStore,
}

impl ReconciliationEngine {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub async fn apply_listings(&self, batch: Vec<Listing>) -> Result<BatchOutcome<Listing>> {
        let (batch, superseded) = collapse_batch(batch);
        let mut outcome = BatchOutcome {
            stale: superseded,
            ..Default::default()
        };

        for listing in batch {
            if self.store.upsert_listing(&listing).await?.applied() {
                outcome.upserted += 1;
                outcome.applied.push(listing);
            } else {
                outcome.stale += 1;
            }
        }

        Ok(outcome)
    }

    pub async fn apply_agents(&self, batch: Vec<Agent>) -> Result<BatchOutcome<Agent>> {
        let (batch, superseded) = collapse_batch(batch);
        let mut outcome = BatchOutcome {
            stale: superseded,
            ..Default::default()
        };

        for agent in batch {
            if self.store.upsert_agent(&agent).await?.applied() {
                outcome.upserted += 1;
                outcome.applied.push(agent);
            } else {
                outcome.stale += 1;
            }
        }

        Ok(outcome)
    }

    /// Archive listings absent from a completed full fetch
    ///
    /// Incremental mode never archives. A full fetch that saw no listing at
    /// all is treated as a provider anomaly: nothing is archived and
    /// `Error::EmptyFullFetch` is returned.
    pub async fn archive_missing(
        &self,
        source: &str,
        mode: SyncMode,
        seen: &HashSet<String>,
    ) -> Result<u32> {
        if mode == SyncMode::Incremental {
            return Ok(0);
        }

        if seen.is_empty() {
            log::error!(
                "[sync:reconcile] Full fetch for '{}' returned no listings, refusing to archive",
                source
            );
            return Err(Error::EmptyFullFetch {
                source_name: source.to_string(),
            });
        }

        let active = self.store.active_listing_keys(source).await?;
        let missing = plan_archival(&active, seen);
        if missing.is_empty() {
            return Ok(0);
        }

        let archived = self
            .store
            .archive_listings(source, &missing, ArchiveReason::MissingUpstream, Utc::now())
            .await?;

        log::info!(
            "[sync:reconcile] Archived {} listing(s) of '{}' missing from full fetch",
            archived,
            source
        );
        Ok(archived as u32)
    }
}
