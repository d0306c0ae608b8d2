//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mlsync_core::db::Database;
use mlsync_core::services::{Page, ProviderClient, ProviderError, ProviderRegistry, RawRecord};
use mlsync_core::{RecordKind, SyncOrchestrator, SyncSettings};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Create a database in a fresh temp dir
pub async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(temp_dir.path().join("test.db"))
        .await
        .expect("Failed to create test database");
    (db, temp_dir)
}

/// Small pages and near-zero backoff keep tests fast and exercise pagination
pub fn test_settings() -> SyncSettings {
    SyncSettings {
        page_size: 2,
        max_page_attempts: 3,
        retry_backoff_ms: 1,
        request_timeout_secs: 5,
        ..Default::default()
    }
}

pub fn orchestrator(db: &Database, providers: &[Arc<ScriptedProvider>]) -> SyncOrchestrator {
    orchestrator_with(db, providers, test_settings())
}

pub fn orchestrator_with(
    db: &Database,
    providers: &[Arc<ScriptedProvider>],
    settings: SyncSettings,
) -> SyncOrchestrator {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider.clone());
    }
    SyncOrchestrator::new(db.pool.clone(), registry, settings)
}

/// 2024-03-01 at the given time, UTC
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}

pub fn stamp(hour: u32, minute: u32) -> String {
    at(hour, minute).to_rfc3339()
}

fn object(value: Value) -> RawRecord {
    value.as_object().cloned().expect("fixture must be a JSON object")
}

pub fn raw_listing(key: &str, price: u64, modified: &str, agent: Option<&str>) -> RawRecord {
    let mut record = object(json!({
        "ListingKey": key,
        "ListPrice": price,
        "StreetNumber": "100",
        "StreetName": "Lake Shore Dr",
        "City": "Chicago",
        "StateOrProvince": "IL",
        "PostalCode": "60611",
        "StandardStatus": "Active",
        "ModificationTimestamp": modified
    }));
    if let Some(agent) = agent {
        record.insert("ListAgentKey".to_string(), json!(agent));
    }
    record
}

pub fn raw_agent(key: &str, modified: &str) -> RawRecord {
    object(json!({
        "MemberKey": key,
        "MemberFirstName": "Dana",
        "MemberLastName": "Ruiz",
        "MemberEmail": format!("{}@example.com", key.to_lowercase()),
        "OfficeName": "North Shore Realty",
        "ModificationTimestamp": modified
    }))
}

/// In-memory provider feed
///
/// Serves its dataset in pages of the requested size, honouring the
/// watermark the way a real feed would. Errors queued with `fail_next` are
/// returned by the next `fetch_changes` calls, one per call.
pub struct ScriptedProvider {
    name: String,
    listings: Mutex<Vec<RawRecord>>,
    agents: Mutex<Vec<RawRecord>>,
    directory: Mutex<HashMap<String, RawRecord>>,
    failures: Mutex<VecDeque<ProviderError>>,
    watermarks: Mutex<Vec<(RecordKind, Option<DateTime<Utc>>)>>,
    delay: Mutex<Option<Duration>>,
    pub fetch_calls: AtomicUsize,
    pub lookups: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            listings: Mutex::new(Vec::new()),
            agents: Mutex::new(Vec::new()),
            directory: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            watermarks: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            fetch_calls: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn set_listings(&self, records: Vec<RawRecord>) {
        *self.listings.lock().unwrap() = records;
    }

    pub fn set_agents(&self, records: Vec<RawRecord>) {
        *self.agents.lock().unwrap() = records;
    }

    /// Make an agent available to single-record lookups only
    pub fn add_to_directory(&self, record: RawRecord) {
        let key = record["MemberKey"].as_str().unwrap_or_default().to_string();
        self.directory.lock().unwrap().insert(key, record);
    }

    pub fn fail_next(&self, error: ProviderError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Watermarks seen by the first page request of each fetch
    pub fn watermarks(&self, kind: RecordKind) -> Vec<Option<DateTime<Utc>>> {
        self.watermarks
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, w)| *w)
            .collect()
    }

    fn dataset(&self, kind: RecordKind) -> Vec<RawRecord> {
        match kind {
            RecordKind::Listing => self.listings.lock().unwrap().clone(),
            RecordKind::Agent => self.agents.lock().unwrap().clone(),
        }
    }
}

fn modified(record: &RawRecord) -> Option<DateTime<Utc>> {
    record
        .get("ModificationTimestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch_changes(
        &self,
        kind: RecordKind,
        watermark: Option<DateTime<Utc>>,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<Page, ProviderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        if cursor.is_none() {
            self.watermarks.lock().unwrap().push((kind, watermark));
        }

        let matching: Vec<RawRecord> = self
            .dataset(kind)
            .into_iter()
            .filter(|r| match (watermark, modified(r)) {
                (Some(w), Some(m)) => m >= w,
                _ => true,
            })
            .collect();

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (offset + page_size as usize).min(matching.len());
        let records = matching[offset.min(end)..end].to_vec();
        let next_cursor = (end < matching.len()).then(|| end.to_string());

        Ok(Page::new(records, next_cursor))
    }

    async fn fetch_one(
        &self,
        kind: RecordKind,
        key: &str,
    ) -> Result<Option<RawRecord>, ProviderError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if kind != RecordKind::Agent {
            return Ok(None);
        }
        Ok(self.directory.lock().unwrap().get(key).cloned())
    }
}
