//! End-to-end tests for the sync orchestrator against a real SQLite file

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use mlsync_core::services::ProviderError;
use mlsync_core::{
    ArchiveReason, Error, HistoryFilter, RecordKind, SyncMode, SyncRunStatus, SyncSettings,
};

#[tokio::test]
async fn test_incremental_end_to_end() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("L1", 300_000, &stamp(10, 0), Some("A1")),
        raw_listing("L2", 450_000, &stamp(10, 5), Some("A1")),
        raw_listing("L3", 510_000, &stamp(10, 7), None),
    ]);
    provider.set_agents(vec![raw_agent("A1", &stamp(9, 0))]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(result.success, "sync failed: {:?}", result.error);
    assert_eq!(result.counts.listings.processed, 3);
    assert_eq!(result.counts.listings.upserted, 3);
    assert_eq!(result.counts.agents.processed, 1);
    assert_eq!(result.counts.agents.upserted, 1);
    assert_eq!(result.counts.unresolved_links, 0);
    assert_eq!(result.counts.agents_resolved, 0);
    assert!(result.duration_ms.is_some());

    let history = orchestrator
        .history("mred", 1, 10, &HistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(history.total, 1);
    assert_eq!(history.items.len(), 1);
    assert_eq!(history.items[0].status, SyncRunStatus::Success);
    assert_eq!(history.items[0].counts.listings.upserted, 3);
    assert_eq!(Some(history.items[0].id.clone()), result.run_id);

    // Agent already delivered by the feed; no single lookups needed
    assert_eq!(provider.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_incremental_replay_is_idempotent() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("L1", 300_000, &stamp(10, 0), None),
        raw_listing("L2", 450_000, &stamp(10, 5), None),
        // Duplicate inside the feed with an older timestamp
        raw_listing("L1", 100_000, &stamp(9, 0), None),
    ]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let store = orchestrator.store();

    assert!(orchestrator.sync_source("mred", SyncMode::Incremental).await.success);
    let first = (
        store.get_listing("L1").await.unwrap(),
        store.get_listing("L2").await.unwrap(),
    );

    assert!(orchestrator.sync_source("mred", SyncMode::Incremental).await.success);
    let second = (
        store.get_listing("L1").await.unwrap(),
        store.get_listing("L2").await.unwrap(),
    );

    assert_eq!(first, second);
    assert_eq!(first.0.unwrap().list_price, Some(300_000.0));
    assert_eq!(store.count_listings("mred", false).await.unwrap(), 2);
}

#[tokio::test]
async fn test_incremental_uses_stored_watermark() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("L1", 1, &stamp(10, 0), None),
        raw_listing("L2", 1, &stamp(10, 5), None),
    ]);
    provider.set_agents(vec![raw_agent("A1", &stamp(8, 30))]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    orchestrator.sync_source("mred", SyncMode::Incremental).await;
    orchestrator.sync_source("mred", SyncMode::Incremental).await;
    orchestrator.sync_source("mred", SyncMode::Full).await;

    assert_eq!(
        provider.watermarks(RecordKind::Listing),
        vec![None, Some(at(10, 5)), None]
    );
    assert_eq!(
        provider.watermarks(RecordKind::Agent),
        vec![None, Some(at(8, 30)), None]
    );
}

#[tokio::test]
async fn test_agent_resolved_by_lookup_does_not_hide_feed_agents() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_agents(vec![raw_agent("A1", &stamp(9, 0))]);
    provider.set_listings(vec![raw_listing("L1", 100, &stamp(10, 0), Some("A7"))]);
    provider.add_to_directory(raw_agent("A7", &stamp(12, 0)));

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let first = orchestrator.sync_source("mred", SyncMode::Incremental).await;
    assert!(first.success);
    assert_eq!(first.counts.agents_resolved, 1);

    // A5 changed upstream after A1 but before the looked-up A7
    provider.set_agents(vec![
        raw_agent("A1", &stamp(9, 0)),
        raw_agent("A5", &stamp(11, 0)),
    ]);
    let second = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(second.success);
    assert_eq!(
        provider.watermarks(RecordKind::Agent),
        vec![None, Some(at(9, 0))]
    );
    assert_eq!(second.counts.agents.processed, 2);
    assert!(orchestrator.store().get_agent("A5").await.unwrap().is_some());
}

#[tokio::test]
async fn test_full_sync_over_page_cap_fails_without_archiving() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("A", 100, &stamp(10, 0), None),
        raw_listing("B", 200, &stamp(10, 0), None),
        raw_listing("C", 300, &stamp(10, 0), None),
    ]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    assert!(orchestrator.sync_source("mred", SyncMode::Full).await.success);

    let capped = SyncSettings {
        page_size: 1,
        max_pages: 1,
        ..test_settings()
    };
    let orchestrator = orchestrator_with(&db, &[provider.clone()], capped);
    provider.set_listings(vec![
        raw_listing("A", 100, &stamp(11, 0), None),
        raw_listing("B", 200, &stamp(11, 0), None),
    ]);
    let result = orchestrator.sync_source("mred", SyncMode::Full).await;

    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("internal"));
    assert_eq!(result.counts.archived, 0);

    let store = orchestrator.store();
    assert_eq!(store.count_listings("mred", false).await.unwrap(), 3);
    assert_eq!(store.count_listings("mred", true).await.unwrap(), 0);
    assert!(!store.get_listing("C").await.unwrap().unwrap().is_archived);

    let latest = orchestrator.status("mred").await.unwrap().latest_run.unwrap();
    assert_eq!(latest.status, SyncRunStatus::Failed);
    assert_eq!(latest.error_kind.as_deref(), Some("internal"));
}

#[tokio::test]
async fn test_older_record_never_overwrites_newer() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![raw_listing("L1", 300_000, &stamp(10, 5), None)]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    assert!(orchestrator.sync_source("mred", SyncMode::Incremental).await.success);

    // Out-of-order delivery of an older version
    let mut older = raw_listing("L1", 1, &stamp(9, 0), None);
    older.insert("City".to_string(), serde_json::json!("Nowhere"));
    provider.set_listings(vec![older]);

    let result = orchestrator.sync_source("mred", SyncMode::Full).await;
    assert!(result.success);
    assert_eq!(result.counts.listings.processed, 1);
    assert_eq!(result.counts.listings.upserted, 0);
    assert_eq!(result.counts.listings.stale, 1);

    let stored = orchestrator.store().get_listing("L1").await.unwrap().unwrap();
    assert_eq!(stored.list_price, Some(300_000.0));
    assert_eq!(stored.city.as_deref(), Some("Chicago"));
    assert_eq!(stored.modification_timestamp, Some(at(10, 5)));
}

#[tokio::test]
async fn test_full_sync_archives_missing_listings() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("A", 100, &stamp(10, 0), None),
        raw_listing("B", 200, &stamp(10, 0), None),
        raw_listing("C", 300, &stamp(10, 0), None),
    ]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    assert!(orchestrator.sync_source("mred", SyncMode::Full).await.success);

    provider.set_listings(vec![
        raw_listing("A", 150, &stamp(11, 0), None),
        raw_listing("C", 300, &stamp(10, 0), None),
    ]);
    let result = orchestrator.sync_source("mred", SyncMode::Full).await;

    assert!(result.success, "sync failed: {:?}", result.error);
    assert_eq!(result.counts.archived, 1);

    let store = orchestrator.store();
    let a = store.get_listing("A").await.unwrap().unwrap();
    let b = store.get_listing("B").await.unwrap().unwrap();
    let c = store.get_listing("C").await.unwrap().unwrap();

    assert!(!a.is_archived);
    assert_eq!(a.list_price, Some(150.0));
    assert!(b.is_archived);
    assert_eq!(b.archive_reason, Some(ArchiveReason::MissingUpstream));
    assert!(!c.is_archived);

    // Reappearing upstream revives it
    provider.set_listings(vec![
        raw_listing("A", 150, &stamp(11, 0), None),
        raw_listing("B", 200, &stamp(10, 0), None),
        raw_listing("C", 300, &stamp(10, 0), None),
    ]);
    assert!(orchestrator.sync_source("mred", SyncMode::Full).await.success);
    assert!(!store.get_listing("B").await.unwrap().unwrap().is_archived);
}

#[tokio::test]
async fn test_empty_full_fetch_aborts_without_archiving() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("A", 100, &stamp(10, 0), None),
        raw_listing("B", 200, &stamp(10, 0), None),
    ]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    assert!(orchestrator.sync_source("mred", SyncMode::Full).await.success);

    provider.set_listings(vec![]);
    let result = orchestrator.sync_source("mred", SyncMode::Full).await;

    assert!(!result.success);
    assert!(!result.skipped);
    assert_eq!(result.error_kind.as_deref(), Some("empty_full_fetch"));
    assert_eq!(result.counts.archived, 0);
    assert_eq!(orchestrator.store().count_listings("mred", false).await.unwrap(), 2);

    let status = orchestrator.status("mred").await.unwrap();
    let latest = status.latest_run.unwrap();
    assert_eq!(latest.status, SyncRunStatus::Failed);
    assert_eq!(latest.error_kind.as_deref(), Some("empty_full_fetch"));
    assert!(!status.in_progress);
}

#[tokio::test]
async fn test_empty_incremental_fetch_is_a_no_op() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![raw_listing("A", 100, &stamp(10, 0), None)]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    assert!(orchestrator.sync_source("mred", SyncMode::Incremental).await.success);

    provider.set_listings(vec![]);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(result.success);
    assert_eq!(result.counts.listings.processed, 0);
    assert_eq!(result.counts.archived, 0);
    assert_eq!(orchestrator.store().count_listings("mred", false).await.unwrap(), 1);
}

#[tokio::test]
async fn test_second_begin_is_rejected_and_sync_is_skipped() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![raw_listing("A", 100, &stamp(10, 0), None)]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let history = orchestrator.history_recorder();

    let held = history.begin("mred", SyncMode::Full).await.unwrap();
    assert!(matches!(
        history.begin("mred", SyncMode::Incremental).await,
        Err(Error::ConcurrentRun { .. })
    ));

    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;
    assert!(result.skipped);
    assert!(!result.success);
    assert!(result.is_ok());
    assert_eq!(result.error_kind.as_deref(), Some("concurrent_run"));
    assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 0);

    // The held run is untouched
    let stored = history.get(&held.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SyncRunStatus::InProgress);
    assert_eq!(stored.mode, SyncMode::Full);

    // A skip does not fail sync_all
    let all = orchestrator.sync_all(SyncMode::Incremental).await;
    assert!(all.success);
    assert!(all.results[0].skipped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_syncs_of_one_source() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![raw_listing("A", 100, &stamp(10, 0), None)]);
    provider.set_delay(Duration::from_millis(200));

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let (first, second) = tokio::join!(
        orchestrator.sync_source("mred", SyncMode::Full),
        orchestrator.sync_source("mred", SyncMode::Full),
    );

    let skipped = [&first, &second].iter().filter(|r| r.skipped).count();
    let succeeded = [&first, &second].iter().filter(|r| r.success).count();
    assert_eq!(skipped, 1);
    assert_eq!(succeeded, 1);

    let history = orchestrator
        .history("mred", 1, 10, &HistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(history.total, 1);
}

#[tokio::test]
async fn test_unresolvable_agent_leaves_dangling_link() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("L1", 100, &stamp(10, 0), Some("A404")),
        raw_listing("L2", 200, &stamp(10, 1), None),
    ]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(result.success);
    assert_eq!(result.counts.listings.upserted, 2);
    assert_eq!(result.counts.unresolved_links, 1);

    let store = orchestrator.store();
    let l1 = store.get_listing("L1").await.unwrap().unwrap();
    assert_eq!(l1.list_agent_key.as_deref(), Some("A404"));
    assert!(store.get_agent("A404").await.unwrap().is_none());
    assert_eq!(store.dangling_agent_links("mred").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_agent_is_resolved_on_demand() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("L1", 100, &stamp(10, 0), Some("A7")),
        raw_listing("L2", 200, &stamp(10, 1), Some("A7")),
    ]);
    provider.add_to_directory(raw_agent("A7", &stamp(8, 0)));

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(result.success);
    assert_eq!(result.counts.agents_resolved, 1);
    assert_eq!(result.counts.unresolved_links, 0);
    assert_eq!(provider.lookups.load(Ordering::SeqCst), 1);
    assert!(orchestrator.store().get_agent("A7").await.unwrap().is_some());
}

#[tokio::test]
async fn test_repair_links_after_agent_appears() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![raw_listing("L1", 100, &stamp(10, 0), Some("A9"))]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;
    assert_eq!(result.counts.unresolved_links, 1);

    provider.add_to_directory(raw_agent("A9", &stamp(8, 0)));
    let report = orchestrator.repair_links("mred").await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.resolved, 1);
    assert!(orchestrator.store().dangling_agent_links("mred").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_records_are_skipped_and_counted() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    let mut keyless = raw_listing("X", 1, &stamp(10, 0), None);
    keyless.remove("ListingKey");
    provider.set_listings(vec![
        raw_listing("L1", 100, &stamp(10, 0), None),
        keyless,
        raw_listing("L2", 200, &stamp(10, 1), None),
    ]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let result = orchestrator.sync_source("mred", SyncMode::Full).await;

    assert!(result.success);
    assert_eq!(result.counts.listings.processed, 3);
    assert_eq!(result.counts.listings.malformed, 1);
    assert_eq!(result.counts.listings.upserted, 2);
}

#[tokio::test]
async fn test_auth_error_fails_immediately() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.fail_next(ProviderError::Auth("token rejected".to_string()));

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("auth"));
    assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 1);

    let latest = orchestrator.status("mred").await.unwrap().latest_run.unwrap();
    assert_eq!(latest.status, SyncRunStatus::Failed);
}

#[tokio::test]
async fn test_transport_errors_are_retried() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![raw_listing("L1", 100, &stamp(10, 0), None)]);
    provider.fail_next(ProviderError::Transport("connection reset".to_string()));
    provider.fail_next(ProviderError::Api {
        status: 503,
        message: "unavailable".to_string(),
    });

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(result.success, "sync failed: {:?}", result.error);
    assert_eq!(result.counts.listings.upserted, 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    for _ in 0..3 {
        provider.fail_next(ProviderError::Transport("connection reset".to_string()));
    }

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("transport"));
    assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_page_timeout_counts_as_transport_failure() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_delay(Duration::from_millis(1500));

    let settings = SyncSettings {
        max_page_attempts: 1,
        request_timeout_secs: 1,
        ..test_settings()
    };
    let orchestrator = orchestrator_with(&db, &[provider.clone()], settings);
    let result = orchestrator.sync_source("mred", SyncMode::Incremental).await;

    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("transport"));
}

#[tokio::test]
async fn test_sync_all_isolates_failures() {
    let (db, _temp_dir) = create_test_db().await;
    let good = ScriptedProvider::new("crmls");
    good.set_listings(vec![raw_listing("C1", 100, &stamp(10, 0), None)]);
    let bad = ScriptedProvider::new("mred");
    bad.fail_next(ProviderError::Auth("token rejected".to_string()));

    let orchestrator = orchestrator(&db, &[good.clone(), bad.clone()]);
    let all = orchestrator.sync_all(SyncMode::Incremental).await;

    assert!(!all.success);
    assert_eq!(all.results.len(), 2);
    let crmls = all.results.iter().find(|r| r.source == "crmls").unwrap();
    let mred = all.results.iter().find(|r| r.source == "mred").unwrap();
    assert!(crmls.success);
    assert!(!mred.success);
    assert!(orchestrator.store().get_listing("C1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_source_returns_structured_failure() {
    let (db, _temp_dir) = create_test_db().await;
    let orchestrator = orchestrator(&db, &[]);

    let result = orchestrator.sync_source("nowhere", SyncMode::Full).await;
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("not_found"));
    assert!(result.run_id.is_none());

    assert!(orchestrator.sync_all(SyncMode::Full).await.success);
}

#[tokio::test]
async fn test_status_report_counts() {
    let (db, _temp_dir) = create_test_db().await;
    let provider = ScriptedProvider::new("mred");
    provider.set_listings(vec![
        raw_listing("A", 1, &stamp(10, 0), None),
        raw_listing("B", 1, &stamp(10, 0), None),
    ]);
    provider.set_agents(vec![raw_agent("A1", &stamp(9, 0))]);

    let orchestrator = orchestrator(&db, &[provider.clone()]);
    orchestrator.sync_source("mred", SyncMode::Full).await;
    provider.set_listings(vec![raw_listing("A", 1, &stamp(10, 0), None)]);
    orchestrator.sync_source("mred", SyncMode::Full).await;

    let status = orchestrator.status("mred").await.unwrap();
    assert_eq!(status.active_listings, 1);
    assert_eq!(status.archived_listings, 1);
    assert_eq!(status.agents, 1);
    assert_eq!(status.latest_run.unwrap().counts.archived, 1);
}
