//! Services module

pub mod cleanup;
pub mod history;
pub mod linker;
pub mod normalizer;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod sync;

pub use cleanup::{
    get_schedule, list_schedules, run_cleanup, save_schedule, validate_schedule, CleanupScheduler,
};
pub use history::SyncHistory;
pub use linker::{AgentLinker, LinkOutcome};
pub use normalizer::{
    normalize, normalize_agent, normalize_listing, MalformedRecordError, NormalizedRecord,
};
pub use provider::registry::{
    get_source, list_sources, remove_source, set_source_enabled, upsert_source,
};
pub use provider::{
    build_provider, Page, ProviderClient, ProviderError, ProviderRegistry, RawRecord, ResoClient,
};
pub use reconcile::{collapse_batch, plan_archival, BatchOutcome, ReconciliationEngine};
pub use store::{should_apply, DanglingLink, RecordStore, UpsertResult};
pub use sync::SyncOrchestrator;
