//! Database module - SQLx with SQLite

use crate::error::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Database state
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default path
    pub async fn new() -> Result<Self> {
        let db_path = get_db_path()?;
        Self::open(db_path).await
    }

    /// Create a new database connection with a specific path
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        log::info!("Connecting to database: {}", db_path.display());

        // Writers from concurrent runs wait on each other instead of failing
        let options = SqliteConnectOptions::from_str(&db_url)?.busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        log::info!("Running database migrations...");

        // Configured MLS sources
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_sources (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL DEFAULT 'reso',
                base_url TEXT NOT NULL,
                access_token TEXT,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Listings, keyed by provider listing key
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                listing_key TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                list_price REAL,
                street_number TEXT,
                street_name TEXT,
                unit_number TEXT,
                unparsed_address TEXT,
                city TEXT,
                state_or_province TEXT,
                postal_code TEXT,
                standard_status TEXT,
                list_agent_key TEXT,
                modification_timestamp TEXT,
                is_archived BOOLEAN NOT NULL DEFAULT 0,
                archived_at TEXT,
                archive_reason TEXT,
                raw_fields TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_source_archived ON listings(source, is_archived)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_agent ON listings(list_agent_key) WHERE list_agent_key IS NOT NULL")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_modified ON listings(source, modification_timestamp)")
            .execute(&self.pool)
            .await?;

        // Agents, keyed by provider member key
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                member_key TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                full_name TEXT,
                email TEXT,
                phone TEXT,
                office_name TEXT,
                modification_timestamp TEXT,
                from_feed BOOLEAN NOT NULL DEFAULT 1,
                raw_fields TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Agents fetched by key are kept out of the incremental watermark
        sqlx::query("ALTER TABLE agents ADD COLUMN from_feed BOOLEAN NOT NULL DEFAULT 1")
            .execute(&self.pool)
            .await
            .ok(); // Ignore error if column already exists

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_agents_modified ON agents(source, modification_timestamp)")
            .execute(&self.pool)
            .await?;

        // Append-only sync history
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER,
                listings_processed INTEGER NOT NULL DEFAULT 0,
                listings_upserted INTEGER NOT NULL DEFAULT 0,
                listings_stale INTEGER NOT NULL DEFAULT 0,
                listings_malformed INTEGER NOT NULL DEFAULT 0,
                agents_processed INTEGER NOT NULL DEFAULT 0,
                agents_upserted INTEGER NOT NULL DEFAULT 0,
                agents_stale INTEGER NOT NULL DEFAULT 0,
                agents_malformed INTEGER NOT NULL DEFAULT 0,
                listings_archived INTEGER NOT NULL DEFAULT 0,
                unresolved_links INTEGER NOT NULL DEFAULT 0,
                agents_resolved INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_runs_source_started ON sync_runs(source, started_at DESC)")
            .execute(&self.pool)
            .await?;

        // At most one in-progress run per source
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_runs_one_in_progress ON sync_runs(source) WHERE status = 'in_progress'")
            .execute(&self.pool)
            .await?;

        // Cleanup schedule, one row per source
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cleanup_schedules (
                source TEXT PRIMARY KEY,
                cron_expression TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                retention_days INTEGER NOT NULL,
                terminal_statuses TEXT NOT NULL DEFAULT '[]',
                last_run_at TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        log::info!("Database migrations completed");
        Ok(())
    }
}

/// Get database file path
/// Priority: MLSYNC_DB_PATH env var > default app data directory
pub fn get_db_path() -> Result<PathBuf> {
    // Check for environment variable override
    if let Ok(path) = std::env::var("MLSYNC_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    // Default: use app data directory
    let dirs = directories::ProjectDirs::from("com", "mlsync", "MLSync")
        .ok_or_else(|| Error::config("Could not determine project directories"))?;

    Ok(dirs.data_dir().join("mlsync.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to ensure env var tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_get_db_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::remove_var("MLSYNC_DB_PATH");
        let path = get_db_path().unwrap();
        assert!(path.to_string_lossy().contains("mlsync.db"));
    }

    #[test]
    fn test_get_db_path_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let test_path = "/tmp/test_mlsync.db";
        std::env::set_var("MLSYNC_DB_PATH", test_path);
        let path = get_db_path().unwrap();
        assert_eq!(path.to_string_lossy(), test_path);
        std::env::remove_var("MLSYNC_DB_PATH");
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("test.db");

        let db = Database::open(path.clone()).await.unwrap();
        drop(db);
        let db = Database::open(path).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        for expected in ["agents", "cleanup_schedules", "listings", "sync_runs", "sync_sources"] {
            assert!(names.contains(&expected), "missing table {}", expected);
        }
    }
}
