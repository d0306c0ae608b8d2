//! Record store
//!
//! Keyed persistence for listings and agents. Every upsert is guarded by the
//! modification timestamp inside the SQL statement itself, so an older
//! payload can never overwrite a newer stored row, even when two writers race
//! on the same key.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};

use crate::error::Result;
use crate::models::{Agent, ArchiveReason, Listing, RecordKind};
use crate::utils::{format_timestamp, parse_opt_timestamp};

/// Keys per `IN (...)` list; stays well under SQLite's bound-parameter limit
const ARCHIVE_CHUNK_SIZE: usize = 500;

/// Guard for `ON CONFLICT ... DO UPDATE`: apply when the stored row has no
/// timestamp or the incoming one is not older. `NULL >= x` is NULL, so an
/// untimestamped payload never replaces a timestamped row.
const LISTING_GUARD: &str = "listings.modification_timestamp IS NULL \
     OR excluded.modification_timestamp >= listings.modification_timestamp";

const AGENT_GUARD: &str = "agents.modification_timestamp IS NULL \
     OR excluded.modification_timestamp >= agents.modification_timestamp";

/// An applied upsert revives an archived listing when the provider reports
/// it again after dropping it, or reports a strictly newer version.
const LISTING_REVIVE: &str = "listings.archive_reason = 'missing_upstream' \
     OR listings.modification_timestamp IS NULL \
     OR excluded.modification_timestamp > listings.modification_timestamp";

/// Result of an upsert operation
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertResult {
    /// A new record was created
    Created(String),
    /// An existing record was updated
    Updated(String),
    /// The stored record is newer; nothing was written
    Skipped(String),
}

impl UpsertResult {
    pub fn key(&self) -> &str {
        match self {
            UpsertResult::Created(key) => key,
            UpsertResult::Updated(key) => key,
            UpsertResult::Skipped(key) => key,
        }
    }

    /// Whether the incoming record was written
    pub fn applied(&self) -> bool {
        !matches!(self, UpsertResult::Skipped(_))
    }
}

/// Timestamp guard: may `incoming` replace `stored`?
///
/// Mirrors the SQL guard used by the upserts.
pub fn should_apply(incoming: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    match (incoming, stored) {
        (Some(incoming), Some(stored)) => incoming >= stored,
        (_, None) => true,
        (None, Some(_)) => false,
    }
}

// ============================================================================
// Database Row Types
// ============================================================================

/// Database row representation of a listing
#[derive(Debug, Clone, FromRow)]
pub struct ListingRow {
    pub listing_key: String,
    pub source: String,
    pub list_price: Option<f64>,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub unit_number: Option<String>,
    pub unparsed_address: Option<String>,
    pub city: Option<String>,
    pub state_or_province: Option<String>,
    pub postal_code: Option<String>,
    pub standard_status: Option<String>,
    pub list_agent_key: Option<String>,
    pub modification_timestamp: Option<String>,
    pub is_archived: bool,
    pub archived_at: Option<String>,
    pub archive_reason: Option<String>,
    pub raw_fields: String,
}

impl ListingRow {
    pub fn to_listing(&self) -> Listing {
        Listing {
            listing_key: self.listing_key.clone(),
            source: self.source.clone(),
            list_price: self.list_price,
            street_number: self.street_number.clone(),
            street_name: self.street_name.clone(),
            unit_number: self.unit_number.clone(),
            unparsed_address: self.unparsed_address.clone(),
            city: self.city.clone(),
            state_or_province: self.state_or_province.clone(),
            postal_code: self.postal_code.clone(),
            standard_status: self.standard_status.clone(),
            list_agent_key: self.list_agent_key.clone(),
            modification_timestamp: parse_opt_timestamp(&self.modification_timestamp),
            is_archived: self.is_archived,
            archived_at: parse_opt_timestamp(&self.archived_at),
            archive_reason: self.archive_reason.as_deref().and_then(|r| r.parse().ok()),
            raw_fields: parse_raw_fields(&self.listing_key, &self.raw_fields),
        }
    }
}

/// Database row representation of an agent
#[derive(Debug, Clone, FromRow)]
pub struct AgentRow {
    pub member_key: String,
    pub source: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub office_name: Option<String>,
    pub modification_timestamp: Option<String>,
    pub raw_fields: String,
}

impl AgentRow {
    pub fn to_agent(&self) -> Agent {
        Agent {
            member_key: self.member_key.clone(),
            source: self.source.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            full_name: self.full_name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            office_name: self.office_name.clone(),
            modification_timestamp: parse_opt_timestamp(&self.modification_timestamp),
            raw_fields: parse_raw_fields(&self.member_key, &self.raw_fields),
        }
    }
}

fn parse_raw_fields(key: &str, raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        log::warn!("[sync:store] Unreadable raw_fields for '{}': {}", key, e);
        Value::Null
    })
}

/// A stored, active listing whose agent key has no local agent
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DanglingLink {
    pub listing_key: String,
    pub list_agent_key: String,
}

// ============================================================================
// RecordStore
// ============================================================================

/// Storage layer for listings and agents
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a listing by key, guarded by its modification timestamp
    pub async fn upsert_listing(&self, listing: &Listing) -> Result<UpsertResult> {
        let key = listing.listing_key.clone();
        let existed = self.listing_exists(&key).await?;

        let now = format_timestamp(&Utc::now());
        let raw_fields = serde_json::to_string(&listing.raw_fields)?;
        let modified = listing.modification_timestamp.as_ref().map(format_timestamp);

        let sql = format!(
            r#"
            INSERT INTO listings
            (listing_key, source, list_price, street_number, street_name, unit_number,
             unparsed_address, city, state_or_province, postal_code, standard_status,
             list_agent_key, modification_timestamp, is_archived, archived_at, archive_reason,
             raw_fields, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, ?, ?, ?)
            ON CONFLICT(listing_key) DO UPDATE SET
                source = excluded.source,
                list_price = excluded.list_price,
                street_number = excluded.street_number,
                street_name = excluded.street_name,
                unit_number = excluded.unit_number,
                unparsed_address = excluded.unparsed_address,
                city = excluded.city,
                state_or_province = excluded.state_or_province,
                postal_code = excluded.postal_code,
                standard_status = excluded.standard_status,
                list_agent_key = excluded.list_agent_key,
                modification_timestamp = excluded.modification_timestamp,
                is_archived = CASE WHEN {revive} THEN 0 ELSE listings.is_archived END,
                archived_at = CASE WHEN {revive} THEN NULL ELSE listings.archived_at END,
                archive_reason = CASE WHEN {revive} THEN NULL ELSE listings.archive_reason END,
                raw_fields = excluded.raw_fields,
                updated_at = excluded.updated_at
            WHERE {guard}
            "#,
            revive = LISTING_REVIVE,
            guard = LISTING_GUARD,
        );

        let result = sqlx::query(&sql)
            .bind(&listing.listing_key)
            .bind(&listing.source)
            .bind(listing.list_price)
            .bind(&listing.street_number)
            .bind(&listing.street_name)
            .bind(&listing.unit_number)
            .bind(&listing.unparsed_address)
            .bind(&listing.city)
            .bind(&listing.state_or_province)
            .bind(&listing.postal_code)
            .bind(&listing.standard_status)
            .bind(&listing.list_agent_key)
            .bind(&modified)
            .bind(&raw_fields)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        Ok(classify(key, existed, result.rows_affected()))
    }

    /// Upsert an agent delivered by the paginated feed
    pub async fn upsert_agent(&self, agent: &Agent) -> Result<UpsertResult> {
        self.upsert_agent_from(agent, true).await
    }

    /// Upsert an agent fetched on demand by key
    ///
    /// Such agents stay out of the incremental watermark until the feed
    /// delivers them, so feed records older than them are still requested.
    pub async fn upsert_looked_up_agent(&self, agent: &Agent) -> Result<UpsertResult> {
        self.upsert_agent_from(agent, false).await
    }

    async fn upsert_agent_from(&self, agent: &Agent, from_feed: bool) -> Result<UpsertResult> {
        let key = agent.member_key.clone();
        let existed = self.agent_exists(&key).await?;

        let now = format_timestamp(&Utc::now());
        let raw_fields = serde_json::to_string(&agent.raw_fields)?;
        let modified = agent.modification_timestamp.as_ref().map(format_timestamp);

        let sql = format!(
            r#"
            INSERT INTO agents
            (member_key, source, first_name, last_name, full_name, email, phone,
             office_name, modification_timestamp, from_feed, raw_fields, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(member_key) DO UPDATE SET
                source = excluded.source,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                full_name = excluded.full_name,
                email = excluded.email,
                phone = excluded.phone,
                office_name = excluded.office_name,
                modification_timestamp = excluded.modification_timestamp,
                from_feed = MAX(agents.from_feed, excluded.from_feed),
                raw_fields = excluded.raw_fields,
                updated_at = excluded.updated_at
            WHERE {guard}
            "#,
            guard = AGENT_GUARD,
        );

        let result = sqlx::query(&sql)
            .bind(&agent.member_key)
            .bind(&agent.source)
            .bind(&agent.first_name)
            .bind(&agent.last_name)
            .bind(&agent.full_name)
            .bind(&agent.email)
            .bind(&agent.phone)
            .bind(&agent.office_name)
            .bind(&modified)
            .bind(from_feed)
            .bind(&raw_fields)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        Ok(classify(key, existed, result.rows_affected()))
    }

    pub async fn listing_exists(&self, listing_key: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM listings WHERE listing_key = ?")
            .bind(listing_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn agent_exists(&self, member_key: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM agents WHERE member_key = ?")
            .bind(member_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get_listing(&self, listing_key: &str) -> Result<Option<Listing>> {
        let row: Option<ListingRow> = sqlx::query_as(
            r#"
            SELECT listing_key, source, list_price, street_number, street_name, unit_number,
                   unparsed_address, city, state_or_province, postal_code, standard_status,
                   list_agent_key, modification_timestamp, is_archived, archived_at,
                   archive_reason, raw_fields
            FROM listings WHERE listing_key = ?
            "#,
        )
        .bind(listing_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.to_listing()))
    }

    pub async fn get_agent(&self, member_key: &str) -> Result<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as(
            r#"
            SELECT member_key, source, first_name, last_name, full_name, email, phone,
                   office_name, modification_timestamp, raw_fields
            FROM agents WHERE member_key = ?
            "#,
        )
        .bind(member_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.to_agent()))
    }

    /// Incremental watermark: newest feed-delivered modification timestamp for a source
    pub async fn max_modification_timestamp(
        &self,
        source: &str,
        kind: RecordKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = match kind {
            RecordKind::Listing => {
                "SELECT MAX(modification_timestamp) FROM listings WHERE source = ?"
            }
            RecordKind::Agent => {
                "SELECT MAX(modification_timestamp) FROM agents WHERE source = ? AND from_feed = 1"
            }
        };

        let (max,): (Option<String>,) = sqlx::query_as(sql)
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(parse_opt_timestamp(&max))
    }

    /// Keys of every non-archived listing of a source
    pub async fn active_listing_keys(&self, source: &str) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT listing_key FROM listings WHERE source = ? AND is_archived = 0")
                .bind(source)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    /// Archive the given listings of a source; already-archived rows are untouched
    pub async fn archive_listings(
        &self,
        source: &str,
        keys: &[String],
        reason: ArchiveReason,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let archived_at = format_timestamp(&now);
        let mut archived = 0;
        let mut tx = self.pool.begin().await?;

        for chunk in keys.chunks(ARCHIVE_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "UPDATE listings SET is_archived = 1, archived_at = ?, archive_reason = ? \
                 WHERE source = ? AND is_archived = 0 AND listing_key IN ({})",
                placeholders
            );

            let mut query = sqlx::query(&sql)
                .bind(&archived_at)
                .bind(reason.as_str())
                .bind(source);
            for key in chunk {
                query = query.bind(key);
            }
            archived += query.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(archived)
    }

    /// Archive active listings whose status is one of `statuses` (case-insensitive)
    pub async fn archive_terminal_listings(
        &self,
        source: &str,
        statuses: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "UPDATE listings SET is_archived = 1, archived_at = ?, archive_reason = ? \
             WHERE source = ? AND is_archived = 0 AND LOWER(standard_status) IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(format_timestamp(&now))
            .bind(ArchiveReason::TerminalStatus.as_str())
            .bind(source);
        for status in statuses {
            query = query.bind(status.to_lowercase());
        }

        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    /// Archive active listings last modified before `cutoff`
    ///
    /// Listings without a modification timestamp are left alone.
    pub async fn archive_listings_modified_before(
        &self,
        source: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE listings SET is_archived = 1, archived_at = ?, archive_reason = ?
            WHERE source = ? AND is_archived = 0
              AND modification_timestamp IS NOT NULL
              AND modification_timestamp < ?
            "#,
        )
        .bind(format_timestamp(&now))
        .bind(ArchiveReason::Retention.as_str())
        .bind(source)
        .bind(format_timestamp(&cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Active listings whose agent key has no stored agent
    pub async fn dangling_agent_links(&self, source: &str) -> Result<Vec<DanglingLink>> {
        let rows: Vec<DanglingLink> = sqlx::query_as(
            r#"
            SELECT l.listing_key, l.list_agent_key
            FROM listings l
            LEFT JOIN agents a ON a.member_key = l.list_agent_key
            WHERE l.source = ?
              AND l.is_archived = 0
              AND l.list_agent_key IS NOT NULL
              AND a.member_key IS NULL
            ORDER BY l.listing_key
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_listings(&self, source: &str, archived: bool) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM listings WHERE source = ? AND is_archived = ?")
                .bind(source)
                .bind(archived)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn count_agents(&self, source: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents WHERE source = ?")
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn classify(key: String, existed: bool, rows_affected: u64) -> UpsertResult {
    if rows_affected == 0 {
        log::debug!("[sync:store] Skipped '{}': stored record is newer", key);
        UpsertResult::Skipped(key)
    } else if existed {
        UpsertResult::Updated(key)
    } else {
        UpsertResult::Created(key)
    }
}
