//! Record Normalizer
//!
//! Maps raw provider payloads into typed `Listing` / `Agent` records. Missing
//! optional fields become `None`; a record without its unique key is rejected
//! with `MalformedRecordError` so the caller can skip and count it.
//!
//! Field names follow the RESO Data Dictionary, with a few common aliases
//! accepted for feeds that deviate from it.

use serde_json::Value;
use thiserror::Error;

use super::provider::RawRecord;
use crate::models::{Agent, Listing, RecordKind};
use crate::utils::parse_timestamp;

/// A single record that cannot be normalized
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} record rejected: {reason}")]
pub struct MalformedRecordError {
    pub kind: RecordKind,
    pub reason: String,
}

impl MalformedRecordError {
    fn new(kind: RecordKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Typed output of `normalize`
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRecord {
    Listing(Listing),
    Agent(Agent),
}

/// Normalize a raw record of the given kind
pub fn normalize(
    kind: RecordKind,
    source: &str,
    raw: &RawRecord,
) -> Result<NormalizedRecord, MalformedRecordError> {
    match kind {
        RecordKind::Listing => normalize_listing(source, raw).map(NormalizedRecord::Listing),
        RecordKind::Agent => normalize_agent(source, raw).map(NormalizedRecord::Agent),
    }
}

pub fn normalize_listing(source: &str, raw: &RawRecord) -> Result<Listing, MalformedRecordError> {
    let listing_key = required_key(raw, &["ListingKey", "listing_key", "ListingId"])
        .ok_or_else(|| MalformedRecordError::new(RecordKind::Listing, "missing ListingKey"))?;

    Ok(Listing {
        listing_key,
        source: source.to_string(),
        list_price: number(raw, &["ListPrice", "list_price"]),
        street_number: text(raw, &["StreetNumber", "street_number"]),
        street_name: text(raw, &["StreetName", "street_name"]),
        unit_number: text(raw, &["UnitNumber", "unit_number"]),
        unparsed_address: text(raw, &["UnparsedAddress", "unparsed_address"]),
        city: text(raw, &["City", "city"]),
        state_or_province: text(raw, &["StateOrProvince", "state_or_province", "State"]),
        postal_code: text(raw, &["PostalCode", "postal_code"]),
        standard_status: text(raw, &["StandardStatus", "standard_status", "MlsStatus"]),
        list_agent_key: text(raw, &["ListAgentKey", "list_agent_key", "ListAgentMlsId"]),
        modification_timestamp: timestamp(raw, RecordKind::Listing),
        is_archived: false,
        archived_at: None,
        archive_reason: None,
        raw_fields: Value::Object(raw.clone()),
    })
}

pub fn normalize_agent(source: &str, raw: &RawRecord) -> Result<Agent, MalformedRecordError> {
    let member_key = required_key(raw, &["MemberKey", "member_key", "MemberMlsId"])
        .ok_or_else(|| MalformedRecordError::new(RecordKind::Agent, "missing MemberKey"))?;

    let first_name = text(raw, &["MemberFirstName", "first_name"]);
    let last_name = text(raw, &["MemberLastName", "last_name"]);
    let full_name = text(raw, &["MemberFullName", "full_name"]).or_else(|| {
        let parts: Vec<&str> = [first_name.as_deref(), last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    });

    Ok(Agent {
        member_key,
        source: source.to_string(),
        first_name,
        last_name,
        full_name,
        email: text(raw, &["MemberEmail", "email"]),
        phone: text(
            raw,
            &[
                "MemberPreferredPhone",
                "MemberDirectPhone",
                "MemberMobilePhone",
                "MemberOfficePhone",
                "phone",
            ],
        ),
        office_name: text(raw, &["OfficeName", "MemberOfficeName", "office_name"]),
        modification_timestamp: timestamp(raw, RecordKind::Agent),
        raw_fields: Value::Object(raw.clone()),
    })
}

// ============================================================================
// Field helpers
// ============================================================================

/// First non-empty string (or stringified number) under any of `names`
fn text(raw: &RawRecord, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match raw.get(*name)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Keys may arrive as strings or integers
fn required_key(raw: &RawRecord, names: &[&str]) -> Option<String> {
    text(raw, names)
}

/// Numeric field, accepting numeric strings such as "350000" or "$350,000"
fn number(raw: &RawRecord, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|name| match raw.get(*name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    })
}

fn timestamp(raw: &RawRecord, kind: RecordKind) -> Option<chrono::DateTime<chrono::Utc>> {
    let value = text(raw, &["ModificationTimestamp", "modification_timestamp"])?;
    let parsed = parse_timestamp(&value);
    if parsed.is_none() {
        log::debug!(
            "[sync:normalize] Unparsable {} ModificationTimestamp '{}', treating as absent",
            kind,
            value
        );
    }
    parsed
}
