//! RESO Web API provider
//!
//! Talks to an OData-style RESO Web API endpoint:
//!
//! - `GET {base}/Property?$filter=ModificationTimestamp ge ...&$orderby=...&$top=N`
//! - `GET {base}/Member?...` for agents
//! - `GET {base}/Property('KEY')` for a single record
//!
//! Pagination follows `@odata.nextLink`, which is handed back to the caller
//! as the opaque cursor.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::{Page, ProviderClient, ProviderError, RawRecord};
use crate::models::RecordKind;
use crate::utils::format_timestamp;

/// Field every RESO resource exposes for change tracking
const MODIFICATION_FIELD: &str = "ModificationTimestamp";

/// Response key carrying the next page URL
const NEXT_LINK_KEY: &str = "@odata.nextLink";

/// User agent sent with every request
const USER_AGENT: &str = concat!("mlsync/", env!("CARGO_PKG_VERSION"));

/// RESO Web API client bound to one source
pub struct ResoClient {
    source_name: String,
    base_url: String,
    access_token: Option<String>,
    client: Client,
}

impl ResoClient {
    /// Fails when the HTTP client cannot be built (e.g. no TLS backend)
    pub fn new(
        source_name: impl Into<String>,
        base_url: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            source_name: source_name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.filter(|t| !t.is_empty()),
            client,
        })
    }

    fn resource_url(&self, kind: RecordKind) -> String {
        format!("{}/{}", self.base_url, resource_name(kind))
    }

    /// Resolve a cursor to a URL; `@odata.nextLink` may be absolute or relative
    fn cursor_url(&self, cursor: &str) -> String {
        if cursor.starts_with("http://") || cursor.starts_with("https://") {
            cursor.to_string()
        } else {
            format!("{}/{}", self.base_url, cursor.trim_start_matches('/'))
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT);

        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl ProviderClient for ResoClient {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn display_name(&self) -> &str {
        "RESO Web API"
    }

    async fn fetch_changes(
        &self,
        kind: RecordKind,
        watermark: Option<DateTime<Utc>>,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<Page, ProviderError> {
        let request = match cursor {
            Some(cursor) => self.get(&self.cursor_url(cursor)),
            None => self
                .get(&self.resource_url(kind))
                .query(&build_query(watermark, page_size)),
        };

        log::debug!(
            "[sync:provider] {} {} page (watermark: {:?}, cursor: {})",
            self.source_name,
            kind,
            watermark.map(|w| format_timestamp(&w)),
            cursor.is_some()
        );

        let response = request.send().await?;
        let body = Self::read_json(response).await?;
        parse_page(body)
    }

    async fn fetch_one(
        &self,
        kind: RecordKind,
        key: &str,
    ) -> Result<Option<RawRecord>, ProviderError> {
        let url = format!("{}('{}')", self.resource_url(kind), escape_key(key));
        let response = self.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            log::debug!("[sync:provider] {} {} '{}' not found", self.source_name, kind, key);
            return Ok(None);
        }

        match Self::read_json(response).await? {
            Value::Object(record) => Ok(Some(record)),
            other => Err(ProviderError::Parse(format!(
                "Expected a JSON object for {} '{}', got {}",
                kind,
                key,
                json_type(&other)
            ))),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn resource_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Listing => "Property",
        RecordKind::Agent => "Member",
    }
}

/// Build the OData query for the first page of a fetch
pub fn build_query(watermark: Option<DateTime<Utc>>, page_size: u32) -> Vec<(String, String)> {
    let mut query = vec![
        ("$top".to_string(), page_size.to_string()),
        ("$orderby".to_string(), format!("{} asc", MODIFICATION_FIELD)),
    ];

    if let Some(watermark) = watermark {
        query.push((
            "$filter".to_string(),
            format!("{} ge {}", MODIFICATION_FIELD, format_timestamp(&watermark)),
        ));
    }

    query
}

/// Parse an OData collection response into a page
pub fn parse_page(body: Value) -> Result<Page, ProviderError> {
    let mut body = match body {
        Value::Object(map) => map,
        other => {
            return Err(ProviderError::Parse(format!(
                "Expected a JSON object, got {}",
                json_type(&other)
            )))
        }
    };

    let records = match body.remove("value") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(record) => Some(record),
                other => {
                    log::warn!(
                        "[sync:provider] Skipping non-object entry ({}) in page",
                        json_type(&other)
                    );
                    None
                }
            })
            .collect(),
        Some(other) => {
            return Err(ProviderError::Parse(format!(
                "Expected 'value' to be an array, got {}",
                json_type(&other)
            )))
        }
        None => return Err(ProviderError::Parse("Missing 'value' array".to_string())),
    };

    let next_cursor = body
        .get(NEXT_LINK_KEY)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(Page::new(records, next_cursor))
}

/// Escape a key for use inside an OData string literal
pub fn escape_key(key: &str) -> String {
    key.replace('\'', "''")
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
