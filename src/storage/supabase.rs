//! Supabase (PostgREST) record store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use super::{AnalysisRecord, RecordStore, SavedRecord, StorageError};

pub const DEFAULT_TABLE: &str = "analyses";

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    table: String,
}

impl SupabaseStore {
    pub fn new(url: &str, key: &str, table: impl Into<String>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("apikey", HeaderValue::from_str(key)?);
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", key))?);
        headers.insert("prefer", HeaderValue::from_static("return=representation"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            table: table.into(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }
}

/// PostgREST answers an insert with the inserted rows.
fn record_id(body: &serde_json::Value) -> Option<String> {
    let row = match body {
        serde_json::Value::Array(rows) => rows.first()?,
        other => other,
    };
    match row.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl RecordStore for SupabaseStore {
    async fn save_record(&self, record: &AnalysisRecord) -> Result<SavedRecord, StorageError> {
        let response = self.client.post(self.table_url()).json(record).send().await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(StorageError::Status {
                code: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(SavedRecord::default());
        }
        let body: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| StorageError::Decode(e.to_string()))?;
        Ok(SavedRecord { id: record_id(&body) })
    }
}
