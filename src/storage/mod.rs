//! Remote persistence of finished analyses.

mod supabase;

pub use supabase::SupabaseStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Could not decode storage response: {0}")]
    Decode(String),

    #[error("Remote storage is not configured")]
    NotConfigured,
}

/// Row written for one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub niche_name: String,
    pub status: String,
    pub report_markdown: Option<String>,
    pub metadata: serde_json::Value,
}

/// What the store handed back after a save.
#[derive(Debug, Clone, Default)]
pub struct SavedRecord {
    pub id: Option<String>,
}

/// Durable remote store for analysis records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_record(&self, record: &AnalysisRecord) -> Result<SavedRecord, StorageError>;
}

/// Stand-in used when no remote store is configured. Every save fails, so
/// callers take their local fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledRecordStore;

#[async_trait]
impl RecordStore for DisabledRecordStore {
    async fn save_record(&self, _record: &AnalysisRecord) -> Result<SavedRecord, StorageError> {
        Err(StorageError::NotConfigured)
    }
}
