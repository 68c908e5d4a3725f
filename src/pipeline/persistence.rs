//! Result persistence: remote first on success, local disk otherwise.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::types::{PipelineResult, PipelineStatus};
use crate::storage::RecordStore;

const MAX_NAME_CHARS: usize = 80;

fn sanitize_niche(niche: &str) -> String {
    let name: String = niche
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_NAME_CHARS)
        .collect();
    if name.is_empty() {
        "analysis".to_string()
    } else {
        name
    }
}

fn candidate_name(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}.json", base)
    } else {
        format!("{}_{}.json", base, attempt + 1)
    }
}

/// Write `body` to `file`; on failure remove the partial file at `path`.
async fn write_or_remove<W: AsyncWrite + Unpin>(mut file: W, path: &Path, body: &[u8]) -> std::io::Result<()> {
    let written = async {
        file.write_all(body).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = written {
        drop(file);
        if let Err(rm) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %rm, "Could not remove partial backup");
        }
        return Err(e);
    }
    Ok(())
}

/// Saves finished runs.
pub struct ResultPersistence {
    remote: Arc<dyn RecordStore>,
    output_dir: PathBuf,
}

impl ResultPersistence {
    pub fn new(remote: Arc<dyn RecordStore>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Remote save for a completed run, falling back to disk.
    pub async fn persist_completed(&self, result: &mut PipelineResult) {
        let record = result.to_analysis_record();
        match self.remote.save_record(&record).await {
            Ok(saved) => {
                result.supabase_saved = true;
                result.supabase_record_id = saved.id;
                tracing::info!(
                    niche = %result.niche,
                    record_id = ?result.supabase_record_id,
                    "Analysis saved to remote storage"
                );
            }
            Err(e) => {
                tracing::warn!(kind = "remote", niche = %result.niche, error = %e, "Remote save failed");
                result.warnings.push(format!("Supabase save failed: {}", e));
                self.save_local(result).await;
            }
        }
    }

    /// Failure path: stamp the clock and write locally only.
    ///
    /// A run where some but not all of `planned_stages` succeeded becomes
    /// `Partial`; otherwise the terminal status set by the caller stands.
    pub async fn persist_partial(&self, result: &mut PipelineResult, planned_stages: usize) {
        let succeeded = result.succeeded_stages();
        if succeeded > 0 && succeeded < planned_stages {
            result.status = PipelineStatus::Partial;
        }
        result.finish_clock();
        tracing::info!(
            niche = %result.niche,
            status = %result.status,
            stages_succeeded = succeeded,
            "Saving partial results"
        );
        self.save_local(result).await;
    }

    /// Write the full record to the output directory. Never fails; a
    /// failure is logged and recorded in `errors`.
    pub async fn save_local(&self, result: &mut PipelineResult) {
        match self.write_backup(result).await {
            Ok(path) => {
                tracing::info!(niche = %result.niche, path = %path.display(), "Local backup saved");
            }
            Err(e) => {
                result.local_backup_path = None;
                tracing::error!(
                    kind = "local",
                    niche = %result.niche,
                    dir = %self.output_dir.display(),
                    error = %e,
                    "Local backup failed, result not persisted"
                );
                result.errors.push(format!("Local backup failed: {}", e));
            }
        }
    }

    async fn write_backup(&self, result: &mut PipelineResult) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let base = format!(
            "{}_{}",
            sanitize_niche(&result.niche),
            Utc::now().format("%Y%m%d_%H%M%S")
        );

        let mut attempt = 0u32;
        loop {
            let path = self.output_dir.join(candidate_name(&base, attempt));
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 1000 => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // The saved record names its own path; the result only does once
            // the bytes are on disk.
            result.local_backup_path = Some(path.clone());
            let body = serde_json::to_string_pretty(&result.to_record());
            result.local_backup_path = None;
            let body = match body {
                Ok(body) => body,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e.into());
                }
            };

            write_or_remove(file, &path, body.as_bytes()).await?;
            result.local_backup_path = Some(path.clone());
            return Ok(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use async_trait::async_trait;

    use super::*;
    use crate::agents::AgentResult;
    use crate::storage::{AnalysisRecord, DisabledRecordStore, SavedRecord, StorageError};

    struct OkStore;

    #[async_trait]
    impl RecordStore for OkStore {
        async fn save_record(&self, _record: &AnalysisRecord) -> Result<SavedRecord, StorageError> {
            Ok(SavedRecord {
                id: Some("rec-1".to_string()),
            })
        }
    }

    /// Accepts the open but fails every write.
    struct FullDisk;

    impl AsyncWrite for FullDisk {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn sanitizes_niche_for_filenames() {
        assert_eq!(sanitize_niche("Rust WASM for real-time audio"), "Rust_WASM_for_real-time_audio");
        assert_eq!(sanitize_niche("a/b\\c:d"), "abcd");
        assert_eq!(sanitize_niche("///"), "analysis");
        assert_eq!(sanitize_niche(&"x".repeat(300)).len(), MAX_NAME_CHARS);
    }

    #[tokio::test]
    async fn completed_run_goes_remote_only() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ResultPersistence::new(Arc::new(OkStore), dir.path().join("outputs"));
        let mut result = PipelineResult::new("Rust WASM");
        result.status = PipelineStatus::Completed;

        persistence.persist_completed(&mut result).await;

        assert!(result.supabase_saved);
        assert_eq!(result.supabase_record_id.as_deref(), Some("rec-1"));
        assert!(result.local_backup_path.is_none());
        assert!(!dir.path().join("outputs").exists());
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ResultPersistence::new(Arc::new(DisabledRecordStore), dir.path());
        let mut result = PipelineResult::new("Rust WASM");
        result.status = PipelineStatus::Completed;
        result.final_report = Some("# Report".to_string());

        persistence.persist_completed(&mut result).await;

        assert!(!result.supabase_saved);
        assert!(result.warnings[0].starts_with("Supabase save failed"));
        let path = result.local_backup_path.clone().unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Rust_WASM_"));
        assert!(name.ends_with(".json"));

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["final_report"], "# Report");
        assert_eq!(saved["status"], "completed");
        assert_eq!(saved["local_backup_path"], path.display().to_string());
    }

    #[tokio::test]
    async fn same_second_backups_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ResultPersistence::new(Arc::new(DisabledRecordStore), dir.path());
        let mut a = PipelineResult::new("Same niche");
        let mut b = PipelineResult::new("Same niche");
        persistence.save_local(&mut a).await;
        persistence.save_local(&mut b).await;
        assert_ne!(a.local_backup_path, b.local_backup_path);
        assert!(a.local_backup_path.unwrap().exists());
        assert!(b.local_backup_path.unwrap().exists());
    }

    #[tokio::test]
    async fn partial_when_some_stages_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ResultPersistence::new(Arc::new(OkStore), dir.path());

        let mut result = PipelineResult::new("Rust WASM");
        result.status = PipelineStatus::Failed;
        result.agent_results.push(AgentResult::success("niche_analyst", "x"));
        result.agent_results.push(AgentResult::failure("literature_researcher", "boom"));
        persistence.persist_partial(&mut result, 5).await;

        assert_eq!(result.status, PipelineStatus::Partial);
        assert!(result.end_time.is_some());
        assert!(result.local_backup_path.is_some());
        assert!(!result.supabase_saved);
    }

    #[tokio::test]
    async fn no_progress_keeps_terminal_status() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ResultPersistence::new(Arc::new(OkStore), dir.path());

        let mut result = PipelineResult::new("Rust WASM");
        result.status = PipelineStatus::Timeout;
        persistence.persist_partial(&mut result, 5).await;

        assert_eq!(result.status, PipelineStatus::Timeout);
        assert!(result.local_backup_path.is_some());
    }

    #[tokio::test]
    async fn local_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the output directory should be.
        let blocker = dir.path().join("outputs");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let persistence = ResultPersistence::new(Arc::new(DisabledRecordStore), &blocker);

        let mut result = PipelineResult::new("Rust WASM");
        persistence.save_local(&mut result).await;

        assert!(result.local_backup_path.is_none());
        assert!(result.errors[0].starts_with("Local backup failed"));
    }

    #[tokio::test]
    async fn failed_write_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Rust_WASM_20260101_000000.json");
        std::fs::write(&path, b"").unwrap();

        let err = write_or_remove(FullDisk, &path, b"{\"status\": \"failed\"}")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no space left"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn successful_write_keeps_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        let file = tokio::fs::File::create(&path).await.unwrap();

        write_or_remove(file, &path, b"{}").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }
}
