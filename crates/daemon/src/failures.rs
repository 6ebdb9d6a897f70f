use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::media::{VideoRecord, VideoState};
use crate::store::{StoreError, VideoStore};

/// Fixed failure categories used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    FileAccess,
    MetadataExtraction,
    Validation,
    Timeout,
    ProcessFailure,
    StorageContention,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::FileAccess => "file_access",
            FailureCategory::MetadataExtraction => "metadata_extraction",
            FailureCategory::Validation => "validation",
            FailureCategory::Timeout => "timeout",
            FailureCategory::ProcessFailure => "process_failure",
            FailureCategory::StorageContention => "storage_contention",
            FailureCategory::Unknown => "unknown",
        }
    }
}

/// Typed per-item failure produced at the point of failure.
///
/// Carries whatever context is available at the failure site (the exact
/// command line and captured output for subprocess failures) so a failure
/// record supports later manual retry.
#[derive(Debug, Clone, Error)]
pub enum ItemFailure {
    #[error("file missing: {}", .0.display())]
    FileMissing(PathBuf),
    #[error("metadata extraction failed: {message}")]
    Metadata {
        message: String,
        command: Option<String>,
    },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("worker timed out after {budget:?}")]
    Timeout { budget: Duration },
    #[error("process failed: {message}")]
    Process {
        message: String,
        command: Option<String>,
        output: Option<String>,
    },
    #[error("storage contention persisted after {attempts} attempts")]
    StorageContention { attempts: u32 },
    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl ItemFailure {
    pub fn category(&self) -> FailureCategory {
        match self {
            ItemFailure::FileMissing(_) => FailureCategory::FileAccess,
            ItemFailure::Metadata { .. } => FailureCategory::MetadataExtraction,
            ItemFailure::Validation(_) => FailureCategory::Validation,
            ItemFailure::Timeout { .. } => FailureCategory::Timeout,
            ItemFailure::Process { .. } => FailureCategory::ProcessFailure,
            ItemFailure::StorageContention { .. } => FailureCategory::StorageContention,
            ItemFailure::Unknown(_) => FailureCategory::Unknown,
        }
    }

    /// Stable short code for pattern aggregation.
    pub fn code(&self) -> &'static str {
        match self {
            ItemFailure::FileMissing(_) => "file_missing",
            ItemFailure::Metadata { .. } => "metadata_unavailable",
            ItemFailure::Validation(_) => "invalid_metadata",
            ItemFailure::Timeout { .. } => "worker_timeout",
            ItemFailure::Process { .. } => "tool_failed",
            ItemFailure::StorageContention { .. } => "upsert_contention",
            ItemFailure::Unknown(_) => "unexpected",
        }
    }

    /// Subprocess context (command line plus captured output), when known.
    pub fn context(&self) -> Option<String> {
        match self {
            ItemFailure::Metadata {
                command: Some(cmd), ..
            } => Some(cmd.clone()),
            ItemFailure::Process {
                command, output, ..
            } => match (command, output) {
                (Some(cmd), Some(out)) => Some(format!("{cmd}\n{out}")),
                (Some(cmd), None) => Some(cmd.clone()),
                (None, Some(out)) => Some(out.clone()),
                (None, None) => None,
            },
            _ => None,
        }
    }
}

/// Classify uncontrolled external text (subprocess stderr, tool output).
///
/// Ordered rules, first match wins. Typed failures never go through here;
/// this exists only for errors sourced from text we do not produce.
pub fn categorize_text(text: &str) -> FailureCategory {
    let lower = text.to_lowercase();
    if lower.contains("mediainfo") || lower.contains("metadata") {
        FailureCategory::MetadataExtraction
    } else if lower.contains("no such file")
        || lower.contains("permission denied")
        || lower.contains("file")
    {
        FailureCategory::FileAccess
    } else if lower.contains("valid") {
        FailureCategory::Validation
    } else if lower.contains("timed out") || lower.contains("timeout") {
        FailureCategory::Timeout
    } else if lower.contains("exception") || lower.contains("panic") {
        FailureCategory::Unknown
    } else if lower.contains("exit") || lower.contains("signal") || lower.contains("process") {
        FailureCategory::ProcessFailure
    } else {
        FailureCategory::Unknown
    }
}

/// Append-only failure record; soft-deleted via `resolved` on successful
/// retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub video_id: Uuid,
    pub path: PathBuf,
    pub stage: String,
    pub category: FailureCategory,
    pub code: String,
    pub message: String,
    pub context: Option<String>,
    pub inserted_at: DateTime<Utc>,
    pub resolved: bool,
}

impl FailureRecord {
    pub fn from_failure(
        stage: &str,
        video_id: Uuid,
        path: &Path,
        failure: &ItemFailure,
    ) -> Self {
        // Unknown failures carry uncontrolled text (panic payloads, join
        // errors); run it through the keyword rules before giving up on a
        // category.
        let category = match failure {
            ItemFailure::Unknown(text) => categorize_text(text),
            _ => failure.category(),
        };
        FailureRecord {
            id: Uuid::new_v4(),
            video_id,
            path: path.to_path_buf(),
            stage: stage.to_string(),
            category,
            code: failure.code().to_string(),
            message: failure.to_string(),
            context: failure.context(),
            inserted_at: Utc::now(),
            resolved: false,
        }
    }
}

/// Aggregate failure counts for external reporting.
#[derive(Debug, Clone, Default)]
pub struct FailureStatistics {
    pub total: usize,
    pub by_category: HashMap<FailureCategory, usize>,
    pub by_stage: HashMap<String, usize>,
}

/// Records categorized failures and answers aggregate queries.
///
/// Purely additive bookkeeping: it never blocks or retries on its own.
/// Retry decisions belong to callers.
#[derive(Clone)]
pub struct FailureTracker {
    store: Arc<dyn VideoStore>,
}

impl FailureTracker {
    pub fn new(store: Arc<dyn VideoStore>) -> Self {
        FailureTracker { store }
    }

    /// Record a failure and flip the owning record to `Failed`.
    pub fn record(
        &self,
        stage: &str,
        video_id: Uuid,
        path: &Path,
        failure: &ItemFailure,
    ) -> Result<(), StoreError> {
        warn!(
            "[{}] {} failed ({}): {}",
            stage,
            path.display(),
            failure.category().as_str(),
            failure
        );
        let record = FailureRecord::from_failure(stage, video_id, path, failure);
        self.store.record_failure(&record)?;
        self.store.set_state(path, VideoState::Failed)?;
        Ok(())
    }

    /// Soft-delete all failure records for a video after a successful retry.
    pub fn resolve(&self, video_id: Uuid) -> Result<usize, StoreError> {
        let cleared = self.store.resolve_failures(video_id)?;
        if cleared > 0 {
            debug!("resolved {} failure record(s) for {}", cleared, video_id);
        }
        Ok(cleared)
    }

    /// Reset a failed record to a stage entry state and clear its failures.
    ///
    /// This is the external "retry failed item" operation; it is never
    /// invoked automatically.
    pub fn retry(
        &self,
        path: &Path,
        entry_state: VideoState,
    ) -> Result<Option<VideoRecord>, StoreError> {
        let updated = self.store.set_state(path, entry_state)?;
        if let Some(record) = &updated {
            self.resolve(record.id)?;
        }
        Ok(updated)
    }

    pub fn failures_for(&self, video_id: Uuid) -> Result<Vec<FailureRecord>, StoreError> {
        self.store.failures_for(video_id)
    }

    /// Counts of unresolved failures by stage and category since a cutoff.
    pub fn statistics(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<FailureStatistics, StoreError> {
        let mut stats = FailureStatistics::default();
        for record in self.store.unresolved_failures()? {
            if let Some(cutoff) = since {
                if record.inserted_at < cutoff {
                    continue;
                }
            }
            stats.total += 1;
            *stats.by_category.entry(record.category).or_insert(0) += 1;
            *stats.by_stage.entry(record.stage.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Most common unresolved failure patterns, as `category/code` keys.
    pub fn common_patterns(&self, limit: usize) -> Result<Vec<(String, usize)>, StoreError> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for record in self.store.unresolved_failures()? {
            let key = format!("{}/{}", record.category.as_str(), record.code);
            *counts.entry(key).or_insert(0) += 1;
        }
        let mut patterns: Vec<(String, usize)> = counts.into_iter().collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        patterns.truncate(limit);
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VideoRecord;
    use crate::store::{InMemoryStore, VideoUpsert};

    fn seeded_store() -> (Arc<InMemoryStore>, VideoRecord) {
        let store = Arc::new(InMemoryStore::new());
        let record = store
            .upsert_batch(&[VideoUpsert {
                path: PathBuf::from("/media/a.mkv"),
                attrs: Default::default(),
                state: VideoState::NeedsAnalysis,
            }])
            .unwrap()
            .remove(0);
        (store, record)
    }

    #[test]
    fn typed_failures_map_to_fixed_categories() {
        let cases: Vec<(ItemFailure, FailureCategory)> = vec![
            (
                ItemFailure::FileMissing(PathBuf::from("/x")),
                FailureCategory::FileAccess,
            ),
            (
                ItemFailure::Metadata {
                    message: "no output".into(),
                    command: None,
                },
                FailureCategory::MetadataExtraction,
            ),
            (
                ItemFailure::Validation("no video track".into()),
                FailureCategory::Validation,
            ),
            (
                ItemFailure::Timeout {
                    budget: Duration::from_secs(1),
                },
                FailureCategory::Timeout,
            ),
            (
                ItemFailure::StorageContention { attempts: 4 },
                FailureCategory::StorageContention,
            ),
            (
                ItemFailure::Unknown("boom".into()),
                FailureCategory::Unknown,
            ),
        ];
        for (failure, expected) in cases {
            assert_eq!(failure.category(), expected);
        }
    }

    #[test]
    fn keyword_fallback_is_ordered() {
        assert_eq!(
            categorize_text("mediainfo exited with code 1"),
            FailureCategory::MetadataExtraction
        );
        assert_eq!(
            categorize_text("No such file or directory"),
            FailureCategory::FileAccess
        );
        assert_eq!(
            categorize_text("output is not valid for this pipeline"),
            FailureCategory::Validation
        );
        assert_eq!(categorize_text("operation timed out"), FailureCategory::Timeout);
        assert_eq!(
            categorize_text("child process exited with signal 9"),
            FailureCategory::ProcessFailure
        );
        assert_eq!(categorize_text("???"), FailureCategory::Unknown);
        // "metadata" outranks "file" when both appear.
        assert_eq!(
            categorize_text("file had no readable metadata"),
            FailureCategory::MetadataExtraction
        );
    }

    #[test]
    fn recording_flips_state_and_resolve_clears() {
        let (store, record) = seeded_store();
        let tracker = FailureTracker::new(store.clone());

        tracker
            .record(
                "analysis",
                record.id,
                &record.path,
                &ItemFailure::Metadata {
                    message: "malformed JSON".into(),
                    command: Some("mediainfo --Output=JSON /media/a.mkv".into()),
                },
            )
            .unwrap();

        let reloaded = store.find_by_path(&record.path).unwrap().unwrap();
        assert_eq!(reloaded.state, VideoState::Failed);

        let failures = tracker.failures_for(record.id).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].category, FailureCategory::MetadataExtraction);
        assert!(failures[0].context.as_deref().unwrap().contains("mediainfo"));

        let cleared = tracker.resolve(record.id).unwrap();
        assert_eq!(cleared, 1);
        let stats = tracker.statistics(None).unwrap();
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn retry_resets_to_entry_state() {
        let (store, record) = seeded_store();
        let tracker = FailureTracker::new(store.clone());
        tracker
            .record(
                "analysis",
                record.id,
                &record.path,
                &ItemFailure::Unknown("boom".into()),
            )
            .unwrap();

        let updated = tracker
            .retry(&record.path, VideoState::NeedsAnalysis)
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, VideoState::NeedsAnalysis);
        assert!(tracker.failures_for(record.id).unwrap()[0].resolved);
    }

    #[test]
    fn common_patterns_rank_by_count() {
        let (store, record) = seeded_store();
        let tracker = FailureTracker::new(store.clone());
        for _ in 0..3 {
            tracker
                .record(
                    "analysis",
                    record.id,
                    &record.path,
                    &ItemFailure::Metadata {
                        message: "bad".into(),
                        command: None,
                    },
                )
                .unwrap();
        }
        tracker
            .record(
                "encode",
                record.id,
                &record.path,
                &ItemFailure::Unknown("boom".into()),
            )
            .unwrap();

        let patterns = tracker.common_patterns(1).unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].0, "metadata_extraction/metadata_unavailable");
        assert_eq!(patterns[0].1, 3);

        let stats = tracker.statistics(None).unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_stage["analysis"], 3);
        assert_eq!(stats.by_stage["encode"], 1);
    }
}
