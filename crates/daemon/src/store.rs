use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use log::{debug, info};
use thiserror::Error;
use uuid::Uuid;

use crate::failures::FailureRecord;
use crate::media::{VideoAttrs, VideoRecord, VideoState};

/// Errors surfaced by the persistence layer.
///
/// `Contention` is the transient "resource busy" signal callers retry with
/// backoff; everything else is terminal for the operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store busy, retry later")]
    Contention,
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One record of a batched upsert, keyed by path.
#[derive(Debug, Clone)]
pub struct VideoUpsert {
    pub path: PathBuf,
    pub attrs: VideoAttrs,
    pub state: VideoState,
}

/// Persistence contract shared by the three pipelines.
///
/// The batched upsert is idempotent per path key: retrying the same payload
/// after a `Contention` error produces one record per path, not duplicates.
pub trait VideoStore: Send + Sync {
    /// Insert-or-update each record by path. Existing records keep their id
    /// and `inserted_at`; attributes and state are replaced.
    fn upsert_batch(&self, batch: &[VideoUpsert]) -> Result<Vec<VideoRecord>, StoreError>;

    /// Up to `limit` records currently in `state`, oldest update first.
    fn fetch_in_state(&self, state: VideoState, limit: usize)
        -> Result<Vec<VideoRecord>, StoreError>;

    fn count_in_state(&self, state: VideoState) -> Result<usize, StoreError>;

    fn find_by_path(&self, path: &Path) -> Result<Option<VideoRecord>, StoreError>;

    /// Remove a stale record (missing source file). Returns whether one
    /// existed.
    fn delete_by_path(&self, path: &Path) -> Result<bool, StoreError>;

    /// Transition a record's state. Returns the updated record, or None if
    /// no record exists for the path.
    fn set_state(&self, path: &Path, state: VideoState)
        -> Result<Option<VideoRecord>, StoreError>;

    fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError>;

    fn failures_for(&self, video_id: Uuid) -> Result<Vec<FailureRecord>, StoreError>;

    fn unresolved_failures(&self) -> Result<Vec<FailureRecord>, StoreError>;

    /// Mark all failure records for a video resolved. Returns how many were
    /// flipped.
    fn resolve_failures(&self, video_id: Uuid) -> Result<usize, StoreError>;
}

fn apply_upsert(existing: Option<&VideoRecord>, upsert: &VideoUpsert) -> VideoRecord {
    let now = Utc::now();
    match existing {
        Some(record) => VideoRecord {
            id: record.id,
            path: record.path.clone(),
            attrs: upsert.attrs.clone(),
            state: upsert.state,
            inserted_at: record.inserted_at,
            updated_at: now,
        },
        None => VideoRecord {
            id: Uuid::new_v4(),
            path: upsert.path.clone(),
            attrs: upsert.attrs.clone(),
            state: upsert.state,
            inserted_at: now,
            updated_at: now,
        },
    }
}

fn sorted_in_state(
    records: impl Iterator<Item = VideoRecord>,
    state: VideoState,
    limit: usize,
) -> Vec<VideoRecord> {
    let mut matching: Vec<VideoRecord> = records.filter(|r| r.state == state).collect();
    matching.sort_by_key(|r| r.updated_at);
    matching.truncate(limit);
    matching
}

/// In-memory store used by tests and dry runs.
///
/// Supports injecting contention errors to exercise the batch retry path.
#[derive(Default)]
pub struct InMemoryStore {
    videos: Mutex<HashMap<PathBuf, VideoRecord>>,
    failures: Mutex<Vec<FailureRecord>>,
    contention_budget: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upsert calls fail with `StoreError::Contention`.
    pub fn inject_contention(&self, n: u32) {
        self.contention_budget.store(n, Ordering::SeqCst);
    }
}

impl VideoStore for InMemoryStore {
    fn upsert_batch(&self, batch: &[VideoUpsert]) -> Result<Vec<VideoRecord>, StoreError> {
        if self.contention_budget.load(Ordering::SeqCst) > 0 {
            self.contention_budget.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Contention);
        }
        let mut videos = self.videos.lock().unwrap();
        let mut results = Vec::with_capacity(batch.len());
        for upsert in batch {
            let updated = apply_upsert(videos.get(&upsert.path), upsert);
            videos.insert(upsert.path.clone(), updated.clone());
            results.push(updated);
        }
        Ok(results)
    }

    fn fetch_in_state(
        &self,
        state: VideoState,
        limit: usize,
    ) -> Result<Vec<VideoRecord>, StoreError> {
        let videos = self.videos.lock().unwrap();
        Ok(sorted_in_state(videos.values().cloned(), state, limit))
    }

    fn count_in_state(&self, state: VideoState) -> Result<usize, StoreError> {
        let videos = self.videos.lock().unwrap();
        Ok(videos.values().filter(|r| r.state == state).count())
    }

    fn find_by_path(&self, path: &Path) -> Result<Option<VideoRecord>, StoreError> {
        Ok(self.videos.lock().unwrap().get(path).cloned())
    }

    fn delete_by_path(&self, path: &Path) -> Result<bool, StoreError> {
        Ok(self.videos.lock().unwrap().remove(path).is_some())
    }

    fn set_state(
        &self,
        path: &Path,
        state: VideoState,
    ) -> Result<Option<VideoRecord>, StoreError> {
        let mut videos = self.videos.lock().unwrap();
        Ok(videos.get_mut(path).map(|record| {
            record.state = state;
            record.updated_at = Utc::now();
            record.clone()
        }))
    }

    fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError> {
        self.failures.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn failures_for(&self, video_id: Uuid) -> Result<Vec<FailureRecord>, StoreError> {
        Ok(self
            .failures
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.video_id == video_id)
            .cloned()
            .collect())
    }

    fn unresolved_failures(&self) -> Result<Vec<FailureRecord>, StoreError> {
        Ok(self
            .failures
            .lock()
            .unwrap()
            .iter()
            .filter(|f| !f.resolved)
            .cloned()
            .collect())
    }

    fn resolve_failures(&self, video_id: Uuid) -> Result<usize, StoreError> {
        let mut failures = self.failures.lock().unwrap();
        let mut flipped = 0;
        for failure in failures.iter_mut() {
            if failure.video_id == video_id && !failure.resolved {
                failure.resolved = true;
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

/// JSON-file-per-record store rooted at a state directory.
///
/// Records live under `videos/<id>.json` and failure records under
/// `failures/<id>.json`; everything is mirrored in memory and written
/// through on mutation. Writes go to a temp file first, then rename.
pub struct JsonFileStore {
    videos_dir: PathBuf,
    failures_dir: PathBuf,
    videos: Mutex<HashMap<PathBuf, VideoRecord>>,
    failures: Mutex<Vec<FailureRecord>>,
}

impl JsonFileStore {
    /// Open (or initialize) a store under `state_dir`, loading all existing
    /// records.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let videos_dir = state_dir.join("videos");
        let failures_dir = state_dir.join("failures");
        fs::create_dir_all(&videos_dir)?;
        fs::create_dir_all(&failures_dir)?;

        let mut videos = HashMap::new();
        for entry in fs::read_dir(&videos_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let record: VideoRecord = serde_json::from_str(&fs::read_to_string(&path)?)?;
            videos.insert(record.path.clone(), record);
        }

        let mut failures = Vec::new();
        for entry in fs::read_dir(&failures_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let record: FailureRecord = serde_json::from_str(&fs::read_to_string(&path)?)?;
            failures.push(record);
        }

        info!(
            "store opened: {} video record(s), {} failure record(s)",
            videos.len(),
            failures.len()
        );

        Ok(JsonFileStore {
            videos_dir,
            failures_dir,
            videos: Mutex::new(videos),
            failures: Mutex::new(failures),
        })
    }

    fn video_file(&self, id: Uuid) -> PathBuf {
        self.videos_dir.join(format!("{id}.json"))
    }

    fn failure_file(&self, id: Uuid) -> PathBuf {
        self.failures_dir.join(format!("{id}.json"))
    }

    fn write_json<T: serde::Serialize>(&self, target: &Path, value: &T) -> Result<(), StoreError> {
        let tmp = target.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, body).map_err(map_busy)?;
        fs::rename(&tmp, target).map_err(map_busy)?;
        Ok(())
    }
}

/// WouldBlock-style errors from the filesystem are reported as contention so
/// callers retry with backoff instead of failing the batch outright.
fn map_busy(err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::WouldBlock {
        StoreError::Contention
    } else {
        StoreError::Io(err)
    }
}

impl VideoStore for JsonFileStore {
    fn upsert_batch(&self, batch: &[VideoUpsert]) -> Result<Vec<VideoRecord>, StoreError> {
        let mut videos = self.videos.lock().unwrap();

        // Stage every updated record before touching disk so a serialization
        // problem cannot partially apply the batch.
        let staged: Vec<VideoRecord> = batch
            .iter()
            .map(|upsert| apply_upsert(videos.get(&upsert.path), upsert))
            .collect();

        for record in &staged {
            self.write_json(&self.video_file(record.id), record)?;
        }
        for record in &staged {
            videos.insert(record.path.clone(), record.clone());
        }
        debug!("upserted {} record(s)", staged.len());
        Ok(staged)
    }

    fn fetch_in_state(
        &self,
        state: VideoState,
        limit: usize,
    ) -> Result<Vec<VideoRecord>, StoreError> {
        let videos = self.videos.lock().unwrap();
        Ok(sorted_in_state(videos.values().cloned(), state, limit))
    }

    fn count_in_state(&self, state: VideoState) -> Result<usize, StoreError> {
        let videos = self.videos.lock().unwrap();
        Ok(videos.values().filter(|r| r.state == state).count())
    }

    fn find_by_path(&self, path: &Path) -> Result<Option<VideoRecord>, StoreError> {
        Ok(self.videos.lock().unwrap().get(path).cloned())
    }

    fn delete_by_path(&self, path: &Path) -> Result<bool, StoreError> {
        let mut videos = self.videos.lock().unwrap();
        match videos.remove(path) {
            Some(record) => {
                let file = self.video_file(record.id);
                if file.exists() {
                    fs::remove_file(&file)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_state(
        &self,
        path: &Path,
        state: VideoState,
    ) -> Result<Option<VideoRecord>, StoreError> {
        let mut videos = self.videos.lock().unwrap();
        let Some(record) = videos.get_mut(path) else {
            return Ok(None);
        };
        record.state = state;
        record.updated_at = Utc::now();
        let snapshot = record.clone();
        self.write_json(&self.video_file(snapshot.id), &snapshot)?;
        Ok(Some(snapshot))
    }

    fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError> {
        self.write_json(&self.failure_file(record.id), record)?;
        self.failures.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn failures_for(&self, video_id: Uuid) -> Result<Vec<FailureRecord>, StoreError> {
        Ok(self
            .failures
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.video_id == video_id)
            .cloned()
            .collect())
    }

    fn unresolved_failures(&self) -> Result<Vec<FailureRecord>, StoreError> {
        Ok(self
            .failures
            .lock()
            .unwrap()
            .iter()
            .filter(|f| !f.resolved)
            .cloned()
            .collect())
    }

    fn resolve_failures(&self, video_id: Uuid) -> Result<usize, StoreError> {
        let mut failures = self.failures.lock().unwrap();
        let mut flipped = 0;
        for failure in failures.iter_mut() {
            if failure.video_id == video_id && !failure.resolved {
                failure.resolved = true;
                self.write_json(&self.failure_file(failure.id), failure)?;
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(path: &str) -> VideoUpsert {
        VideoUpsert {
            path: PathBuf::from(path),
            attrs: VideoAttrs {
                video_codec: Some("HEVC".into()),
                ..Default::default()
            },
            state: VideoState::NeedsAnalysis,
        }
    }

    fn temp_state_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("revid-store-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn upsert_is_idempotent_per_path() {
        let store = InMemoryStore::new();
        let batch = vec![upsert("/media/a.mkv"), upsert("/media/b.mkv")];

        let first = store.upsert_batch(&batch).unwrap();
        // Retrying the identical payload (a replayed contention retry) must
        // not create duplicates or new ids.
        let second = store.upsert_batch(&batch).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(store.count_in_state(VideoState::NeedsAnalysis).unwrap(), 2);
    }

    #[test]
    fn injected_contention_surfaces_then_clears() {
        let store = InMemoryStore::new();
        store.inject_contention(2);
        assert!(matches!(
            store.upsert_batch(&[upsert("/media/a.mkv")]),
            Err(StoreError::Contention)
        ));
        assert!(matches!(
            store.upsert_batch(&[upsert("/media/a.mkv")]),
            Err(StoreError::Contention)
        ));
        assert!(store.upsert_batch(&[upsert("/media/a.mkv")]).is_ok());
    }

    #[test]
    fn fetch_in_state_honors_limit_and_state() {
        let store = InMemoryStore::new();
        store
            .upsert_batch(&[upsert("/a"), upsert("/b"), upsert("/c")])
            .unwrap();
        store.set_state(Path::new("/c"), VideoState::Analyzed).unwrap();

        let fetched = store.fetch_in_state(VideoState::NeedsAnalysis, 2).unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(fetched.iter().all(|r| r.state == VideoState::NeedsAnalysis));
    }

    #[test]
    fn json_store_round_trips_across_reopen() {
        let dir = temp_state_dir();

        {
            let store = JsonFileStore::open(&dir).unwrap();
            store.upsert_batch(&[upsert("/media/a.mkv")]).unwrap();
            store
                .set_state(Path::new("/media/a.mkv"), VideoState::Analyzed)
                .unwrap();
        }

        let reopened = JsonFileStore::open(&dir).unwrap();
        let record = reopened
            .find_by_path(Path::new("/media/a.mkv"))
            .unwrap()
            .unwrap();
        assert_eq!(record.state, VideoState::Analyzed);
        assert_eq!(record.attrs.video_codec.as_deref(), Some("HEVC"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn json_store_delete_removes_the_file() {
        let dir = temp_state_dir();
        let store = JsonFileStore::open(&dir).unwrap();
        let record = store
            .upsert_batch(&[upsert("/media/a.mkv")])
            .unwrap()
            .remove(0);

        assert!(store.delete_by_path(Path::new("/media/a.mkv")).unwrap());
        assert!(!dir.join("videos").join(format!("{}.json", record.id)).exists());
        assert!(!store.delete_by_path(Path::new("/media/a.mkv")).unwrap());

        fs::remove_dir_all(&dir).unwrap();
    }
}
