use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::events::DaemonEvent;
use crate::failures::ItemFailure;
use crate::media::{VideoAttrs, VideoRecord, WorkItem};
use crate::mediainfo::{MetadataOutcome, ToolLimits};
use crate::perf::PerformanceMonitor;
use crate::pipeline::{PipelineDeps, PipelineHandle};
use crate::stages::{PrepOutcome, Stage};
use crate::state::{PipelineEvent, PipelineState};
use crate::store::{StoreError, VideoUpsert};

/// Bounded retries for a contended batched upsert.
const UPSERT_RETRIES: u32 = 3;
/// First backoff delay; doubles per retry.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Accumulate a batch from the channel: up to `max` items, flushed early
/// once `flush` elapses after the first item. Returns None when the channel
/// is closed and drained.
async fn collect_batch(
    rx: &mut mpsc::Receiver<WorkItem>,
    max: usize,
    flush: Duration,
) -> Option<Vec<WorkItem>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    let deadline = Instant::now() + flush;

    while batch.len() < max.max(1) {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(item)) => batch.push(item),
            // Channel closed: flush what we have, the next recv ends the
            // loop.
            Ok(None) => break,
            Err(_) => break,
        }
    }
    Some(batch)
}

/// Stage orchestrator: metadata resolution, bounded per-item preparation,
/// batched persistence with contention retry, and per-item state
/// transitions.
pub struct BatchProcessor<S: Stage> {
    stage: Arc<S>,
    deps: PipelineDeps,
    perf: Arc<PerformanceMonitor>,
    flush_timeout: Duration,
    chunk_size: usize,
}

impl<S: Stage> BatchProcessor<S> {
    pub fn new(
        stage: Arc<S>,
        deps: PipelineDeps,
        perf: Arc<PerformanceMonitor>,
        flush_timeout: Duration,
        chunk_size: usize,
    ) -> Self {
        BatchProcessor {
            stage,
            deps,
            perf,
            flush_timeout,
            chunk_size,
        }
    }

    /// Drive batches until the work channel closes.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<WorkItem>,
        handle: PipelineHandle,
        trigger: Arc<Notify>,
    ) {
        loop {
            let target = self.perf.batch_size();
            let Some(batch) = collect_batch(&mut rx, target, self.flush_timeout).await else {
                break;
            };

            // Items can sit in the channel across a pause; never start a new
            // batch until the actor grants the processing slot again.
            loop {
                match handle.apply(PipelineEvent::StartProcessing).await {
                    Some(PipelineState::Processing) => break,
                    Some(_) => tokio::time::sleep(Duration::from_millis(200)).await,
                    None => return,
                }
            }

            let started = std::time::Instant::now();
            let more_work = self.process_batch(&batch).await;
            let took = started.elapsed();

            self.perf.record_batch(batch.len(), took);
            self.deps.controller.observe_batch_duration(took);
            handle.apply(PipelineEvent::WorkCompleted { more_work }).await;
            // Capacity freed; let the dispatcher check for work right away.
            trigger.notify_one();
        }
    }

    /// Process one batch through the six-step algorithm. Returns whether
    /// more eligible work remains.
    pub async fn process_batch(&self, batch: &[WorkItem]) -> bool {
        let stage_name = self.stage.name();
        info!("[{stage_name}] processing batch of {} item(s)", batch.len());

        let outcomes = self.resolve_metadata(batch).await;
        let (prepared, failed) = self.prepare_items(batch, &outcomes).await;
        self.handle_failures(&failed);
        self.persist_and_transition(prepared).await;

        let queue_depth_remaining = self
            .deps
            .store
            .count_in_state(self.stage.entry_state())
            .unwrap_or(0);
        self.deps.events.emit(DaemonEvent::BatchThroughput {
            stage: stage_name.to_string(),
            batch_size: batch.len(),
            queue_depth_remaining,
        });
        self.deps.events.emit(DaemonEvent::StageCompleted {
            stage: stage_name.to_string(),
            processed: batch.len(),
        });

        queue_depth_remaining > 0
    }

    /// Step 1: one metadata outcome per path, via bulk invocation with
    /// per-item fallback for unresolved chunks.
    async fn resolve_metadata(&self, batch: &[WorkItem]) -> HashMap<PathBuf, MetadataOutcome> {
        let mut outcomes = HashMap::new();
        if !self.stage.wants_fresh_metadata() {
            return outcomes;
        }

        let limits = self.deps.controller.current();
        let tool = ToolLimits {
            chunk_size: self.chunk_size,
            concurrency: limits.tool_invocation_concurrency,
            timeout: limits.timeout,
        };

        let paths: Vec<PathBuf> = batch.iter().map(|item| item.path.clone()).collect();
        let bulk = self.deps.adapter.resolve_chunked(&paths, &tool).await;
        outcomes.extend(bulk.resolved);

        if !bulk.unresolved.is_empty() {
            debug!(
                "[{}] per-item metadata fallback for {} path(s)",
                self.stage.name(),
                bulk.unresolved.len()
            );
            let semaphore = Arc::new(Semaphore::new(tool.concurrency.max(1)));
            let mut tasks: JoinSet<(PathBuf, MetadataOutcome)> = JoinSet::new();
            for path in bulk.unresolved {
                let adapter = Arc::clone(&self.deps.adapter);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let outcome = adapter.resolve_single(&path, tool.timeout).await;
                    (path, outcome)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Ok((path, outcome)) = joined {
                    outcomes.insert(path, outcome);
                }
            }
        }

        // Invariant: every input path has exactly one outcome before the
        // batch proceeds.
        for item in batch {
            outcomes.entry(item.path.clone()).or_insert_with(|| {
                MetadataOutcome::Unavailable(format!(
                    "metadata resolution produced no outcome for {}",
                    item.path.display()
                ))
            });
        }
        outcomes
    }

    /// Step 2: per-item preparation on a bounded pool with kill-on-timeout.
    async fn prepare_items(
        &self,
        batch: &[WorkItem],
        outcomes: &HashMap<PathBuf, MetadataOutcome>,
    ) -> (Vec<(WorkItem, VideoAttrs)>, Vec<(WorkItem, ItemFailure)>) {
        let limits = self.deps.controller.current();
        let semaphore = Arc::new(Semaphore::new(limits.worker_count.max(1)));
        let mut tasks: JoinSet<(WorkItem, PrepOutcome)> = JoinSet::new();
        let mut by_task: HashMap<tokio::task::Id, WorkItem> = HashMap::new();

        for item in batch.iter().cloned() {
            let existing = match self.deps.store.find_by_path(&item.path) {
                Ok(Some(record)) => record.attrs,
                Ok(None) => VideoAttrs::default(),
                Err(err) => {
                    warn!(
                        "[{}] could not load record for {}: {err}",
                        self.stage.name(),
                        item.path.display()
                    );
                    VideoAttrs::default()
                }
            };

            let stage = Arc::clone(&self.stage);
            let semaphore = Arc::clone(&semaphore);
            let meta = outcomes.get(&item.path).cloned();
            let budget = limits.timeout;
            let tracked = item.clone();

            let abort = tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            item,
                            PrepOutcome::Fail(ItemFailure::Unknown("worker pool closed".into())),
                        )
                    }
                };
                let outcome =
                    match tokio::time::timeout(budget, stage.prepare(&item, &existing, meta.as_ref()))
                        .await
                    {
                        Ok(outcome) => outcome,
                        // The worker future is dropped here, which kills any
                        // kill_on_drop subprocess it was running.
                        Err(_) => PrepOutcome::Fail(ItemFailure::Timeout { budget }),
                    };
                (item, outcome)
            });
            by_task.insert(abort.id(), tracked);
        }

        let mut prepared = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, (item, outcome))) => {
                    by_task.remove(&id);
                    match outcome {
                        PrepOutcome::Ready(attrs) => prepared.push((item, attrs)),
                        PrepOutcome::Skip(reason) => {
                            info!(
                                "[{}] skipped {}: {reason}",
                                self.stage.name(),
                                item.path.display()
                            );
                        }
                        PrepOutcome::Fail(failure) => failed.push((item, failure)),
                    }
                }
                // A panicked worker becomes a failed item, never a dead
                // pipeline.
                Err(join_err) => {
                    if let Some(item) = by_task.remove(&join_err.id()) {
                        failed.push((item, ItemFailure::Unknown(join_err.to_string())));
                    } else {
                        error!("[{}] untracked worker failed: {join_err}", self.stage.name());
                    }
                }
            }
        }
        (prepared, failed)
    }

    /// Step 3: missing files delete their stale record; everything else is
    /// categorized and recorded.
    fn handle_failures(&self, failed: &[(WorkItem, ItemFailure)]) {
        for (item, failure) in failed {
            match failure {
                ItemFailure::FileMissing(path) => {
                    match self.deps.store.delete_by_path(path) {
                        Ok(true) => info!(
                            "[{}] deleted stale record for missing file {}",
                            self.stage.name(),
                            path.display()
                        ),
                        Ok(false) => {}
                        Err(err) => warn!(
                            "[{}] could not delete stale record {}: {err}",
                            self.stage.name(),
                            path.display()
                        ),
                    }
                }
                _ => {
                    if let Err(err) =
                        self.deps
                            .failures
                            .record(self.stage.name(), item.source_id, &item.path, failure)
                    {
                        error!(
                            "[{}] could not record failure for {}: {err}",
                            self.stage.name(),
                            item.path.display()
                        );
                    }
                }
            }
        }
    }

    /// Steps 4 and 5: one batched upsert (retried under contention), then
    /// per-item transitions with the terminal-condition shortcut.
    async fn persist_and_transition(&self, prepared: Vec<(WorkItem, VideoAttrs)>) {
        if prepared.is_empty() {
            return;
        }

        let upserts: Vec<VideoUpsert> = prepared
            .iter()
            .map(|(item, attrs)| VideoUpsert {
                path: item.path.clone(),
                attrs: attrs.clone(),
                state: self.stage.entry_state(),
            })
            .collect();

        let persisted = match self.upsert_with_backoff(&upserts).await {
            Ok(records) => records,
            Err(batch_failure) => {
                // No partial commit is assumed: the whole batch fails.
                for (item, _) in &prepared {
                    if let Err(err) = self.deps.failures.record(
                        self.stage.name(),
                        item.source_id,
                        &item.path,
                        &batch_failure,
                    ) {
                        error!(
                            "[{}] could not record batch failure for {}: {err}",
                            self.stage.name(),
                            item.path.display()
                        );
                    }
                }
                return;
            }
        };

        // Upsert results come back in payload order, so items and records
        // pair up positionally.
        for (record, (item, _)) in persisted.iter().zip(&prepared) {
            self.transition(record, item.force);
        }
    }

    fn transition(&self, record: &VideoRecord, force: bool) {
        let shortcut = if force {
            None
        } else {
            self.stage.already_satisfied(&record.attrs)
        };
        let final_state = match shortcut {
            Some(reason) => {
                info!(
                    "[{}] {} skips ahead: {reason}",
                    self.stage.name(),
                    record.path.display()
                );
                self.stage.skip_state()
            }
            None => self.stage.next_state(),
        };

        match self.deps.store.set_state(&record.path, final_state) {
            Ok(Some(_)) => {
                // A record that just succeeded clears any failure history
                // from earlier attempts.
                if let Err(err) = self.deps.failures.resolve(record.id) {
                    warn!(
                        "[{}] could not resolve failures for {}: {err}",
                        self.stage.name(),
                        record.path.display()
                    );
                }
            }
            Ok(None) => warn!(
                "[{}] record vanished before transition: {}",
                self.stage.name(),
                record.path.display()
            ),
            Err(err) => error!(
                "[{}] state transition failed for {}: {err}",
                self.stage.name(),
                record.path.display()
            ),
        }
    }

    async fn upsert_with_backoff(
        &self,
        upserts: &[VideoUpsert],
    ) -> Result<Vec<VideoRecord>, ItemFailure> {
        let mut delay = BACKOFF_BASE;
        let mut attempt: u32 = 0;

        loop {
            match self.deps.store.upsert_batch(upserts) {
                Ok(records) => return Ok(records),
                Err(StoreError::Contention) => {
                    attempt += 1;
                    if attempt > UPSERT_RETRIES {
                        error!(
                            "[{}] store contention persisted through {} retries, failing batch",
                            self.stage.name(),
                            UPSERT_RETRIES
                        );
                        return Err(ItemFailure::StorageContention {
                            attempts: attempt,
                        });
                    }
                    warn!(
                        "[{}] store contention, retry {attempt}/{UPSERT_RETRIES} in {delay:?}",
                        self.stage.name()
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(other) => {
                    error!(
                        "[{}] batched upsert failed terminally: {other}",
                        self.stage.name()
                    );
                    return Err(ItemFailure::Unknown(other.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyController;
    use crate::config::ConcurrencyTuning;
    use crate::events::EventBus;
    use crate::failures::{FailureCategory, FailureTracker};
    use crate::media::VideoState;
    use crate::mediainfo::MediaInfoAdapter;
    use crate::stages::AnalysisStage;
    use crate::store::{InMemoryStore, VideoStore};
    use std::fs;
    use std::path::Path;

    /// Stage double whose per-item behavior is keyed off the file name.
    struct ScriptedStage;

    impl Stage for ScriptedStage {
        fn name(&self) -> &'static str {
            "analysis"
        }

        fn entry_state(&self) -> VideoState {
            VideoState::NeedsAnalysis
        }

        fn next_state(&self) -> VideoState {
            VideoState::Analyzed
        }

        fn already_satisfied(&self, attrs: &VideoAttrs) -> Option<String> {
            attrs
                .video_codec_is("AV1")
                .then(|| "video already AV1".to_string())
        }

        async fn prepare(
            &self,
            item: &WorkItem,
            existing: &VideoAttrs,
            _meta: Option<&MetadataOutcome>,
        ) -> PrepOutcome {
            let name = item.path.file_name().unwrap().to_str().unwrap();
            if name.contains("missing") {
                PrepOutcome::Fail(ItemFailure::FileMissing(item.path.clone()))
            } else if name.contains("badmeta") {
                PrepOutcome::Fail(ItemFailure::Metadata {
                    message: "mediainfo output was malformed".into(),
                    command: Some("mediainfo --Output=JSON ...".into()),
                })
            } else if name.contains("skipme") {
                PrepOutcome::Skip("file in use".into())
            } else {
                let mut attrs = existing.clone();
                if attrs.video_codec.is_none() {
                    attrs.video_codec = Some("HEVC".into());
                }
                PrepOutcome::Ready(attrs)
            }
        }
    }

    fn deps_with(store: Arc<InMemoryStore>) -> PipelineDeps {
        PipelineDeps {
            store: store.clone(),
            adapter: Arc::new(MediaInfoAdapter::new(PathBuf::from(
                "/definitely/not/mediainfo",
            ))),
            controller: Arc::new(ConcurrencyController::new(ConcurrencyTuning {
                max_workers: 4,
                max_tool_invocations: 2,
                base_timeout_secs: 30,
                max_timeout_secs: 60,
            })),
            events: EventBus::new(16),
            failures: FailureTracker::new(store),
        }
    }

    fn processor<S: Stage>(stage: S, deps: PipelineDeps) -> BatchProcessor<S> {
        BatchProcessor::new(
            Arc::new(stage),
            deps,
            Arc::new(PerformanceMonitor::new(1, 100, Duration::from_secs(10))),
            Duration::from_millis(50),
            25,
        )
    }

    fn seed(store: &InMemoryStore, paths: &[&str]) -> Vec<WorkItem> {
        let upserts: Vec<VideoUpsert> = paths
            .iter()
            .map(|p| VideoUpsert {
                path: PathBuf::from(p),
                attrs: VideoAttrs::default(),
                state: VideoState::NeedsAnalysis,
            })
            .collect();
        store
            .upsert_batch(&upserts)
            .unwrap()
            .iter()
            .map(WorkItem::from_record)
            .collect()
    }

    #[tokio::test]
    async fn mixed_batch_routes_each_item_independently() {
        let store = Arc::new(InMemoryStore::new());
        let deps = deps_with(store.clone());
        let mut events = deps.events.subscribe();
        let items = seed(&store, &["/m/missing.mkv", "/m/ok.mkv", "/m/badmeta.mkv"]);

        let processor = processor(ScriptedStage, deps);
        processor.process_batch(&items).await;

        // Missing file: stale record deleted, not failed.
        assert!(store
            .find_by_path(Path::new("/m/missing.mkv"))
            .unwrap()
            .is_none());

        // Healthy item: persisted and transitioned to the next state.
        let ok = store.find_by_path(Path::new("/m/ok.mkv")).unwrap().unwrap();
        assert_eq!(ok.state, VideoState::Analyzed);
        assert_eq!(ok.attrs.video_codec.as_deref(), Some("HEVC"));

        // Malformed metadata: failed with a metadata_extraction record.
        let bad = store
            .find_by_path(Path::new("/m/badmeta.mkv"))
            .unwrap()
            .unwrap();
        assert_eq!(bad.state, VideoState::Failed);
        let failures = store.failures_for(bad.id).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].category, FailureCategory::MetadataExtraction);

        // Telemetry reports the full batch size.
        match events.recv().await.unwrap() {
            DaemonEvent::BatchThroughput {
                stage, batch_size, ..
            } => {
                assert_eq!(stage, "analysis");
                assert_eq!(batch_size, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn contention_backs_off_then_persists_once() {
        let store = Arc::new(InMemoryStore::new());
        let deps = deps_with(store.clone());
        let items = seed(&store, &["/m/a.mkv", "/m/b.mkv"]);
        store.inject_contention(2);

        let started = Instant::now();
        let processor = processor(ScriptedStage, deps);
        processor.process_batch(&items).await;

        // Two waits of increasing duration: 100ms then 200ms.
        assert!(started.elapsed() >= Duration::from_millis(300));

        for path in ["/m/a.mkv", "/m/b.mkv"] {
            let record = store.find_by_path(Path::new(path)).unwrap().unwrap();
            assert_eq!(record.state, VideoState::Analyzed);
        }
        assert_eq!(store.count_in_state(VideoState::NeedsAnalysis).unwrap(), 0);
        assert!(store.unresolved_failures().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_contention_fails_every_item_in_the_batch() {
        let store = Arc::new(InMemoryStore::new());
        let deps = deps_with(store.clone());
        let items = seed(&store, &["/m/a.mkv", "/m/b.mkv"]);
        store.inject_contention(10);

        let processor = processor(ScriptedStage, deps);
        processor.process_batch(&items).await;

        for path in ["/m/a.mkv", "/m/b.mkv"] {
            let record = store.find_by_path(Path::new(path)).unwrap().unwrap();
            assert_eq!(record.state, VideoState::Failed);
            let failures = store.failures_for(record.id).unwrap();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].category, FailureCategory::StorageContention);
        }
    }

    #[tokio::test]
    async fn terminal_codec_shortcut_lands_in_skip_state() {
        let store = Arc::new(InMemoryStore::new());
        let deps = deps_with(store.clone());
        store
            .upsert_batch(&[VideoUpsert {
                path: PathBuf::from("/m/already.mkv"),
                attrs: VideoAttrs {
                    video_codec: Some("AV1".into()),
                    ..Default::default()
                },
                state: VideoState::NeedsAnalysis,
            }])
            .unwrap();
        let items = vec![WorkItem::from_record(
            &store
                .find_by_path(Path::new("/m/already.mkv"))
                .unwrap()
                .unwrap(),
        )];

        let processor = processor(ScriptedStage, deps);
        processor.process_batch(&items).await;

        let record = store
            .find_by_path(Path::new("/m/already.mkv"))
            .unwrap()
            .unwrap();
        // Skips the intermediate states entirely.
        assert_eq!(record.state, VideoState::Encoded);
    }

    #[tokio::test]
    async fn skip_outcomes_are_not_persisted_or_failed() {
        let store = Arc::new(InMemoryStore::new());
        let deps = deps_with(store.clone());
        let items = seed(&store, &["/m/skipme.mkv"]);

        let processor = processor(ScriptedStage, deps);
        processor.process_batch(&items).await;

        let record = store
            .find_by_path(Path::new("/m/skipme.mkv"))
            .unwrap()
            .unwrap();
        assert_eq!(record.state, VideoState::NeedsAnalysis);
        assert!(store.unresolved_failures().unwrap().is_empty());
    }

    #[tokio::test]
    async fn metadata_fallback_failure_still_resolves_every_item() {
        // Real files on disk, but the mediainfo binary does not exist: the
        // bulk chunk fails, the per-item fallback fails, and every item must
        // still end up with an explicit outcome (here: a recorded failure).
        let dir = std::env::temp_dir().join(format!("revid-batch-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let paths: Vec<String> = ["one.mkv", "two.mkv"]
            .iter()
            .map(|name| {
                let p = dir.join(name);
                fs::write(&p, b"not really a video").unwrap();
                p.display().to_string()
            })
            .collect();

        let store = Arc::new(InMemoryStore::new());
        let deps = deps_with(store.clone());
        let items = seed(&store, &paths.iter().map(|s| s.as_str()).collect::<Vec<_>>());

        let processor = processor(AnalysisStage::new("AV1".into(), "Opus".into()), deps);
        processor.process_batch(&items).await;

        for path in &paths {
            let record = store.find_by_path(Path::new(path)).unwrap().unwrap();
            assert_eq!(record.state, VideoState::Failed);
            let failures = store.failures_for(record.id).unwrap();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].category, FailureCategory::MetadataExtraction);
        }

        fs::remove_dir_all(&dir).unwrap();
    }
}
