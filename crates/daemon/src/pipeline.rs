use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::batch::BatchProcessor;
use crate::concurrency::ConcurrencyController;
use crate::config::StageTuning;
use crate::dispatch::Dispatcher;
use crate::events::EventBus;
use crate::failures::FailureTracker;
use crate::mediainfo::MediaInfoAdapter;
use crate::perf::PerformanceMonitor;
use crate::stages::Stage;
use crate::state::{transition, PipelineEvent, PipelineState};
use crate::store::VideoStore;

/// Shared collaborators handed to each pipeline instance.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn VideoStore>,
    pub adapter: Arc<MediaInfoAdapter>,
    pub controller: Arc<ConcurrencyController>,
    pub events: EventBus,
    pub failures: FailureTracker,
}

enum ControlMsg {
    Apply(PipelineEvent, Option<oneshot::Sender<PipelineState>>),
    Query(oneshot::Sender<PipelineState>),
}

/// Control surface for one pipeline stage.
///
/// All state transitions flow through the stage's actor task; the handle
/// only sends events and reads the resulting state.
#[derive(Clone)]
pub struct PipelineHandle {
    stage: &'static str,
    ctl: mpsc::Sender<ControlMsg>,
    trigger: Arc<Notify>,
}

impl PipelineHandle {
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub async fn resume(&self) {
        if self.apply(PipelineEvent::Resume).await.is_some() {
            info!("[{}] resumed", self.stage);
        }
        // Check for work right away instead of waiting out the poll tick.
        self.trigger.notify_one();
    }

    pub async fn pause(&self) {
        if let Some(state) = self.apply(PipelineEvent::PauseRequested).await {
            info!("[{}] pause requested (now {})", self.stage, state.as_str());
        }
    }

    pub async fn state(&self) -> PipelineState {
        let (tx, rx) = oneshot::channel();
        if self.ctl.send(ControlMsg::Query(tx)).await.is_err() {
            return PipelineState::Paused;
        }
        rx.await.unwrap_or(PipelineState::Paused)
    }

    /// Whether the pipeline is actively accepting dispatch (not paused and
    /// no pause pending).
    pub async fn is_running(&self) -> bool {
        self.state().await.is_running()
    }

    /// Trigger an immediate eligibility check.
    pub fn dispatch_available(&self) {
        self.trigger.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.ctl.is_closed()
    }

    pub(crate) async fn accepts_dispatch(&self) -> bool {
        self.state().await.accepts_dispatch()
    }

    /// Apply one event through the actor. None means the actor is gone
    /// (shutdown).
    pub(crate) async fn apply(&self, event: PipelineEvent) -> Option<PipelineState> {
        let (tx, rx) = oneshot::channel();
        self.ctl
            .send(ControlMsg::Apply(event, Some(tx)))
            .await
            .ok()?;
        rx.await.ok()
    }
}

/// The single writer of a stage's `PipelineState`.
async fn actor(stage: &'static str, mut rx: mpsc::Receiver<ControlMsg>) {
    let mut state = PipelineState::Paused;
    while let Some(msg) = rx.recv().await {
        match msg {
            ControlMsg::Apply(event, reply) => {
                let next = transition(state, event);
                if next != state {
                    debug!("[{stage}] {} -> {}", state.as_str(), next.as_str());
                }
                state = next;
                if let Some(reply) = reply {
                    let _ = reply.send(state);
                }
            }
            ControlMsg::Query(reply) => {
                let _ = reply.send(state);
            }
        }
    }
}

/// Self-tuning target duration for one batch, derived from the flush
/// window.
fn batch_duration_target(flush: Duration) -> Duration {
    (flush * 4).clamp(Duration::from_secs(5), Duration::from_secs(120))
}

/// Spawn one pipeline stage: its state actor, dispatcher, and batch
/// processor, joined by a bounded work channel. The stage starts paused.
pub fn spawn_pipeline<S: Stage>(
    stage: Arc<S>,
    deps: PipelineDeps,
    tuning: StageTuning,
    chunk_size: usize,
) -> PipelineHandle {
    let name = stage.name();
    let (ctl_tx, ctl_rx) = mpsc::channel(64);
    let trigger = Arc::new(Notify::new());
    let handle = PipelineHandle {
        stage: name,
        ctl: ctl_tx,
        trigger: Arc::clone(&trigger),
    };

    tokio::spawn(actor(name, ctl_rx));

    let (work_tx, work_rx) = mpsc::channel(tuning.max_in_flight.max(1));

    let dispatcher = Dispatcher::new(
        Arc::clone(&deps.store),
        name,
        stage.entry_state(),
        tuning.max_in_flight,
        tuning.max_per_sec,
        tuning.poll_interval(),
    );
    tokio::spawn(dispatcher.run(handle.clone(), work_tx, Arc::clone(&trigger)));

    let perf = Arc::new(PerformanceMonitor::new(
        tuning.min_batch,
        tuning.max_batch,
        batch_duration_target(tuning.flush_timeout()),
    ));
    let processor = BatchProcessor::new(stage, deps, perf, tuning.flush_timeout(), chunk_size);
    tokio::spawn(processor.run(work_rx, handle.clone(), trigger));

    info!("[{name}] pipeline spawned (paused)");
    handle
}
