use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, Notify};

use crate::media::{VideoState, WorkItem};
use crate::pipeline::PipelineHandle;
use crate::state::{PipelineEvent, PipelineState};
use crate::store::VideoStore;

/// Minimum delay between two dispatched items for a rate ceiling.
fn dispatch_gap(max_per_sec: u32) -> Duration {
    if max_per_sec == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / max_per_sec as f64)
    }
}

/// Pull-based work source for one pipeline stage.
///
/// On each work check (periodic tick or an external `dispatch_available`
/// nudge) it queries the store for eligible records and, if the stage
/// accepts dispatch, releases them into the bounded channel under the rate
/// ceiling. Reading the store is the only state it touches; dispatch itself
/// just hands items downstream.
pub struct Dispatcher {
    store: Arc<dyn VideoStore>,
    stage: &'static str,
    entry_state: VideoState,
    max_in_flight: usize,
    max_per_sec: u32,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn VideoStore>,
        stage: &'static str,
        entry_state: VideoState,
        max_in_flight: usize,
        max_per_sec: u32,
        poll_interval: Duration,
    ) -> Self {
        Dispatcher {
            store,
            stage,
            entry_state,
            max_in_flight: max_in_flight.max(1),
            max_per_sec,
            poll_interval,
        }
    }

    pub async fn run(
        self,
        handle: PipelineHandle,
        tx: mpsc::Sender<WorkItem>,
        trigger: Arc<Notify>,
    ) {
        let gap = dispatch_gap(self.max_per_sec);

        loop {
            tokio::select! {
                _ = trigger.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if tx.is_closed() || handle.is_closed() {
                break;
            }
            if !handle.accepts_dispatch().await {
                continue;
            }

            let records = match self.store.fetch_in_state(self.entry_state, self.max_in_flight) {
                Ok(records) => records,
                Err(err) => {
                    warn!("[{}] work check failed: {err}", self.stage);
                    continue;
                }
            };

            if records.is_empty() {
                handle.apply(PipelineEvent::NoWork).await;
                continue;
            }

            // Claim the processing slot before releasing anything; a pause
            // that slipped in between the check and now wins.
            match handle.apply(PipelineEvent::StartProcessing).await {
                Some(PipelineState::Processing) => {}
                Some(_) => continue,
                None => break,
            }

            debug!("[{}] dispatching {} item(s)", self.stage, records.len());
            for record in &records {
                if tx.send(WorkItem::from_record(record)).await.is_err() {
                    return;
                }
                if !gap.is_zero() {
                    tokio::time::sleep(gap).await;
                }
            }
        }
    }
}
