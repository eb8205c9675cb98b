//! Recurring status poller for the active simulation handle.

use crate::client::SimulationService;
use crate::model::{SimulationHandle, StatusSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// One poll result, tagged with the handle it was issued for so responses
/// that outlive their run can be ignored.
#[derive(Debug)]
pub struct PollUpdate {
    pub handle: SimulationHandle,
    pub snapshot: StatusSnapshot,
}

/// Control handle for a running poll task.
pub struct PollCtx {
    cancel: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl PollCtx {
    /// Stop the loop: no further ticks issue requests, and an in-flight
    /// response is dropped instead of forwarded.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Spawn the poll loop for `handle`. The loop exits on stop, on a send to a
/// closed channel, or after forwarding a snapshot with the completion flag.
pub fn spawn_poller<S: SimulationService + 'static>(
    service: Arc<S>,
    handle: SimulationHandle,
    interval: Duration,
    tx: UnboundedSender<PollUpdate>,
) -> PollCtx {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // A slow request delays the next tick rather than queueing a burst
        // behind it.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if flag.load(Ordering::SeqCst) {
                break;
            }
            // Awaiting the request here is what keeps polling single-flight:
            // the next tick cannot fire while one is outstanding.
            match service.status(&handle).await {
                Ok(snapshot) => {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let complete = snapshot.is_complete;
                    if tx.send(PollUpdate {
                        handle: handle.clone(),
                        snapshot,
                    })
                    .is_err()
                    {
                        break;
                    }
                    if complete {
                        debug!(sim_id = %handle, "completion snapshot forwarded, poller exiting");
                        break;
                    }
                }
                // Transient failures are not fatal; keep the cadence.
                Err(e) => {
                    warn!(sim_id = %handle, error = %e, "status poll failed, retrying on next tick")
                }
            }
        }
    });
    PollCtx { cancel, task }
}
