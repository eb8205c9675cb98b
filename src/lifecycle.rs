//! Simulation run lifecycle.
//!
//! Owns the active handle and the state machine tying submission, polling,
//! completion detection, and reset together. Emits events for presentation
//! layers; never touches a rendering surface itself.

use crate::client::SimulationService;
use crate::model::{FinalMetrics, SimEvent, SimulationConfig, SimulationHandle, StatusSnapshot};
use crate::poller::{spawn_poller, PollCtx, PollUpdate};
use crate::render::ResultView;
use crate::rules::RuleBoard;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Commands presentation layers send to the lifecycle driver.
#[derive(Debug, Clone)]
pub enum UiCommand {
    Stop,
}

/// Lifecycle states. `Idle` is the only re-entrant state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Submitting,
    Running,
    Completing,
}

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub poll_interval: Duration,
    /// Delay before the single re-fetch when a completed snapshot arrives
    /// without final metrics. The service can report completion one tick
    /// before the metrics are attached.
    pub metrics_retry_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            metrics_retry_delay: Duration::from_millis(750),
        }
    }
}

/// Context for the active run. Taken wholesale on stop, completion, or error
/// so nothing leaks into the next run.
struct RunCtx {
    handle: SimulationHandle,
    poll: PollCtx,
}

pub struct Lifecycle<S: SimulationService + 'static> {
    service: Arc<S>,
    opts: LifecycleOptions,
    event_tx: UnboundedSender<SimEvent>,
    state: RunState,
    run: Option<RunCtx>,
    view: ResultView,
    rules: RuleBoard,
    last_progress: f64,
    final_metrics: Option<FinalMetrics>,
}

impl<S: SimulationService + 'static> Lifecycle<S> {
    pub fn new(
        service: Arc<S>,
        opts: LifecycleOptions,
        event_tx: UnboundedSender<SimEvent>,
    ) -> Self {
        Self {
            service,
            opts,
            event_tx,
            state: RunState::Idle,
            run: None,
            view: ResultView::new(),
            rules: RuleBoard::default(),
            last_progress: 0.0,
            final_metrics: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn view(&self) -> &ResultView {
        &self.view
    }

    pub fn take_final_metrics(&mut self) -> Option<FinalMetrics> {
        self.final_metrics.take()
    }

    /// Validate and submit `config`, then begin polling. Valid only from
    /// `Idle`. Validation failures reject locally, before any network call.
    pub async fn start(&mut self, config: SimulationConfig) -> Result<UnboundedReceiver<PollUpdate>> {
        if self.state != RunState::Idle {
            bail!("a simulation is already active");
        }
        config.validate()?;

        self.state = RunState::Submitting;
        let handle = match self.service.submit(&config).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state = RunState::Idle;
                return Err(e).context("submission failed");
            }
        };
        debug!(sim_id = %handle, "submission accepted");

        // A new run fully replaces everything left by the previous one.
        self.view = ResultView::new();
        self.rules = RuleBoard::from_config(&config.trading_rules);
        self.last_progress = 0.0;
        self.final_metrics = None;

        let _ = self.event_tx.send(SimEvent::Submitted {
            handle: handle.clone(),
        });

        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let poll = spawn_poller(
            self.service.clone(),
            handle.clone(),
            self.opts.poll_interval,
            poll_tx,
        );
        self.run = Some(RunCtx { handle, poll });
        self.state = RunState::Running;
        Ok(poll_rx)
    }

    /// Stop the active run. Remote cancellation is best-effort and runs in
    /// the background; the local reset is unconditional and immediate.
    pub fn stop(&mut self) {
        let Some(run) = self.run.take() else {
            self.state = RunState::Idle;
            return;
        };
        run.poll.stop();

        let service = self.service.clone();
        let handle = run.handle;
        tokio::spawn(async move {
            if let Err(e) = service.cancel(&handle).await {
                warn!(sim_id = %handle, error = %e, "remote cancel failed");
            }
        });

        self.state = RunState::Idle;
        let _ = self.event_tx.send(SimEvent::Stopped);
    }

    /// Apply one polled update. Snapshots tagged with a handle that is no
    /// longer active are ignored, so a late response can never touch the view.
    pub async fn on_update(&mut self, update: PollUpdate) {
        self.on_snapshot(&update.handle, update.snapshot).await;
    }

    pub async fn on_snapshot(&mut self, handle: &SimulationHandle, snapshot: StatusSnapshot) {
        let active = matches!(&self.run, Some(run) if run.handle == *handle);
        if !active || self.state != RunState::Running {
            debug!(sim_id = %handle, "dropping snapshot for inactive run");
            return;
        }

        // Displayed progress is clamped and monotonic even if the service
        // briefly reports a regression.
        let progress = snapshot.progress.clamp(0.0, 1.0);
        if progress > self.last_progress {
            self.last_progress = progress;
            let _ = self.event_tx.send(SimEvent::Progress { fraction: progress });
        }

        self.view.apply(&snapshot, &self.event_tx);
        self.rules.observe(&snapshot, &self.event_tx);

        if let Some(message) = snapshot.error {
            self.fail(message);
            return;
        }
        if snapshot.is_complete {
            self.complete(snapshot.final_metrics).await;
        }
    }

    /// Terminal failure: halt polling, surface the message, return to idle.
    /// Rendered intervals stay in the view exactly as already emitted.
    fn fail(&mut self, message: String) {
        if let Some(run) = self.run.take() {
            run.poll.stop();
        }
        self.state = RunState::Idle;
        let _ = self.event_tx.send(SimEvent::Failed { message });
    }

    async fn complete(&mut self, metrics: Option<FinalMetrics>) {
        self.state = RunState::Completing;
        let run = self.run.take();
        if let Some(run) = &run {
            run.poll.stop();
        }

        let metrics = match (metrics, &run) {
            (Some(metrics), _) => Some(metrics),
            (None, Some(run)) => {
                // One bounded re-fetch, then give up rather than spin.
                debug!(sim_id = %run.handle, "completed snapshot lacked final metrics, re-fetching once");
                tokio::time::sleep(self.opts.metrics_retry_delay).await;
                match self.service.status(&run.handle).await {
                    Ok(snapshot) => snapshot.final_metrics,
                    Err(e) => {
                        warn!(sim_id = %run.handle, error = %e, "final metrics re-fetch failed");
                        None
                    }
                }
            }
            (None, None) => None,
        };

        // Rendered results and metrics stay visible until the next start.
        self.state = RunState::Idle;
        match metrics {
            Some(metrics) => {
                self.final_metrics = Some(metrics.clone());
                let _ = self.event_tx.send(SimEvent::Completed {
                    metrics: Box::new(metrics),
                });
            }
            None => {
                let _ = self.event_tx.send(SimEvent::Failed {
                    message: "simulation completed but the service never attached final metrics"
                        .to_string(),
                });
            }
        }
    }
}

/// Drive one run end to end: submit, pump poll updates through the state
/// machine, honor stop commands, and return the final metrics if the run
/// completed. A closed command channel counts as a stop.
pub async fn run_lifecycle<S: SimulationService + 'static>(
    service: Arc<S>,
    config: SimulationConfig,
    opts: LifecycleOptions,
    event_tx: UnboundedSender<SimEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<Option<FinalMetrics>> {
    let mut lifecycle = Lifecycle::new(service, opts, event_tx);
    let mut updates = lifecycle.start(config).await?;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(UiCommand::Stop) | None => {
                    lifecycle.stop();
                    break;
                }
            },
            update = updates.recv() => match update {
                Some(update) => {
                    lifecycle.on_update(update).await;
                    if lifecycle.state() == RunState::Idle {
                        break;
                    }
                }
                // Poller exited without a completion snapshot (stopped).
                None => break,
            },
        }
    }

    Ok(lifecycle.take_final_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Position, TradingFrequency, TradingRule};
    use crate::model::{RuleCondition, TradeAction};
    use crate::testutil::{completed_snapshot, running_snapshot, FakeService, Step};
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::sleep;

    fn config() -> SimulationConfig {
        SimulationConfig {
            initial_cash: 10_000.0,
            start_date: "2025-07-21".into(),
            duration_days: 30,
            trading_frequency: TradingFrequency::Daily,
            tickers: vec![Position {
                ticker: "AAPL".into(),
                shares: 10,
            }],
            trading_rules: Vec::new(),
            beta_hedge_enabled: false,
        }
    }

    fn fast_opts() -> LifecycleOptions {
        LifecycleOptions {
            poll_interval: Duration::from_millis(2),
            metrics_retry_delay: Duration::from_millis(2),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<SimEvent>) -> Vec<SimEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn added_days(events: &[SimEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|ev| match ev {
                SimEvent::IntervalAdded { result } => Some(result.day),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn invalid_config_rejects_locally_without_a_request() {
        let service = Arc::new(FakeService::new(vec![]));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut lifecycle = Lifecycle::new(service.clone(), fast_opts(), event_tx);

        let mut cfg = config();
        cfg.tickers.clear();
        assert!(lifecycle.start(cfg).await.is_err());

        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.state(), RunState::Idle);
        assert!(drain(&mut event_rx).is_empty());
    }

    #[tokio::test]
    async fn submission_rejection_returns_to_idle() {
        let service = Arc::new(FakeService::new(vec![]).rejecting_submit("bad start date"));
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let mut lifecycle = Lifecycle::new(service.clone(), fast_opts(), event_tx);

        let err = lifecycle.start(config()).await.unwrap_err();
        assert!(format!("{err:#}").contains("bad start date"));
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn run_completes_with_ordered_intervals_and_metrics() {
        let service = Arc::new(FakeService::new(vec![
            Step::Snapshot(running_snapshot(1, 0.2)),
            Step::Snapshot(running_snapshot(3, 0.6)),
            Step::Snapshot(completed_snapshot(5, true)),
        ]));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let metrics = run_lifecycle(service, config(), fast_opts(), event_tx, cmd_rx)
            .await
            .unwrap()
            .expect("run completed");
        assert_eq!(metrics.final_value, 11_500.0);

        let events = drain(&mut event_rx);
        assert_eq!(added_days(&events), vec![0, 1, 2, 3, 4]);

        let progress: Vec<f64> = events
            .iter()
            .filter_map(|ev| match ev {
                SimEvent::Progress { fraction } => Some(*fraction),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert!(events
            .iter()
            .any(|ev| matches!(ev, SimEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn duplicate_snapshots_never_duplicate_intervals() {
        let service = Arc::new(FakeService::new(vec![
            Step::Snapshot(running_snapshot(2, 0.4)),
            Step::Snapshot(running_snapshot(2, 0.4)),
            Step::Snapshot(completed_snapshot(3, true)),
        ]));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        run_lifecycle(service, config(), fast_opts(), event_tx, cmd_rx)
            .await
            .unwrap();

        assert_eq!(added_days(&drain(&mut event_rx)), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn stop_is_terminal_even_for_late_snapshots() {
        let service = Arc::new(
            FakeService::new(vec![Step::Snapshot(running_snapshot(1, 0.1))])
                .with_status_delay(Duration::from_millis(50)),
        );
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut lifecycle = Lifecycle::new(service.clone(), fast_opts(), event_tx);

        let handle = service.handle();
        let _updates = lifecycle.start(config()).await.unwrap();
        lifecycle.stop();
        assert_eq!(lifecycle.state(), RunState::Idle);

        // A response that was in flight when stop landed must be ignored.
        lifecycle
            .on_snapshot(&handle, running_snapshot(4, 0.8))
            .await;
        assert!(lifecycle.view().is_empty());

        let events = drain(&mut event_rx);
        assert!(added_days(&events).is_empty());
        assert!(events.iter().any(|ev| matches!(ev, SimEvent::Stopped)));

        // Best-effort remote cancel goes out in the background.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(service.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reported_error_halts_the_run() {
        let mut snapshot = running_snapshot(2, 0.4);
        snapshot.error = Some("ticker FAKE not found".to_string());
        let service = Arc::new(FakeService::new(vec![Step::Snapshot(snapshot)]));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let metrics = run_lifecycle(service, config(), fast_opts(), event_tx, cmd_rx)
            .await
            .unwrap();
        assert!(metrics.is_none());

        let events = drain(&mut event_rx);
        // Intervals seen before the error stay rendered.
        assert_eq!(added_days(&events), vec![0, 1]);
        assert!(events.iter().any(
            |ev| matches!(ev, SimEvent::Failed { message } if message.contains("FAKE"))
        ));
        assert!(!events
            .iter()
            .any(|ev| matches!(ev, SimEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn missing_final_metrics_are_refetched_once() {
        let service = Arc::new(FakeService::new(vec![
            Step::Snapshot(completed_snapshot(2, false)),
            Step::Snapshot(completed_snapshot(2, true)),
        ]));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let metrics = run_lifecycle(service.clone(), config(), fast_opts(), event_tx, cmd_rx)
            .await
            .unwrap();
        assert!(metrics.is_some());
        // Initial poll plus exactly one re-fetch.
        assert_eq!(service.status_calls.load(Ordering::SeqCst), 2);
        assert!(drain(&mut event_rx)
            .iter()
            .any(|ev| matches!(ev, SimEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn metrics_still_missing_after_retry_is_a_failure() {
        let service = Arc::new(FakeService::new(vec![Step::Snapshot(completed_snapshot(
            2, false,
        ))]));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let metrics = run_lifecycle(service.clone(), config(), fast_opts(), event_tx, cmd_rx)
            .await
            .unwrap();
        assert!(metrics.is_none());
        assert_eq!(service.status_calls.load(Ordering::SeqCst), 2);
        assert!(drain(&mut event_rx).iter().any(
            |ev| matches!(ev, SimEvent::Failed { message } if message.contains("final metrics"))
        ));
    }

    #[tokio::test]
    async fn one_shot_rules_retire_on_execution_signal() {
        let mut cfg = config();
        cfg.trading_rules.push(TradingRule {
            ticker: "NVDA".into(),
            action: TradeAction::Sell,
            condition: RuleCondition::GreaterThan,
            threshold: 500.0,
            shares: 10,
            one_time: true,
        });

        let mut fired = running_snapshot(2, 0.4);
        fired.results[1].one_time_rules_executed = 1;
        let mut still_set = running_snapshot(3, 0.6);
        still_set.results[2].one_time_rules_executed = 1;
        let service = Arc::new(FakeService::new(vec![
            Step::Snapshot(fired),
            Step::Snapshot(still_set),
            Step::Snapshot(completed_snapshot(4, true)),
        ]));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        run_lifecycle(service, cfg, fast_opts(), event_tx, cmd_rx)
            .await
            .unwrap();

        let retired: Vec<String> = drain(&mut event_rx)
            .into_iter()
            .filter_map(|ev| match ev {
                SimEvent::RuleRetired { rule, .. } => Some(rule.ticker),
                _ => None,
            })
            .collect();
        assert_eq!(retired, vec!["NVDA"]);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_a_run_is_active() {
        let service = Arc::new(FakeService::new(vec![Step::Snapshot(running_snapshot(
            1, 0.1,
        ))]));
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let mut lifecycle = Lifecycle::new(service.clone(), fast_opts(), event_tx);

        let _updates = lifecycle.start(config()).await.unwrap();
        let err = lifecycle.start(config()).await.unwrap_err();
        assert!(err.to_string().contains("already active"));
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 1);

        lifecycle.stop();
    }
}
