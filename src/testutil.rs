//! Scripted in-memory simulation service for lifecycle and poller tests.

use crate::client::SimulationService;
use crate::model::{
    FinalMetrics, IntervalResult, SimulationConfig, SimulationHandle, StatusSnapshot,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted response for `status()`.
#[derive(Debug, Clone)]
pub enum Step {
    Snapshot(StatusSnapshot),
    Error(String),
}

/// Fake service that pops scripted steps; the last snapshot repeats once the
/// script runs out. Tracks call and in-flight counts for concurrency checks.
pub struct FakeService {
    handle: SimulationHandle,
    script: Mutex<VecDeque<Step>>,
    status_delay: Duration,
    reject_submit: Option<String>,
    pub submit_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeService {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            handle: SimulationHandle("sim-under-test".to_string()),
            script: Mutex::new(script.into()),
            status_delay: Duration::ZERO,
            reject_submit: None,
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub fn rejecting_submit(mut self, error: &str) -> Self {
        self.reject_submit = Some(error.to_string());
        self
    }

    pub fn handle(&self) -> SimulationHandle {
        self.handle.clone()
    }

    fn next_step(&self) -> Option<Step> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

#[async_trait]
impl SimulationService for FakeService {
    async fn submit(&self, _config: &SimulationConfig) -> Result<SimulationHandle> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.reject_submit {
            bail!(error.clone());
        }
        Ok(self.handle.clone())
    }

    async fn status(&self, handle: &SimulationHandle) -> Result<StatusSnapshot> {
        assert_eq!(*handle, self.handle, "status polled for a foreign handle");
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.next_step() {
            Some(Step::Snapshot(snapshot)) => Ok(snapshot),
            Some(Step::Error(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("script exhausted")),
        }
    }

    async fn cancel(&self, _handle: &SimulationHandle) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn interval(day: u64) -> IntervalResult {
    IntervalResult {
        day,
        interval_label: None,
        date: format!("2025-07-{:02}", 21 + day),
        prices: [("AAPL".to_string(), 210.0 + day as f64)]
            .into_iter()
            .collect(),
        trades: Vec::new(),
        portfolio_value: 10_000.0 + day as f64 * 10.0,
        pnl: Some(day as f64 * 10.0),
        one_time_rules_executed: 0,
        hedge_margin_balance: None,
    }
}

/// An in-progress snapshot covering intervals `0..days`.
pub fn running_snapshot(days: u64, progress: f64) -> StatusSnapshot {
    StatusSnapshot {
        progress,
        results: (0..days).map(interval).collect(),
        ..Default::default()
    }
}

/// A completed snapshot, optionally carrying final metrics.
pub fn completed_snapshot(days: u64, with_metrics: bool) -> StatusSnapshot {
    StatusSnapshot {
        progress: 1.0,
        results: (0..days).map(interval).collect(),
        is_complete: true,
        final_metrics: with_metrics.then(sample_metrics),
        error: None,
    }
}

pub fn sample_metrics() -> FinalMetrics {
    FinalMetrics {
        final_value: 11_500.0,
        total_return_pct: 15.0,
        total_pnl: 1_500.0,
        sharpe_ratio: Some(1.2),
        volatility_pct: Some(12.3),
        total_trades: Some(7),
        beta: Some(0.95),
        beta_interpretation: Some("moves with the market".to_string()),
        correlation: Some(0.88),
        hedge_trades_count: 2,
        total_hedge_margin_used: Some(3_000.0),
        hedge_margin_remaining: Some(7_000.0),
    }
}
