//! Incremental, append-only view of interval results.

use crate::format::MarginTier;
use crate::model::{SimEvent, StatusSnapshot};
use std::collections::BTreeSet;
use tokio::sync::mpsc::UnboundedSender;

/// Tracks which interval indices have entered the view. Snapshots only ever
/// grow, so the view is append-only: an interval is emitted once, in snapshot
/// order, and never reordered or removed.
#[derive(Debug, Default)]
pub struct ResultView {
    rendered: BTreeSet<u64>,
    order: Vec<u64>,
    last_margin: Option<f64>,
}

impl ResultView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every interval in `snapshot` not already present, keyed by
    /// interval index. Re-applying the same snapshot is a no-op.
    pub fn apply(&mut self, snapshot: &StatusSnapshot, event_tx: &UnboundedSender<SimEvent>) {
        for result in &snapshot.results {
            if !self.rendered.insert(result.day) {
                continue;
            }
            self.order.push(result.day);
            let _ = event_tx.send(SimEvent::IntervalAdded {
                result: Box::new(result.clone()),
            });
        }

        if let Some(balance) = snapshot.results.last().and_then(|r| r.hedge_margin_balance) {
            if self.last_margin != Some(balance) {
                self.last_margin = Some(balance);
                let _ = event_tx.send(SimEvent::MarginUpdate {
                    balance,
                    tier: MarginTier::for_balance(balance),
                });
            }
        }
    }

    /// Interval indices in the order they entered the view.
    pub fn indices(&self) -> &[u64] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
