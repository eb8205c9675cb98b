//! Lifecycle effects for one-shot trading rules.

use crate::model::{SimEvent, StatusSnapshot, TradingRule};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// How long a retired rule lingers in the view before removal.
pub const RETIRE_FADE: Duration = Duration::from_secs(2);

/// The one-shot rules still shown as armed in the view. The authoritative
/// rule set lives server-side; this board only mirrors its visible part.
#[derive(Debug, Default)]
pub struct RuleBoard {
    armed: Vec<TradingRule>,
}

impl RuleBoard {
    pub fn from_config(rules: &[TradingRule]) -> Self {
        Self {
            armed: rules.iter().filter(|r| r.one_time).cloned().collect(),
        }
    }

    /// Retire armed one-shot rules when the latest interval reports any
    /// one-shot executions. The feed carries only a count, not which rule
    /// fired, so a single positive count retires every armed rule at once.
    /// Draining the board keeps each retirement from firing twice even if
    /// later snapshots still carry a positive count.
    pub fn observe(&mut self, snapshot: &StatusSnapshot, event_tx: &UnboundedSender<SimEvent>) {
        let Some(latest) = snapshot.results.last() else {
            return;
        };
        if latest.one_time_rules_executed == 0 || self.armed.is_empty() {
            return;
        }
        for rule in self.armed.drain(..) {
            let _ = event_tx.send(SimEvent::RuleRetired {
                rule,
                fade: RETIRE_FADE,
            });
        }
    }

    pub fn armed_len(&self) -> usize {
        self.armed.len()
    }
}
