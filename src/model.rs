use crate::error::ConfigError;
use crate::format::MarginTier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Smallest starting cash the service accepts.
pub const MIN_INITIAL_CASH: f64 = 1000.0;

/// Opaque identifier correlating client requests to one server-side run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationHandle(pub String);

impl fmt::Display for SimulationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TradingFrequency {
    Daily,
    Intraday,
}

impl TradingFrequency {
    /// Longest simulated duration the service supports at this cadence.
    pub fn max_duration_days(self) -> u32 {
        match self {
            TradingFrequency::Daily => 365,
            TradingFrequency::Intraday => 60,
        }
    }
}

impl fmt::Display for TradingFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingFrequency::Daily => f.write_str("daily"),
            TradingFrequency::Intraday => f.write_str("intraday"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleCondition {
    #[serde(rename = "greater_than")]
    GreaterThan,
    #[serde(rename = "less_than")]
    LessThan,
}

/// One initial (ticker, share-count) position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub shares: u32,
}

/// A conditional trading rule evaluated server-side. Rules flagged `one_time`
/// are retired from the visible rule set after the service reports they fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingRule {
    pub ticker: String,
    pub action: TradeAction,
    pub condition: RuleCondition,
    pub threshold: f64,
    pub shares: u32,
    #[serde(default)]
    pub one_time: bool,
}

impl fmt::Display for TradingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        };
        let cmp = match self.condition {
            RuleCondition::GreaterThan => '>',
            RuleCondition::LessThan => '<',
        };
        write!(
            f,
            "{action} {} {} when price {cmp} {:.2}",
            self.shares, self.ticker, self.threshold
        )
    }
}

/// Everything the service needs to start a run. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub initial_cash: f64,
    pub start_date: String,
    pub duration_days: u32,
    pub trading_frequency: TradingFrequency,
    pub tickers: Vec<Position>,
    pub trading_rules: Vec<TradingRule>,
    pub beta_hedge_enabled: bool,
}

impl SimulationConfig {
    /// Local validation gate. Failures here never reach the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tickers.is_empty() {
            return Err(ConfigError::NoPositions);
        }
        if self.initial_cash < MIN_INITIAL_CASH {
            return Err(ConfigError::CashBelowMinimum {
                min: MIN_INITIAL_CASH,
                got: self.initial_cash,
            });
        }
        let max = self.trading_frequency.max_duration_days();
        if self.duration_days < 1 || self.duration_days > max {
            return Err(ConfigError::DurationOutOfRange {
                got: self.duration_days,
                max,
                frequency: self.trading_frequency,
            });
        }
        Ok(())
    }
}

/// One polled status response describing cumulative progress of a run. Each
/// snapshot is a superset (by interval coverage) of the previous one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub results: Vec<IntervalResult>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub final_metrics: Option<FinalMetrics>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One unit of simulated time with its own prices, trades, and value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalResult {
    pub day: u64,
    #[serde(default)]
    pub interval_label: Option<String>,
    pub date: String,
    /// Empty mapping signals the market was closed for this interval.
    #[serde(default)]
    pub prices: BTreeMap<String, f64>,
    #[serde(default)]
    pub trades: Vec<String>,
    pub portfolio_value: f64,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub one_time_rules_executed: u64,
    #[serde(default)]
    pub hedge_margin_balance: Option<f64>,
}

impl IntervalResult {
    pub fn label(&self) -> String {
        self.interval_label
            .clone()
            .unwrap_or_else(|| format!("Day {}", self.day))
    }

    pub fn market_closed(&self) -> bool {
        self.prices.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Buy,
    Sell,
    Hedge,
}

impl TradeKind {
    pub fn label(self) -> &'static str {
        match self {
            TradeKind::Buy => "buy",
            TradeKind::Sell => "sell",
            TradeKind::Hedge => "hedge",
        }
    }
}

/// Classify a trade-description string from the service. Hedge legs mention
/// "hedged", "shorted", or "bought back"; plain buys mention "bought".
pub fn classify_trade(description: &str) -> TradeKind {
    let lower = description.to_lowercase();
    if lower.contains("hedged") || lower.contains("shorted") || lower.contains("bought back") {
        TradeKind::Hedge
    } else if lower.contains("bought") {
        TradeKind::Buy
    } else {
        TradeKind::Sell
    }
}

/// Summary metrics attached to the final snapshot of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalMetrics {
    pub final_value: f64,
    pub total_return_pct: f64,
    pub total_pnl: f64,
    #[serde(default)]
    pub sharpe_ratio: Option<f64>,
    #[serde(default)]
    pub volatility_pct: Option<f64>,
    #[serde(default)]
    pub total_trades: Option<u64>,
    #[serde(default)]
    pub beta: Option<f64>,
    #[serde(default)]
    pub beta_interpretation: Option<String>,
    #[serde(default)]
    pub correlation: Option<f64>,
    #[serde(default)]
    pub hedge_trades_count: u64,
    #[serde(default)]
    pub total_hedge_margin_used: Option<f64>,
    #[serde(default)]
    pub hedge_margin_remaining: Option<f64>,
}

/// Response envelope for `/start_simulation`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    pub success: bool,
    #[serde(default)]
    pub simulation_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Minimal `{success, error?}` envelope shared by stop and chat-reset.
#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response envelope for `/ai_analysis`.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisResponse {
    pub success: bool,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response envelope for `/plot/{id}/{type}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlotResponse {
    pub success: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PlotType {
    Value,
    Percentage,
    Pnl,
}

impl PlotType {
    pub fn as_str(self) -> &'static str {
        match self {
            PlotType::Value => "value",
            PlotType::Percentage => "percentage",
            PlotType::Pnl => "pnl",
        }
    }
}

/// Notifications the lifecycle emits for presentation layers. The core never
/// touches a rendering surface directly.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// Submission accepted; a run is now active under this handle.
    Submitted { handle: SimulationHandle },
    /// Displayed progress, non-decreasing within a run.
    Progress { fraction: f64 },
    /// A new interval entered the view (append-only, never re-emitted).
    IntervalAdded {
        // Boxed to keep the enum small; interval results carry maps and vecs.
        result: Box<IntervalResult>,
    },
    /// Latest hedge-margin balance with its banding tier.
    MarginUpdate { balance: f64, tier: MarginTier },
    /// A one-shot rule left the active rule set; keep it visible for `fade`
    /// before removal.
    RuleRetired { rule: TradingRule, fade: Duration },
    /// The run finished and final metrics are available.
    Completed { metrics: Box<FinalMetrics> },
    /// Terminal failure reported by the service or a failed finalization.
    Failed { message: String },
    /// The run was stopped locally.
    Stopped,
}
