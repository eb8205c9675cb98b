//! Display formatting for money, percentages, and risk ratios.
//!
//! Every function here is total: undefined or NaN input renders as an
//! explicit "n/a" marker instead of panicking.

use serde::{Deserialize, Serialize};

/// Marker rendered for absent or non-finite values.
pub const NOT_AVAILABLE: &str = "n/a";

/// Fixed 2-decimal currency with thousands grouping, e.g. `$12,345.67`.
pub fn format_currency(value: f64) -> String {
    if !value.is_finite() {
        return NOT_AVAILABLE.to_string();
    }
    let negative = value < 0.0;
    let cents = (value.abs() * 100.0).round() as u128;
    let whole = (cents / 100).to_string();
    let frac = cents % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if negative { "-" } else { "" };
    format!("{sign}${grouped}.{frac:02}")
}

/// Signed percentage with an explicit `+` for non-negative values.
pub fn format_signed_percent(value: f64) -> String {
    if !value.is_finite() {
        return NOT_AVAILABLE.to_string();
    }
    let sign = if value >= 0.0 { "+" } else { "" };
    format!("{sign}{value:.2}%")
}

/// 3-decimal fixed ratio (Sharpe, beta, correlation), or the "n/a" marker
/// when the value is absent or NaN.
pub fn format_ratio(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.3}"),
        _ => NOT_AVAILABLE.to_string(),
    }
}

/// Hedge-margin banding. Three ordered, non-overlapping bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginTier {
    Critical,
    Warning,
    Healthy,
}

impl MarginTier {
    /// Below 1000 is critical, 1000–4999 warning, 5000 and up healthy.
    /// Non-finite balances rank as critical so a bad feed is loud, not hidden.
    pub fn for_balance(balance: f64) -> Self {
        if !balance.is_finite() || balance < 1000.0 {
            MarginTier::Critical
        } else if balance < 5000.0 {
            MarginTier::Warning
        } else {
            MarginTier::Healthy
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MarginTier::Critical => "critical",
            MarginTier::Warning => "warning",
            MarginTier::Healthy => "healthy",
        }
    }
}
