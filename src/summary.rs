//! Final-metrics summary lines for text output.

use crate::format::{format_currency, format_ratio, format_signed_percent, MarginTier};
use crate::model::FinalMetrics;

/// Build human-readable lines from a completed run's metrics. Optional
/// metrics the service omitted are skipped or rendered as "n/a".
pub fn build_summary(metrics: &FinalMetrics) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push("== Simulation complete ==".to_string());
    lines.push(format!(
        "Final value:    {}",
        format_currency(metrics.final_value)
    ));
    lines.push(format!(
        "Total return:   {}",
        format_signed_percent(metrics.total_return_pct)
    ));
    lines.push(format!(
        "Total P&L:      {}",
        format_currency(metrics.total_pnl)
    ));
    lines.push(format!(
        "Sharpe ratio:   {}",
        format_ratio(metrics.sharpe_ratio)
    ));
    let beta = format_ratio(metrics.beta);
    match metrics.beta_interpretation.as_deref() {
        Some(label) => lines.push(format!("Beta:           {beta} ({label})")),
        None => lines.push(format!("Beta:           {beta}")),
    }
    lines.push(format!(
        "Market corr.:   {}",
        format_ratio(metrics.correlation)
    ));
    if let Some(volatility) = metrics.volatility_pct {
        lines.push(format!("Volatility:     {volatility:.2}%"));
    }
    if let Some(trades) = metrics.total_trades {
        lines.push(format!("Trades:         {trades}"));
    }
    lines.push(format!("Hedge trades:   {}", metrics.hedge_trades_count));
    if let Some(used) = metrics.total_hedge_margin_used {
        lines.push(format!("Margin used:    {}", format_currency(used)));
    }
    if let Some(remaining) = metrics.hedge_margin_remaining {
        lines.push(format!(
            "Margin left:    {} ({})",
            format_currency(remaining),
            MarginTier::for_balance(remaining).label()
        ));
    }
    lines
}
