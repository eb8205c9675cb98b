use crate::client::ApiClient;
use crate::format;
use crate::lifecycle::{run_lifecycle, LifecycleOptions, UiCommand};
use crate::model::{
    classify_trade, IntervalResult, PlotType, Position, RuleCondition, SimEvent, SimulationConfig,
    SimulationHandle, TradeAction, TradingFrequency, TradingRule,
};
use crate::summary;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Output line routing for the stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Parse `TICKER:SHARES` into a position.
fn parse_position(s: &str) -> Result<Position, String> {
    let (ticker, shares) = s
        .split_once(':')
        .ok_or_else(|| format!("expected TICKER:SHARES, got {s:?}"))?;
    if ticker.trim().is_empty() {
        return Err(format!("empty ticker in {s:?}"));
    }
    let shares: u32 = shares
        .parse()
        .map_err(|_| format!("invalid share count in {s:?}"))?;
    Ok(Position {
        ticker: ticker.trim().to_uppercase(),
        shares,
    })
}

/// Parse `TICKER:buy|sell:gt|lt:THRESHOLD:SHARES[:once]` into a trading rule.
fn parse_rule(s: &str) -> Result<TradingRule, String> {
    const USAGE: &str = "expected TICKER:buy|sell:gt|lt:THRESHOLD:SHARES[:once]";
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 || parts.len() > 6 {
        return Err(format!("{USAGE}, got {s:?}"));
    }
    if parts[0].trim().is_empty() {
        return Err(format!("empty ticker in {s:?}"));
    }
    let action = match parts[1] {
        "buy" => TradeAction::Buy,
        "sell" => TradeAction::Sell,
        other => return Err(format!("unknown action {other:?}, expected buy or sell")),
    };
    let condition = match parts[2] {
        "gt" => RuleCondition::GreaterThan,
        "lt" => RuleCondition::LessThan,
        other => return Err(format!("unknown condition {other:?}, expected gt or lt")),
    };
    let threshold: f64 = parts[3]
        .parse()
        .map_err(|_| format!("invalid threshold in {s:?}"))?;
    let shares: u32 = parts[4]
        .parse()
        .map_err(|_| format!("invalid share count in {s:?}"))?;
    let one_time = match parts.get(5) {
        None => false,
        Some(&"once") => true,
        Some(other) => return Err(format!("unknown rule flag {other:?}, expected once")),
    };
    Ok(TradingRule {
        ticker: parts[0].trim().to_uppercase(),
        action,
        condition,
        threshold,
        shares,
        one_time,
    })
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "portfolio-sim-cli",
    version,
    about = "Drive a remote portfolio simulation and watch it unfold"
)]
pub struct Cli {
    /// Base URL of the simulation service
    #[arg(long, default_value = "http://127.0.0.1:5002")]
    pub base_url: String,

    /// Starting cash for the portfolio
    #[arg(long, default_value_t = 100_000.0)]
    pub initial_cash: f64,

    /// Simulation start date (YYYY-MM-DD)
    #[arg(long, default_value = "2025-07-21")]
    pub start_date: String,

    /// Simulated duration in days
    #[arg(long, default_value_t = 30)]
    pub duration_days: u32,

    /// Trading cadence (bounds the duration: 365 days daily, 60 intraday)
    #[arg(long, value_enum, default_value_t = TradingFrequency::Daily)]
    pub frequency: TradingFrequency,

    /// Initial position as TICKER:SHARES (repeatable)
    #[arg(long = "position", value_parser = parse_position)]
    pub positions: Vec<Position>,

    /// Trading rule as TICKER:buy|sell:gt|lt:THRESHOLD:SHARES[:once] (repeatable)
    #[arg(long = "rule", value_parser = parse_rule)]
    pub rules: Vec<TradingRule>,

    /// Enable beta hedging
    #[arg(long)]
    pub hedge: bool,

    /// Status poll cadence
    #[arg(long, default_value = "500ms")]
    pub poll_interval: humantime::Duration,

    /// Ask the advisor a question once the run completes
    #[arg(long)]
    pub ask: Option<String>,

    /// Reset the server-side advisor context before asking
    #[arg(long)]
    pub reset_chat: bool,

    /// Fetch a chart once the run completes
    #[arg(long, value_enum)]
    pub plot: Option<PlotType>,

    /// Where to write the fetched chart
    #[arg(long, default_value = "plot.png")]
    pub plot_out: std::path::PathBuf,

    /// Write final metrics as JSON to this path
    #[arg(long)]
    pub export_json: Option<std::path::PathBuf>,

    /// Print final metrics as JSON on stdout and keep the run quiet
    #[arg(long)]
    pub json: bool,
}

/// Build a `SimulationConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> SimulationConfig {
    SimulationConfig {
        initial_cash: args.initial_cash,
        start_date: args.start_date.clone(),
        duration_days: args.duration_days,
        trading_frequency: args.frequency,
        tickers: args.positions.clone(),
        trading_rules: args.rules.clone(),
        beta_hedge_enabled: args.hedge,
    }
}

/// Lines for one freshly rendered interval.
fn render_interval_lines(result: &IntervalResult) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} ({})  value {}  pnl {}",
        result.label(),
        result.date,
        format::format_currency(result.portfolio_value),
        format::format_currency(result.pnl.unwrap_or(0.0)),
    ));
    if result.market_closed() {
        lines.push("  market closed".to_string());
    } else {
        let prices: Vec<String> = result
            .prices
            .iter()
            .map(|(ticker, price)| format!("{ticker} {}", format::format_currency(*price)))
            .collect();
        lines.push(format!("  {}", prices.join("  ")));
    }
    for trade in &result.trades {
        lines.push(format!("  [{}] {trade}", classify_trade(trade).label()));
    }
    lines
}

/// Map one lifecycle event to output lines for text mode.
fn event_lines(ev: &SimEvent) -> Vec<OutputLine> {
    match ev {
        SimEvent::Submitted { handle } => {
            vec![OutputLine::Stderr(format!("Simulation accepted: {handle}"))]
        }
        SimEvent::Progress { fraction } => vec![OutputLine::Stderr(format!(
            "Progress: {:.0}%",
            fraction * 100.0
        ))],
        SimEvent::IntervalAdded { result } => render_interval_lines(result)
            .into_iter()
            .map(OutputLine::Stdout)
            .collect(),
        SimEvent::MarginUpdate { balance, tier } => vec![OutputLine::Stderr(format!(
            "Hedge margin: {} ({})",
            format::format_currency(*balance),
            tier.label()
        ))],
        SimEvent::RuleRetired { rule, .. } => {
            vec![OutputLine::Stderr(format!("One-shot rule retired: {rule}"))]
        }
        SimEvent::Completed { metrics } => {
            let mut lines = vec![OutputLine::Stdout(String::new())];
            lines.extend(summary::build_summary(metrics).into_iter().map(OutputLine::Stdout));
            lines
        }
        SimEvent::Failed { message } => {
            vec![OutputLine::Stderr(format!("Simulation failed: {message}"))]
        }
        SimEvent::Stopped => vec![OutputLine::Stderr("Stopped.".to_string())],
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let client = Arc::new(ApiClient::new(&args.base_url)?);
    let config = build_config(&args);
    let opts = LifecycleOptions {
        poll_interval: args.poll_interval.into(),
        ..Default::default()
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let driver = tokio::spawn(run_lifecycle(
        client.clone(),
        config,
        opts,
        event_tx,
        cmd_rx,
    ));

    // Ctrl-C maps to a stop command; the lifecycle handles the rest.
    let stop_tx = cmd_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(UiCommand::Stop);
        }
    });

    let (out_tx, out_handle) = spawn_output_writer();
    let quiet = args.json;
    let mut active_handle: Option<SimulationHandle> = None;
    let mut failure: Option<String> = None;

    while let Some(ev) = event_rx.recv().await {
        match &ev {
            SimEvent::Submitted { handle } => active_handle = Some(handle.clone()),
            SimEvent::Failed { message } => failure = Some(message.clone()),
            _ => {}
        }
        if !quiet {
            for line in event_lines(&ev) {
                let _ = out_tx.send(line);
            }
        }
    }

    let metrics = driver
        .await
        .context("lifecycle driver panicked")?
        .context("failed to start simulation")?;
    drop(cmd_tx);

    if let Some(metrics) = metrics.as_ref() {
        if args.json {
            let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(metrics)?));
        }
        if let Some(path) = args.export_json.as_deref() {
            std::fs::write(path, serde_json::to_vec_pretty(metrics)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            let _ = out_tx.send(OutputLine::Stderr(format!(
                "Exported: {}",
                path.display()
            )));
        }

        // Advisor and charts only make sense once a run has completed.
        if args.reset_chat {
            if let Err(e) = client.clear_chat().await {
                let _ = out_tx.send(OutputLine::Stderr(format!("Chat reset failed: {e:#}")));
            }
        }
        if let Some(question) = args.ask.as_deref() {
            match client.ask_advisor(question, active_handle.as_ref()).await {
                Ok(analysis) => {
                    let _ = out_tx.send(OutputLine::Stdout(String::new()));
                    let _ = out_tx.send(OutputLine::Stdout(format!("Advisor: {analysis}")));
                }
                Err(e) => {
                    let _ = out_tx.send(OutputLine::Stderr(format!("Advisor request failed: {e:#}")));
                }
            }
        }
        if let Some(plot) = args.plot {
            match client.fetch_plot(active_handle.as_ref(), plot).await {
                Ok(bytes) => {
                    std::fs::write(&args.plot_out, bytes)
                        .with_context(|| format!("failed to write {}", args.plot_out.display()))?;
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "Plot written: {}",
                        args.plot_out.display()
                    )));
                }
                Err(e) => {
                    let _ = out_tx.send(OutputLine::Stderr(format!("Plot fetch failed: {e:#}")));
                }
            }
        }
    }

    drop(out_tx);
    let _ = out_handle.await;

    if let Some(message) = failure {
        bail!(message);
    }
    Ok(())
}
