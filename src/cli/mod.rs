//! CLI interface for bullet-engine
//!
//! Provides subcommands for:
//! - `backtest`: Replay a bundled strategy over historical data
//! - `live`: Trade a bundled strategy against the configured venue
//! - `strategies`: List bundled strategies
//! - `config`: Validate and show configuration

mod backtest;
mod live;
mod strategies;

pub use backtest::BacktestArgs;
pub use live::LiveArgs;
pub use strategies::{builtin_registry, buy_and_hold, ma_cross};

use crate::engine::RunReport;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bullet-engine")]
#[command(about = "Strategy execution engine for backtesting and live trading of equities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a strategy over the configured window
    Backtest(BacktestArgs),
    /// Run a strategy against the configured broker
    Live(LiveArgs),
    /// List bundled strategies
    Strategies,
    /// Validate and show configuration
    Config,
}

/// Headline numbers of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub state: String,
    pub periods: usize,
    pub orders: usize,
    pub fills: usize,
    pub initial_cash: Decimal,
    pub final_value: Decimal,
    pub total_return: Decimal,
    pub benchmark_return: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub total_commission: Decimal,
    pub run_dir: Option<PathBuf>,
    pub fault: Option<String>,
}

impl RunSummary {
    pub fn from_report(report: &RunReport, initial_cash: Decimal) -> Self {
        let last = report.final_snapshot();
        let final_value = last.map_or(initial_cash, |s| s.total_value);
        let total_return = if initial_cash.is_zero() {
            Decimal::ZERO
        } else {
            ((final_value - initial_cash) / initial_cash).round_dp(6)
        };
        let benchmark_return = match (report.benchmark.first(), report.benchmark.last()) {
            (Some(first), Some(last)) if !first.close.is_zero() => {
                Some((last.close / first.close - Decimal::ONE).round_dp(6))
            }
            _ => None,
        };

        Self {
            run_id: report.run_id.clone(),
            state: report.state.to_string(),
            periods: report.snapshots.len(),
            orders: report.orders.len(),
            fills: report.fills.len(),
            initial_cash,
            final_value,
            total_return,
            benchmark_return,
            realized_pnl: last.map_or(Decimal::ZERO, |s| s.realized_pnl),
            total_commission: last.map_or(Decimal::ZERO, |s| s.total_commission),
            run_dir: report.run_dir.clone(),
            fault: report.fault.clone(),
        }
    }

    /// Print as a two-column table, or JSON when `json` is set
    pub fn print(&self, json: bool) -> anyhow::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }
        println!("Run {}", self.run_id);
        println!("  State:            {}", self.state);
        println!("  Periods:          {}", self.periods);
        println!("  Orders / fills:   {} / {}", self.orders, self.fills);
        println!("  Initial cash:     {}", self.initial_cash);
        println!("  Final value:      {}", self.final_value);
        println!("  Total return:     {}%", (self.total_return * Decimal::ONE_HUNDRED).round_dp(2));
        if let Some(b) = self.benchmark_return {
            println!("  Benchmark return: {}%", (b * Decimal::ONE_HUNDRED).round_dp(2));
        }
        println!("  Realized P&L:     {}", self.realized_pnl);
        println!("  Commission:       {}", self.total_commission);
        if let Some(dir) = &self.run_dir {
            println!("  Results:          {}", dir.display());
        }
        if let Some(fault) = &self.fault {
            println!("  Fault:            {fault}");
        }
        Ok(())
    }
}
