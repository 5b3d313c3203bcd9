//! Backtest command implementation

use super::{builtin_registry, RunSummary};
use crate::config::Config;
use crate::data::build_provider;
use crate::engine::{start_backtest, RunState};
use chrono::NaiveDate;
use clap::Args;
use rust_decimal::Decimal;

#[derive(Args, Debug)]
pub struct BacktestArgs {
    /// Bundled strategy to run (defaults to run.strategy)
    #[arg(short, long)]
    pub strategy: Option<String>,

    /// First session date (YYYY-MM-DD)
    #[arg(long)]
    pub start: Option<NaiveDate>,

    /// Last session date (YYYY-MM-DD)
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Initial capital
    #[arg(long)]
    pub capital: Option<Decimal>,

    /// Fixed run id, for comparable replays
    #[arg(long)]
    pub run_id: Option<String>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl BacktestArgs {
    /// Fold the command-line overrides into `config`
    fn apply(&self, config: &mut Config) -> anyhow::Result<String> {
        if let Some(start) = self.start {
            config.run.start_date = start;
        }
        if let Some(end) = self.end {
            config.run.end_date = end;
        }
        if let Some(capital) = self.capital {
            config.run.initial_cash = capital;
        }
        if let Some(name) = &self.strategy {
            config.run.strategy = Some(name.clone());
        }
        config.validate()?;

        config
            .run
            .strategy
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no strategy given; pass --strategy or set run.strategy"))
    }

    pub async fn execute(&self, mut config: Config) -> anyhow::Result<()> {
        let name = self.apply(&mut config)?;
        let initial_cash = config.run.initial_cash;
        let module = builtin_registry()?.create(&name)?;
        let provider = build_provider(&config)?;

        tracing::info!(
            strategy = %name,
            start = %config.run.start_date,
            end = %config.run.end_date,
            "Running backtest"
        );
        let handle = start_backtest(config, module, provider, self.run_id.clone())?;
        let report = handle.wait().await?;

        RunSummary::from_report(&report, initial_cash).print(self.json)?;
        if report.state != RunState::Finished {
            anyhow::bail!(
                "backtest {} ended {}: {}",
                report.run_id,
                report.state,
                report.fault.as_deref().unwrap_or("no fault recorded")
            );
        }
        Ok(())
    }
}
