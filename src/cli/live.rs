//! Live trading command implementation

use super::{builtin_registry, RunSummary};
use crate::config::Config;
use crate::data::build_provider;
use crate::engine::{start_live, LiveSetup, RunState};
use crate::execution::build_venue;
use crate::feed::WsQuoteFeed;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct LiveArgs {
    /// Bundled strategy to run (defaults to run.strategy)
    #[arg(short, long)]
    pub strategy: Option<String>,

    /// Market data WebSocket endpoint
    #[arg(long)]
    pub quotes_url: String,

    /// Fixed run id
    #[arg(long)]
    pub run_id: Option<String>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl LiveArgs {
    pub async fn execute(&self, config: Config) -> anyhow::Result<()> {
        let name = self
            .strategy
            .clone()
            .or_else(|| config.run.strategy.clone())
            .ok_or_else(|| anyhow::anyhow!("no strategy given; pass --strategy or set run.strategy"))?;
        let initial_cash = config.run.initial_cash;

        let module = builtin_registry()?.create(&name)?;
        let provider = build_provider(&config)?;
        let venue = build_venue(&config.broker, initial_cash, config.cost.order_cost())?;
        let feed = WsQuoteFeed::new(self.quotes_url.clone(), config.run.universe.clone())
            .with_backoff(config.broker.initial_backoff(), config.broker.max_backoff());

        tracing::info!(strategy = %name, venue = venue.name(), "Starting live run");
        let mut setup = LiveSetup::new(config, module, provider, venue, Arc::new(feed));
        if let Some(id) = &self.run_id {
            setup = setup.run_id(id.clone());
        }
        let handle = start_live(setup).await?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received shutdown signal");
                    handle.cancel();
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if handle.is_finished() {
                        break;
                    }
                }
            }
        }

        let report = handle.wait().await?;
        RunSummary::from_report(&report, initial_cash).print(self.json)?;
        if report.state == RunState::Aborted {
            anyhow::bail!(
                "live run {} aborted: {}",
                report.run_id,
                report.fault.as_deref().unwrap_or("no fault recorded")
            );
        }
        Ok(())
    }
}
