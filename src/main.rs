use bullet_engine::cli::{builtin_registry, Cli, Commands};
use bullet_engine::config::Config;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Strategies = cli.command {
        for name in builtin_registry()?.names() {
            println!("{name}");
        }
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&cli.config)
        .map_err(|e| anyhow::anyhow!("could not load config from {}: {e}", cli.config))?;

    // Initialize telemetry
    let _telemetry = bullet_engine::telemetry::init_telemetry(&config.telemetry)?;

    match cli.command {
        Commands::Backtest(args) => {
            tracing::info!("Starting backtest");
            args.execute(config).await?;
        }
        Commands::Live(args) => {
            tracing::info!("Starting live trading");
            args.execute(config).await?;
        }
        Commands::Strategies => {}
        Commands::Config => {
            println!("Current configuration:");
            println!(
                "  Run: {} .. {}, cash {}, {:?} bars from {:?}",
                config.run.start_date,
                config.run.end_date,
                config.run.initial_cash,
                config.run.frequency,
                config.run.data_source
            );
            println!("  Universe: {}", config.run.universe.join(", "));
            if let Some(benchmark) = &config.run.benchmark {
                println!("  Benchmark: {benchmark}");
            }
            if let Some(strategy) = &config.run.strategy {
                println!("  Strategy: {strategy}");
            }
            println!(
                "  Session: {} / {} - {} / {}",
                config.session.before_open,
                config.session.open,
                config.session.close,
                config.session.after_close
            );
            println!(
                "  Cost: open {} close {} tax {} min {} slippage {}",
                config.cost.open_commission,
                config.cost.close_commission,
                config.cost.close_tax,
                config.cost.min_commission,
                config.cost.slippage
            );
            println!("  Broker: {:?}", config.broker.kind);
        }
    }

    Ok(())
}
