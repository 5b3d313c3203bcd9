//! Provider composition, terminal exports and run output files

mod common;

use bullet_engine::config::{Config, DataSource};
use bullet_engine::data::{build_provider, CachedProvider, DataProvider, Frequency};
use bullet_engine::engine::{start_backtest, RunState};
use bullet_engine::strategy::StrategyModule;
use bullet_engine::ErrorKind;
use common::*;
use rust_decimal_macros::dec;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write_exports(dir: &Path) {
    fs::write(
        dir.join("X.csv"),
        "date,open,high,low,close,volume\n\
         2024-01-02,10,10,10,10,500000\n\
         2024-01-03,10,10,10,10,500000\n\
         2024-01-04,10,10,10,10,500000\n\
         2024-01-05,10,10,10,10,500000\n",
    )
    .unwrap();
    fs::write(
        dir.join("corporate_actions.csv"),
        "symbol,ex_date,kind,ratio,amount,published\n\
         X,2024-01-04,dividend,,0.5,2023-12-01\n\
         X,2024-01-04,dividend,,0.6,2023-12-15\n",
    )
    .unwrap();
}

fn buy_once() -> StrategyModule {
    StrategyModule::new("buy_once", |ctx| {
        ctx.run_daily(
            |c| {
                if c.portfolio().quantity("X") == 0 && c.open_orders().is_empty() {
                    c.order("X", 100)?;
                }
                Ok(())
            },
            "open",
        )?;
        Ok(())
    })
}

#[tokio::test]
async fn test_terminal_exports_drive_a_run() {
    let data = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    write_exports(data.path());

    let mut config = config(4, &["X"]);
    config.run.data_source = DataSource::Terminal;
    config.run.result_dir = Some(results.path().to_path_buf());
    config.data.csv_dir = data.path().to_path_buf();

    let provider = build_provider(&config).unwrap();
    assert_eq!(provider.name(), "cache");

    let handle = start_backtest(config, buy_once(), provider, None).unwrap();
    let run_dir = handle.run_dir().unwrap().to_path_buf();
    assert!(run_dir.starts_with(results.path()));
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, RunState::Finished);
    // Later publication wins: 100 shares x 0.6
    assert_eq!(report.final_snapshot().unwrap().cash, dec!(99060));
    assert!(report
        .events
        .iter()
        .any(|e| e.kind == ErrorKind::CorporateActionConflict.to_string()));

    for file in ["orders.json", "events.json", "fills.parquet", "equity.parquet"] {
        assert!(run_dir.join(file).is_file(), "{file} missing");
    }
    let orders: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("orders.json")).unwrap()).unwrap();
    assert_eq!(orders.as_array().unwrap().len(), 1);
}

#[test]
fn test_cache_serves_repeat_ranges() {
    let data = TempDir::new().unwrap();
    write_exports(data.path());
    let mut config = config(4, &["X"]);
    config.run.data_source = DataSource::Terminal;
    config.data.csv_dir = data.path().to_path_buf();
    config.data.cache_enabled = false;

    let base = build_provider(&config).unwrap();
    assert_eq!(base.name(), "terminal");
    let cached = CachedProvider::new(base);

    let first = cached.bars("X", date(2), date(5), Frequency::Day).unwrap();
    // Rewriting the export is invisible until a refresh
    fs::write(data.path().join("X.csv"), "date,open,high,low,close,volume\n2024-01-02,1,1,1,1,1\n").unwrap();
    let second = cached.bars("X", date(2), date(5), Frequency::Day).unwrap();
    assert_eq!(first, second);
    assert_eq!(cached.stats().hits, 1);
    assert_eq!(cached.stats().misses, 1);

    cached.refresh("X");
    let third = cached.bars("X", date(2), date(5), Frequency::Day).unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(cached.stats().misses, 2);
}

#[test]
fn test_uncovered_symbol_is_unavailable() {
    let data = TempDir::new().unwrap();
    write_exports(data.path());
    let mut config = config(4, &["X"]);
    config.run.data_source = DataSource::Terminal;
    config.data.csv_dir = data.path().to_path_buf();

    let provider = build_provider(&config).unwrap();
    let err = provider.bars("ZZZ", date(2), date(5), Frequency::Day).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataUnavailable);
    let err = provider.bars("X", date(20), date(25), Frequency::Day).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataUnavailable);
}

#[test]
fn test_config_example_parses() {
    let config: Config = toml::from_str(include_str!("../../config.toml.example")).unwrap();
    config.validate().unwrap();
    assert_eq!(config.run.data_source, DataSource::Terminal);
    assert_eq!(config.run.strategy.as_deref(), Some("ma_cross"));
    assert_eq!(config.cost.min_commission, dec!(5));
    assert_eq!(config.params["long"], serde_json::json!(20));
}
