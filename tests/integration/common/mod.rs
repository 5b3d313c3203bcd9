//! Shared fixtures for integration tests
#![allow(dead_code)]

use bullet_engine::config::{Config, CostConfig, RunConfig};
use bullet_engine::data::{Bar, DataProvider, Frequency, MemoryProvider};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

pub fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

pub fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
    date(d).and_hms_opt(h, m, 0).unwrap()
}

/// Weekday sessions of January 2024 starting on the 2nd
pub fn sessions(n: usize) -> Vec<NaiveDate> {
    bullet_engine::data::weekdays(date(2), date(31))
        .into_iter()
        .take(n)
        .collect()
}

pub fn bar(symbol: &str, timestamp: NaiveDateTime, open: Decimal, low: Decimal, high: Decimal, close: Decimal) -> Bar {
    Bar {
        symbol: symbol.into(),
        timestamp,
        open,
        high,
        low,
        close,
        volume: dec!(1000000),
    }
}

/// Daily bars at a constant price per session
pub fn flat_days(symbol: &str, prices: &[Decimal]) -> Vec<Bar> {
    sessions(prices.len())
        .into_iter()
        .zip(prices)
        .map(|(d, p)| bar(symbol, d.and_hms_opt(0, 0, 0).unwrap(), *p, *p, *p, *p))
        .collect()
}

pub fn daily_provider(bars: Vec<Bar>) -> Arc<MemoryProvider> {
    Arc::new(MemoryProvider::new().with_bars(Frequency::Day, bars))
}

pub fn as_dyn(provider: Arc<MemoryProvider>) -> Arc<dyn DataProvider> {
    provider
}

/// Commission-free config over the first `days` sessions
pub fn config(days: usize, universe: &[&str]) -> Config {
    let window = sessions(days);
    let mut run = RunConfig::new(window[0], window[window.len() - 1]);
    run.universe = universe.iter().map(|s| s.to_string()).collect();
    let mut config = Config::new(run);
    config.cost = CostConfig::free();
    config
}
