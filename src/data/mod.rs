//! Market data module
//!
//! Historical bars, corporate actions and benchmark series behind one
//! provider interface, with interchangeable backing sources and a range
//! cache layered on top.

mod cache;
mod corporate;
mod http;
mod local;
mod memory;
mod types;

pub use cache::{CacheStats, CachedProvider};
pub use corporate::{resolve_conflicts, ActionConflict};
pub use http::HttpProvider;
pub use local::CsvProvider;
pub use memory::MemoryProvider;
pub use types::{Bar, CorporateAction, CorporateActionKind, Frequency, Quote};

use crate::config::{Config, Credentials, DataSource, VendorConfig};
use crate::error::{EngineError, Result};
use chrono::{Datelike, NaiveDate, Weekday};
use std::sync::Arc;

/// Source of historical market data.
///
/// All calls are pure reads. Implementations fail with
/// `EngineError::DataUnavailable` when a symbol or range has no data instead
/// of returning an empty series.
pub trait DataProvider: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Bars for `symbol` with dates in `[start, end]`, ascending by timestamp
    fn bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        frequency: Frequency,
    ) -> Result<Vec<Bar>>;

    /// Corporate actions for `symbol` with ex-dates in `[start, end]`, ascending
    fn corporate_actions(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CorporateAction>>;

    /// Daily bars of a benchmark index
    fn benchmark(&self, code: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        self.bars(code, start, end, Frequency::Day)
    }

    /// Trading calendar. Defaults to weekdays.
    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        Ok(weekdays(start, end))
    }
}

/// Weekdays in `[start, end]`
pub fn weekdays(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .collect()
}

/// Build the configured provider, wrapped in the cache layer when enabled
pub fn build_provider(config: &Config) -> Result<Arc<dyn DataProvider>> {
    let base: Arc<dyn DataProvider> = match config.run.data_source {
        DataSource::Terminal => Arc::new(CsvProvider::new(&config.data.csv_dir)),
        DataSource::Primary => vendor(config.data.primary.as_ref(), "primary")?,
        DataSource::Alternate => vendor(config.data.alternate.as_ref(), "alternate")?,
    };

    tracing::info!(
        provider = base.name(),
        cache = config.data.cache_enabled,
        "Data provider configured"
    );

    if config.data.cache_enabled {
        Ok(Arc::new(CachedProvider::new(base)))
    } else {
        Ok(base)
    }
}

fn vendor(section: Option<&VendorConfig>, label: &str) -> Result<Arc<dyn DataProvider>> {
    let section = section.ok_or_else(|| {
        EngineError::InvalidConfig(format!("data source '{label}' selected but [data.{label}] missing"))
    })?;
    let credentials = match &section.token_env {
        Some(var) => Some(Credentials::from_env(var)?),
        None => None,
    };
    Ok(Arc::new(HttpProvider::new(label, section, credentials)))
}
