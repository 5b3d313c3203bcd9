//! In-memory provider
//!
//! Holds prepared series for replays, benchmarks and tests. Behaves like any
//! other source: ranges without data are `DataUnavailable`.

use super::{Bar, CorporateAction, DataProvider, Frequency};
use crate::error::{EngineError, Result};
use chrono::NaiveDate;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct MemoryProvider {
    bars: HashMap<(String, Frequency), Vec<Bar>>,
    actions: Vec<CorporateAction>,
    calendar: Option<Vec<NaiveDate>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bars at `frequency`; series are kept sorted by timestamp
    pub fn with_bars(mut self, frequency: Frequency, bars: impl IntoIterator<Item = Bar>) -> Self {
        for bar in bars {
            self.bars
                .entry((bar.symbol.clone(), frequency))
                .or_default()
                .push(bar);
        }
        for series in self.bars.values_mut() {
            series.sort_by_key(|b| b.timestamp);
        }
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = CorporateAction>) -> Self {
        self.actions.extend(actions);
        self.actions.sort_by_key(|a| a.ex_date);
        self
    }

    pub fn with_calendar(mut self, days: Vec<NaiveDate>) -> Self {
        self.calendar = Some(days);
        self
    }
}

impl DataProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        frequency: Frequency,
    ) -> Result<Vec<Bar>> {
        let series = self
            .bars
            .get(&(symbol.to_string(), frequency))
            .ok_or_else(|| EngineError::data_unavailable(symbol, "symbol not loaded"))?;
        let bars: Vec<Bar> = series
            .iter()
            .filter(|b| b.date() >= start && b.date() <= end)
            .cloned()
            .collect();
        if bars.is_empty() {
            return Err(EngineError::data_unavailable(
                symbol,
                format!("no {frequency} bars between {start} and {end}"),
            ));
        }
        Ok(bars)
    }

    fn corporate_actions(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CorporateAction>> {
        Ok(self
            .actions
            .iter()
            .filter(|a| a.symbol == symbol && a.ex_date >= start && a.ex_date <= end)
            .cloned()
            .collect())
    }

    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        match &self.calendar {
            Some(days) => Ok(days
                .iter()
                .copied()
                .filter(|d| *d >= start && *d <= end)
                .collect()),
            None => Ok(super::weekdays(start, end)),
        }
    }
}
