//! Provider over CSV files exported by the local trading terminal
//!
//! Layout under the configured directory:
//! - `<symbol>.csv`: daily bars (`date,open,high,low,close,volume`)
//! - `<symbol>.1m.csv`: minute bars (`datetime,open,high,low,close,volume`)
//! - `corporate_actions.csv`: `symbol,ex_date,kind,ratio,amount,published`
//! - `trading_days.csv` (optional): `date`

use super::{Bar, CorporateAction, CorporateActionKind, DataProvider, Frequency};
use crate::error::{EngineError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const ACTIONS_FILE: &str = "corporate_actions.csv";
const CALENDAR_FILE: &str = "trading_days.csv";

#[derive(Debug, Deserialize)]
struct BarRow {
    #[serde(alias = "date", alias = "datetime")]
    timestamp: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

#[derive(Debug, Deserialize)]
struct ActionRow {
    symbol: String,
    ex_date: NaiveDate,
    kind: CorporateActionKind,
    ratio: Option<Decimal>,
    amount: Option<Decimal>,
    published: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct CalendarRow {
    date: NaiveDate,
}

/// Reads bars and corporate actions from local CSV exports
pub struct CsvProvider {
    dir: PathBuf,
}

impl CsvProvider {
    /// Create a provider rooted at `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn bar_path(&self, symbol: &str, frequency: Frequency) -> PathBuf {
        match frequency {
            Frequency::Day => self.dir.join(format!("{symbol}.csv")),
            Frequency::Minute => self.dir.join(format!("{symbol}.1m.csv")),
        }
    }

    fn read_bars(&self, symbol: &str, path: &Path) -> Result<Vec<Bar>> {
        let mut reader = ::csv::Reader::from_path(path).map_err(|e| {
            EngineError::data_unavailable(symbol, format!("cannot open {}: {e}", path.display()))
        })?;

        let mut bars = Vec::new();
        for (line, row) in reader.deserialize::<BarRow>().enumerate() {
            let row = row.map_err(|e| {
                EngineError::data_unavailable(symbol, format!("{} row {}: {e}", path.display(), line + 1))
            })?;
            let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| {
                EngineError::data_unavailable(
                    symbol,
                    format!("{} row {}: bad timestamp '{}'", path.display(), line + 1, row.timestamp),
                )
            })?;
            bars.push(Bar {
                symbol: symbol.to_string(),
                timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }

        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM[:SS]` and the `T`-separated forms
pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl DataProvider for CsvProvider {
    fn name(&self) -> &str {
        "terminal"
    }

    fn bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        frequency: Frequency,
    ) -> Result<Vec<Bar>> {
        let path = self.bar_path(symbol, frequency);
        let bars: Vec<Bar> = self
            .read_bars(symbol, &path)?
            .into_iter()
            .filter(|b| b.date() >= start && b.date() <= end)
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
        let path = self.dir.join(ACTIONS_FILE);
        if !path.exists() {
            return Ok(vec![]);
        }

        let mut reader = ::csv::Reader::from_path(&path)
            .map_err(|e| EngineError::data_unavailable(symbol, format!("{ACTIONS_FILE}: {e}")))?;

        let mut actions = Vec::new();
        for row in reader.deserialize::<ActionRow>() {
            let row = row
                .map_err(|e| EngineError::data_unavailable(symbol, format!("{ACTIONS_FILE}: {e}")))?;
            if row.symbol != symbol || row.ex_date < start || row.ex_date > end {
                continue;
            }
            actions.push(CorporateAction {
                symbol: row.symbol,
                ex_date: row.ex_date,
                kind: row.kind,
                ratio: row.ratio.unwrap_or_default(),
                amount: row.amount.unwrap_or_default(),
                published: row.published,
            });
        }

        // Stable: equal ex-dates keep file order, which conflict resolution relies on
        actions.sort_by_key(|a| a.ex_date);
        Ok(actions)
    }

    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        let path = self.dir.join(CALENDAR_FILE);
        if !path.exists() {
            return Ok(super::weekdays(start, end));
        }

        let mut reader = ::csv::Reader::from_path(&path)
            .map_err(|e| EngineError::data_unavailable("calendar", e.to_string()))?;
        let mut days = Vec::new();
        for row in reader.deserialize::<CalendarRow>() {
            let row = row.map_err(|e| EngineError::data_unavailable("calendar", e.to_string()))?;
            if row.date >= start && row.date <= end {
                days.push(row.date);
            }
        }
        days.sort();
        days.dedup();
        Ok(days)
    }
}
