//! Market data types

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bar frequency of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// One bar per trading day
    #[default]
    Day,
    /// One bar per trading minute
    Minute,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Day => f.write_str("day"),
            Frequency::Minute => f.write_str("minute"),
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" | "1d" => Ok(Frequency::Day),
            "minute" | "1m" => Ok(Frequency::Minute),
            other => Err(format!("unknown frequency '{other}'")),
        }
    }
}

/// One OHLCV observation for a symbol. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Security code (e.g., "600000.XSHG")
    pub symbol: String,
    /// Bar timestamp (session-local). Daily bars carry midnight of their date.
    pub timestamp: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// Trading date of this bar
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Kind of corporate action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorporateActionKind {
    /// Cash dividend; `amount` is cash per share
    Dividend,
    /// Share split; `ratio` new shares per old share
    Split,
    /// Rights issue; `ratio` new shares per held share at subscription price `amount`
    Rights,
}

impl fmt::Display for CorporateActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorporateActionKind::Dividend => f.write_str("dividend"),
            CorporateActionKind::Split => f.write_str("split"),
            CorporateActionKind::Rights => f.write_str("rights"),
        }
    }
}

/// A corporate action record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporateAction {
    pub symbol: String,
    pub ex_date: NaiveDate,
    pub kind: CorporateActionKind,
    #[serde(default)]
    pub ratio: Decimal,
    #[serde(default)]
    pub amount: Decimal,
    /// Publication date of the record, used to pick between conflicting records
    #[serde(default)]
    pub published: Option<NaiveDate>,
}

impl CorporateAction {
    /// Cash dividend of `amount` per share
    pub fn dividend(symbol: impl Into<String>, ex_date: NaiveDate, amount: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            ex_date,
            kind: CorporateActionKind::Dividend,
            ratio: Decimal::ZERO,
            amount,
            published: None,
        }
    }

    /// Split turning each share into `ratio` shares
    pub fn split(symbol: impl Into<String>, ex_date: NaiveDate, ratio: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            ex_date,
            kind: CorporateActionKind::Split,
            ratio,
            amount: Decimal::ZERO,
            published: None,
        }
    }

    /// Rights issue of `ratio` shares per held share at `price`
    pub fn rights(
        symbol: impl Into<String>,
        ex_date: NaiveDate,
        ratio: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            ex_date,
            kind: CorporateActionKind::Rights,
            ratio,
            amount: price,
            published: None,
        }
    }

    /// Attach a publication date
    pub fn published_on(mut self, date: NaiveDate) -> Self {
        self.published = Some(date);
        self
    }

    /// Whether two records describe the same adjustment
    pub fn same_terms(&self, other: &CorporateAction) -> bool {
        self.ratio == other.ratio && self.amount == other.amount
    }
}

/// A live quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,
    /// Volume traded since the previous quote
    #[serde(default)]
    pub volume: Decimal,
    pub timestamp: NaiveDateTime,
}
