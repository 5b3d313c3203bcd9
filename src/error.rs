//! Engine error types
//!
//! Every failure the engine reports falls into one of the kinds below. The
//! first four are handled locally (logged to the run's event stream, run
//! continues); a strategy runtime fault aborts the run.

use crate::execution::{OrderId, RejectReason};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by engine components
#[derive(Debug, Error)]
pub enum EngineError {
    /// Requested market data is missing or out of coverage
    #[error("data unavailable for {symbol}: {detail}")]
    DataUnavailable { symbol: String, detail: String },

    /// An order was refused before or during matching
    #[error("order rejected for {symbol}: {reason}")]
    OrderRejected { symbol: String, reason: RejectReason },

    /// The live venue is unreachable; callers may retry
    #[error("broker connection error: {0}")]
    BrokerConnection(String),

    /// Contradictory adjustment records for one symbol and date
    #[error("corporate action conflict for {symbol} on {ex_date}: {detail}")]
    CorporateActionConflict {
        symbol: String,
        ex_date: NaiveDate,
        detail: String,
    },

    /// Uncaught fault inside a strategy callback
    #[error("strategy error in {callback} at {timestamp}: {message}")]
    StrategyRuntime {
        callback: String,
        timestamp: NaiveDateTime,
        message: String,
    },

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A state machine refused a transition
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Order id not known to the broker
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure writing run results
    #[error("result output error: {0}")]
    Results(String),
}

/// Coarse classification used in event streams and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DataUnavailable,
    OrderRejected,
    BrokerConnection,
    CorporateActionConflict,
    StrategyRuntime,
    InvalidConfig,
    InvalidTransition,
    UnknownOrder,
    Io,
    Serialization,
    Results,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::DataUnavailable => "data_unavailable",
            ErrorKind::OrderRejected => "order_rejected",
            ErrorKind::BrokerConnection => "broker_connection",
            ErrorKind::CorporateActionConflict => "corporate_action_conflict",
            ErrorKind::StrategyRuntime => "strategy_runtime",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::UnknownOrder => "unknown_order",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Results => "results",
        };
        f.write_str(s)
    }
}

impl EngineError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DataUnavailable { .. } => ErrorKind::DataUnavailable,
            EngineError::OrderRejected { .. } => ErrorKind::OrderRejected,
            EngineError::BrokerConnection(_) => ErrorKind::BrokerConnection,
            EngineError::CorporateActionConflict { .. } => ErrorKind::CorporateActionConflict,
            EngineError::StrategyRuntime { .. } => ErrorKind::StrategyRuntime,
            EngineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::UnknownOrder(_) => ErrorKind::UnknownOrder,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Serialization(_) => ErrorKind::Serialization,
            EngineError::Results(_) => ErrorKind::Results,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::BrokerConnection(_))
    }

    /// Whether a run may continue after this error surfaced from a callback
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::DataUnavailable { .. }
                | EngineError::OrderRejected { .. }
                | EngineError::BrokerConnection(_)
                | EngineError::CorporateActionConflict { .. }
        )
    }

    pub(crate) fn data_unavailable(symbol: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::DataUnavailable {
            symbol: symbol.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn rejected(symbol: impl Into<String>, reason: RejectReason) -> Self {
        EngineError::OrderRejected {
            symbol: symbol.into(),
            reason,
        }
    }
}

impl From<parquet::errors::ParquetError> for EngineError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        EngineError::Results(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for EngineError {
    fn from(err: arrow::error::ArrowError) -> Self {
        EngineError::Results(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(EngineError::data_unavailable("600000.XSHG", "no bars").is_recoverable());
        assert!(EngineError::rejected("600000.XSHG", RejectReason::NoMarketData).is_recoverable());
        assert!(EngineError::BrokerConnection("down".into()).is_recoverable());

        let fault = EngineError::StrategyRuntime {
            callback: "handle_data".into(),
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(15, 0, 0)
                .unwrap(),
            message: "boom".into(),
        };
        assert!(!fault.is_recoverable());
        assert_eq!(fault.kind(), ErrorKind::StrategyRuntime);
    }

    #[test]
    fn test_only_broker_connection_is_retryable() {
        assert!(EngineError::BrokerConnection("timeout".into()).is_retryable());
        assert!(!EngineError::data_unavailable("X", "gap").is_retryable());
        assert!(!EngineError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::rejected(
            "000001.XSHE",
            RejectReason::InsufficientPosition {
                requested: 200,
                available: 100,
            },
        );
        assert_eq!(
            err.to_string(),
            "order rejected for 000001.XSHE: insufficient position: requested 200, available 100"
        );
        assert_eq!(ErrorKind::OrderRejected.to_string(), "order_rejected");
    }

    #[test]
    fn test_anyhow_downcast_roundtrip() {
        let err: anyhow::Error = EngineError::data_unavailable("X", "missing").into();
        let inner = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(inner.kind(), ErrorKind::DataUnavailable);
    }
}
