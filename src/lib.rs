//! bullet-engine: strategy execution engine for equities
//!
//! This library provides the core components for:
//! - A clock-driven strategy scheduler shared by backtest and live runs
//! - Data providers (local exports, remote vendors) behind a caching layer
//! - Deterministic order matching against historical bars
//! - A live broker adapter with reconnection and reconciliation
//! - An account ledger with corporate-action handling
//! - Run handles, event streams and Parquet result output
//! - Structured logging and Prometheus metrics

pub mod cli;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod execution;
pub mod feed;
pub mod ledger;
pub mod strategy;
pub mod telemetry;
pub mod ws;

pub use error::{EngineError, ErrorKind, Result};
