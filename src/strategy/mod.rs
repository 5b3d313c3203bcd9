//! Strategy module
//!
//! The callback contract strategies implement and the context API they call.
//! A strategy is registered as a set of callbacks; it reaches the engine only
//! through `StrategyContext`.

mod context;
mod globals;
mod registry;
mod schedule;

pub use context::StrategyContext;
pub(crate) use context::ContextParts;
pub use globals::Globals;
pub use registry::{StrategyFactory, StrategyRegistry};
pub use schedule::{Schedule, ScheduledTask, TaskTime};

use crate::data::Bar;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle or scheduled callback
pub type Callback = Arc<dyn Fn(&mut StrategyContext) -> anyhow::Result<()> + Send + Sync>;

/// `handle_data` callback
pub type DataCallback =
    Arc<dyn Fn(&mut StrategyContext, &BarData) -> anyhow::Result<()> + Send + Sync>;

/// Bars revealed at one tick, keyed by symbol
#[derive(Debug, Clone, PartialEq)]
pub struct BarData {
    pub timestamp: NaiveDateTime,
    pub bars: BTreeMap<String, Bar>,
}

impl BarData {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            bars: BTreeMap::new(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Bar> {
        self.bars.get(symbol)
    }

    /// Close of `symbol` at this tick
    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.bars.get(symbol).map(|b| b.close)
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

/// One strategy's callbacks. `initialize` is required.
#[derive(Clone)]
pub struct StrategyModule {
    name: String,
    pub(crate) initialize: Callback,
    pub(crate) before_trading_start: Option<Callback>,
    pub(crate) handle_data: Option<DataCallback>,
    pub(crate) after_trading_close: Option<Callback>,
    pub(crate) process_initialize: Option<Callback>,
}

impl fmt::Debug for StrategyModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyModule")
            .field("name", &self.name)
            .field("before_trading_start", &self.before_trading_start.is_some())
            .field("handle_data", &self.handle_data.is_some())
            .field("after_trading_close", &self.after_trading_close.is_some())
            .field("process_initialize", &self.process_initialize.is_some())
            .finish()
    }
}

impl StrategyModule {
    pub fn new(
        name: impl Into<String>,
        initialize: impl Fn(&mut StrategyContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            initialize: Arc::new(initialize),
            before_trading_start: None,
            handle_data: None,
            after_trading_close: None,
            process_initialize: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn before_trading_start(
        mut self,
        f: impl Fn(&mut StrategyContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.before_trading_start = Some(Arc::new(f));
        self
    }

    pub fn handle_data(
        mut self,
        f: impl Fn(&mut StrategyContext, &BarData) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.handle_data = Some(Arc::new(f));
        self
    }

    pub fn after_trading_close(
        mut self,
        f: impl Fn(&mut StrategyContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.after_trading_close = Some(Arc::new(f));
        self
    }

    /// Runs once after `initialize` in live runs only
    pub fn process_initialize(
        mut self,
        f: impl Fn(&mut StrategyContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.process_initialize = Some(Arc::new(f));
        self
    }
}
