//! Strategies bundled with the command-line host

use crate::data::Bar;
use crate::error::Result;
use crate::strategy::{StrategyContext, StrategyModule, StrategyRegistry};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Registry holding every bundled strategy
pub fn builtin_registry() -> Result<StrategyRegistry> {
    let mut registry = StrategyRegistry::new();
    registry.register("buy_and_hold", buy_and_hold)?;
    registry.register("ma_cross", ma_cross)?;
    Ok(registry)
}

/// Put most of the cash into the first universe symbol at the first open
/// with a known price, then hold.
pub fn buy_and_hold() -> StrategyModule {
    StrategyModule::new("buy_and_hold", |ctx| {
        ctx.g.set("invest_ratio", dec!(0.98))?;
        ctx.run_daily_named("enter", enter, "open")?;
        Ok(())
    })
}

fn enter(ctx: &mut StrategyContext) -> anyhow::Result<()> {
    let Some(symbol) = ctx.universe().first().cloned() else {
        return Ok(());
    };
    if ctx.portfolio().quantity(&symbol) != 0 || !ctx.open_orders().is_empty() {
        return Ok(());
    }
    if ctx.current_price(&symbol).is_none() {
        return Ok(());
    }
    let ratio: Decimal = ctx.g.get_or("invest_ratio", dec!(0.98));
    ctx.order_value(&symbol, ctx.portfolio().cash * ratio)?;
    Ok(())
}

/// Moving-average crossover over the universe.
///
/// Goes long a symbol when its `short`-bar mean closes above the `long`-bar
/// mean and exits when it crosses back. `invest_ratio` of equity is split
/// evenly across the symbols with a bar.
pub fn ma_cross() -> StrategyModule {
    StrategyModule::new("ma_cross", |ctx| {
        ctx.g.set("short", 5)?;
        ctx.g.set("long", 20)?;
        ctx.g.set("invest_ratio", dec!(0.95))?;
        Ok(())
    })
    .handle_data(|ctx, data| {
        let short: usize = ctx.g.get_or("short", 5);
        let long: usize = ctx.g.get_or("long", 20);
        if short == 0 || short >= long {
            anyhow::bail!("ma_cross needs 0 < short < long, got {short} and {long}");
        }

        let symbols: Vec<String> = data.bars.keys().cloned().collect();
        if symbols.is_empty() {
            return Ok(());
        }
        let ratio: Decimal = ctx.g.get_or("invest_ratio", dec!(0.95));
        let budget = ctx.portfolio().total_value * ratio / Decimal::from(symbols.len());

        for symbol in symbols {
            // Short history is already on the event stream
            let Ok(bars) = ctx.history(&symbol, long) else {
                continue;
            };
            if bars.len() < long {
                continue;
            }
            let long_ma = mean(&bars);
            let short_ma = mean(&bars[long - short..]);
            let held = ctx.portfolio().quantity(&symbol);

            let placed = if short_ma > long_ma && held == 0 {
                ctx.order_target_value(&symbol, budget)
            } else if short_ma < long_ma && held > 0 {
                ctx.order_target(&symbol, 0)
            } else {
                continue;
            };
            if let Err(e) = placed {
                tracing::debug!(%symbol, error = %e, "Crossover order not placed");
            }
        }
        Ok(())
    })
}

fn mean(bars: &[Bar]) -> Decimal {
    let sum: Decimal = bars.iter().map(|b| b.close).sum();
    sum / Decimal::from(bars.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CostConfig, RunConfig};
    use crate::data::{DataProvider, Frequency, MemoryProvider};
    use crate::engine::{BacktestEngine, RunState};
    use chrono::{Duration, NaiveDate};
    use std::sync::Arc;

    fn series(prices: &[i64]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let price = Decimal::from(*p);
                Bar {
                    symbol: "X".into(),
                    timestamp: (start + Duration::days(i as i64)).and_hms_opt(0, 0, 0).unwrap(),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: dec!(1000000),
                }
            })
            .collect()
    }

    fn run(module: StrategyModule, prices: &[i64], params: &[(&str, i64)]) -> crate::engine::RunReport {
        let bars = series(prices);
        let start = bars[0].date();
        let end = bars[bars.len() - 1].date();
        let provider: Arc<dyn DataProvider> =
            Arc::new(MemoryProvider::new().with_bars(Frequency::Day, bars));

        let mut run = RunConfig::new(start, end);
        run.universe = vec!["X".into()];
        let mut config = Config::new(run);
        config.cost = CostConfig::free();
        for (k, v) in params {
            config.params.insert(k.to_string(), serde_json::json!(v));
        }
        BacktestEngine::new(config, module, provider)
            .unwrap()
            .run()
            .unwrap()
    }

    #[test]
    fn test_registry_lists_bundled() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.names(), vec!["buy_and_hold", "ma_cross"]);
    }

    #[test]
    fn test_buy_and_hold_enters_once() {
        let report = run(buy_and_hold(), &[10, 10, 11, 12], &[]);
        assert_eq!(report.state, RunState::Finished);
        assert_eq!(report.fills.len(), 1);
        // No price on the first open; enters at the second
        assert_eq!(report.fills[0].price, dec!(10));
        assert_eq!(report.fills[0].quantity, 9800);
    }

    #[test]
    fn test_ma_cross_buys_uptrend_and_exits() {
        let prices = [100, 100, 100, 102, 104, 106, 104, 100, 96, 94];
        let report = run(ma_cross(), &prices, &[("short", 2), ("long", 3)]);
        assert_eq!(report.state, RunState::Finished);
        assert!(report.fills.iter().any(|f| f.quantity > 0));
        assert!(report.fills.iter().any(|f| f.quantity < 0));
        assert_eq!(report.final_snapshot().unwrap().quantity("X"), 0);
    }

    #[test]
    fn test_ma_cross_bad_windows_abort() {
        let report = run(ma_cross(), &[10, 11, 12], &[("short", 3), ("long", 3)]);
        assert_eq!(report.state, RunState::Aborted);
    }
}
