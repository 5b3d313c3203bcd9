//! Backtest runs end to end through `start_backtest`

mod common;

use bullet_engine::config::CostConfig;
use bullet_engine::data::{CorporateAction, Frequency, MemoryProvider};
use bullet_engine::engine::{start_backtest, BacktestEngine, RunState, Severity};
use bullet_engine::strategy::StrategyModule;
use bullet_engine::ErrorKind;
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};

/// Buys `qty` of X at the open of the first session
fn buy_once(qty: i64) -> StrategyModule {
    StrategyModule::new("buy_once", move |ctx| {
        ctx.run_daily(
            move |c| {
                if c.portfolio().quantity("X") == 0 && c.open_orders().is_empty() {
                    c.order("X", qty)?;
                }
                Ok(())
            },
            "open",
        )?;
        Ok(())
    })
}

#[tokio::test]
async fn test_buy_at_open_settles_same_day() {
    let provider = daily_provider(flat_days("X", &[dec!(10); 4]));
    let handle = start_backtest(config(4, &["X"]), buy_once(100), as_dyn(provider), None).unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, RunState::Finished);
    let day1 = &report.snapshots[0];
    assert_eq!(day1.cash, dec!(99000));
    let position = day1.position("X").unwrap();
    assert_eq!(position.quantity, 100);
    assert_eq!(position.avg_cost, dec!(10));
    assert_eq!(report.fills[0].timestamp, at(2, 9, 30));
}

#[tokio::test]
async fn test_split_doubles_quantity_and_halves_cost() {
    let days = sessions(6);
    let prices = [dec!(10), dec!(10), dec!(10), dec!(10), dec!(5), dec!(5)];
    // Ex-date on the fifth session
    let split = CorporateAction::split("X", days[4], dec!(2));
    let provider = Arc::new(
        MemoryProvider::new()
            .with_bars(Frequency::Day, flat_days("X", &prices))
            .with_actions([split]),
    );

    let report = BacktestEngine::new(config(6, &["X"]), buy_once(100), as_dyn(provider))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.state, RunState::Finished);
    let before = &report.snapshots[3];
    let after = &report.snapshots[4];
    assert_eq!(before.quantity("X"), 100);
    assert_eq!(after.quantity("X"), 200);
    assert_eq!(after.position("X").unwrap().avg_cost, dec!(5));
    assert_eq!(before.positions_value, after.positions_value);
    assert_eq!(after.total_value, dec!(100000));
}

#[tokio::test]
async fn test_limit_buy_fills_at_limit_once_low_crosses() {
    let days = sessions(4);
    let lows = [dec!(9.5), dec!(9.2), dec!(8.8), dec!(8.5)];
    let bars = days
        .iter()
        .zip(lows)
        .map(|(d, low)| bar("X", d.and_hms_opt(0, 0, 0).unwrap(), dec!(10), low, dec!(10.5), dec!(10)))
        .collect();
    let module = StrategyModule::new("limit", |ctx| {
        ctx.run_daily(
            |c| {
                if c.portfolio().quantity("X") == 0 && c.open_orders().is_empty() {
                    c.order_limit("X", 100, dec!(9))?;
                }
                Ok(())
            },
            "open",
        )?;
        Ok(())
    });

    let report = BacktestEngine::new(config(4, &["X"]), module, as_dyn(daily_provider(bars)))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.orders.len(), 1);
    assert_eq!(report.fills.len(), 1);
    let fill = &report.fills[0];
    assert_eq!(fill.price, dec!(9));
    assert_eq!(fill.timestamp.date(), days[2]);
    assert_eq!(report.final_snapshot().unwrap().cash, dec!(99100));
}

#[tokio::test]
async fn test_oversell_rejected_position_unchanged() {
    let outcome = Arc::new(Mutex::new(None));
    let seen = outcome.clone();
    let module = StrategyModule::new("oversell", |ctx| {
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
    .after_trading_close(move |c| {
        if c.portfolio().quantity("X") == 100 {
            let result = c.order("X", -150);
            let mut slot = seen.lock().unwrap();
            if slot.is_none() {
                *slot = Some(result.map_err(|e| e.kind()));
            }
        }
        Ok(())
    });

    let report = BacktestEngine::new(config(3, &["X"]), module, as_dyn(daily_provider(flat_days("X", &[dec!(10); 3]))))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.state, RunState::Finished);
    let outcome = outcome.lock().unwrap().clone().unwrap();
    assert!(matches!(outcome, Err(ErrorKind::OrderRejected)));
    assert_eq!(report.final_snapshot().unwrap().quantity("X"), 100);
    assert!(report.fills.iter().all(|f| f.quantity > 0));
}

#[tokio::test]
async fn test_cash_and_quantity_follow_fills() {
    let plan = [100i64, -40, 250, -110, 30, -200, 0, 75];
    let prices = [dec!(10), dec!(10.4), dec!(9.8), dec!(11.2), dec!(12), dec!(11.5), dec!(11), dec!(10.7)];

    let module = StrategyModule::new("churn", move |ctx| {
        ctx.run_daily(
            move |c| {
                let day = c.g.get_or::<usize>("day", 0);
                c.g.set("day", day + 1)?;
                if let Some(qty) = plan.get(day) {
                    c.order("X", *qty)?;
                }
                Ok(())
            },
            "open",
        )?;
        Ok(())
    });

    let mut config = config(prices.len(), &["X"]);
    config.cost = CostConfig::default();
    config.cost.slippage = dec!(0.001);
    let report = BacktestEngine::new(config, module, as_dyn(daily_provider(flat_days("X", &prices))))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.state, RunState::Finished);
    assert_eq!(report.fills.len(), 7);
    let last = report.final_snapshot().unwrap();
    let signed: i64 = report.fills.iter().map(|f| f.quantity).sum();
    assert_eq!(last.quantity("X"), signed);

    let spent: Decimal = report
        .fills
        .iter()
        .map(|f| f.price * Decimal::from(f.quantity) + f.commission)
        .sum();
    assert_eq!(last.cash, dec!(100000) - spent);
    let commission: Decimal = report.fills.iter().map(|f| f.commission).sum();
    assert_eq!(last.total_commission, commission);
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let run = || {
        let provider = daily_provider(flat_days("X", &[dec!(10), dec!(11), dec!(9), dec!(12), dec!(10)]));
        let module = bullet_engine::cli::ma_cross();
        let mut config = config(5, &["X"]);
        config.params.insert("short".into(), serde_json::json!(1));
        config.params.insert("long".into(), serde_json::json!(2));
        BacktestEngine::new(config, module, as_dyn(provider))
            .unwrap()
            .with_run_id("replay")
            .run()
            .unwrap()
    };

    let first = run();
    let second = run();
    assert!(!first.fills.is_empty());
    assert_eq!(
        serde_json::to_string(&first.orders).unwrap(),
        serde_json::to_string(&second.orders).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&first.fills).unwrap(),
        serde_json::to_string(&second.fills).unwrap()
    );
    assert_eq!(first.snapshots, second.snapshots);
}

#[tokio::test]
async fn test_minute_tasks_interleave_with_bars() {
    let day = date(2);
    let bars: Vec<_> = (31..=34)
        .map(|m| {
            let p = Decimal::from(m - 20);
            bar("X", at(2, 9, m), p, p, p, p)
        })
        .collect();
    let provider = Arc::new(MemoryProvider::new().with_bars(Frequency::Minute, bars));

    let trace = Arc::new(Mutex::new(Vec::<String>::new()));
    let (t1, t2) = (trace.clone(), trace.clone());
    let module = StrategyModule::new("minutes", move |ctx| {
        let t1 = t1.clone();
        ctx.run_daily(
            move |c| {
                t1.lock().unwrap().push(format!("task {}", c.current_dt().format("%H:%M")));
                c.order("X", 10)?;
                Ok(())
            },
            "09:32",
        )?;
        Ok(())
    })
    .handle_data(move |c, data| {
        t2.lock()
            .unwrap()
            .push(format!("bar {} {}", c.current_dt().format("%H:%M"), data.bars.len()));
        Ok(())
    });

    let mut config = config(1, &["X"]);
    config.run.start_date = day;
    config.run.end_date = day;
    config.run.frequency = Frequency::Minute;
    let report = BacktestEngine::new(config, module, as_dyn(provider))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(
        *trace.lock().unwrap(),
        vec!["bar 09:31 1", "task 09:32", "bar 09:32 1", "bar 09:33 1", "bar 09:34 1"]
    );
    // Submitted at 09:32, matched against the 09:32 bar's open
    assert_eq!(report.fills.len(), 1);
    assert_eq!(report.fills[0].price, dec!(12));
}

#[tokio::test]
async fn test_callback_error_aborts_with_fault_event() {
    let module = StrategyModule::new("broken", |_| Ok(())).handle_data(|c, _| {
        if c.current_dt().date() == date(3) {
            anyhow::bail!("divide by zero in signal");
        }
        Ok(())
    });
    let provider = daily_provider(flat_days("X", &[dec!(10); 4]));
    let handle = start_backtest(config(4, &["X"]), module, as_dyn(provider), None).unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, RunState::Aborted);
    let fault = report.fault.unwrap();
    assert!(fault.contains("handle_data"));
    assert!(fault.contains("divide by zero"));
    assert_eq!(report.snapshots.len(), 1);
    assert!(report
        .events
        .iter()
        .any(|e| e.severity == Severity::Error && e.kind == "strategy_runtime"));
}

#[tokio::test]
async fn test_missing_symbol_data_is_not_fatal() {
    let module = StrategyModule::new("probe", |ctx| {
        ctx.run_daily(
            |c| {
                c.history("NOPE", 5)?;
                Ok(())
            },
            "open",
        )?;
        Ok(())
    });
    let provider = daily_provider(flat_days("X", &[dec!(10); 3]));
    let report = BacktestEngine::new(config(3, &["X"]), module, as_dyn(provider))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.state, RunState::Finished);
    assert_eq!(report.snapshots.len(), 3);
    assert!(report.events.iter().any(|e| e.kind == "strategy_callback"));
}
