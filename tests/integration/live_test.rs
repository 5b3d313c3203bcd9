//! Live runs against the in-process simulated venue

mod common;

use bullet_engine::data::{MemoryProvider, Quote};
use bullet_engine::engine::{start_live, Clock, LiveSetup, RunHandle, RunState};
use bullet_engine::execution::{OrderCost, OrderStatus, SimulatedVenue, Venue};
use bullet_engine::feed::ChannelFeed;
use bullet_engine::ledger::{AccountSnapshot, VenuePosition};
use bullet_engine::strategy::StrategyModule;
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn live_config() -> bullet_engine::config::Config {
    let mut config = config(1, &["X"]);
    config.broker.initial_backoff_ms = 5;
    config.broker.max_backoff_ms = 20;
    config
}

async fn wait_for(handle: &RunHandle, kind: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.event_history().iter().any(|e| e.kind == kind) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind} event"));
}

fn quote(price: Decimal) -> Quote {
    Quote {
        symbol: "X".into(),
        price,
        volume: dec!(100),
        timestamp: at(2, 9, 25),
    }
}

#[tokio::test]
async fn test_reconnect_adopts_venue_state() {
    let venue = Arc::new(SimulatedVenue::new(dec!(100000), OrderCost::zero()));
    let (feed, _quotes) = ChannelFeed::new(8);
    let (clock, ticks) = Clock::manual(8);

    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    let module = StrategyModule::new("observer", |_| Ok(())).after_trading_close(move |c| {
        *s.lock().unwrap() = Some((c.portfolio().cash, c.portfolio().quantity("Y")));
        Ok(())
    });

    let setup = LiveSetup::new(
        live_config(),
        module,
        Arc::new(MemoryProvider::new()),
        venue.clone(),
        Arc::new(feed),
    )
    .clock(clock);
    let handle = start_live(setup).await.unwrap();
    wait_for(&handle, "broker_connection").await;
    ticks.send(at(2, 9, 0)).await.unwrap();

    // Activity outside the engine while the session drops
    let mut outside = AccountSnapshot::new(dec!(90000));
    outside.positions.insert(
        "Y".into(),
        VenuePosition {
            quantity: 50,
            avg_cost: dec!(20),
            last_price: None,
        },
    );
    venue.set_account(&outside);
    venue.disconnect();
    wait_for(&handle, "reconcile_drift").await;

    ticks.send(at(2, 15, 30)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(ticks);

    let report = handle.wait().await.unwrap();
    assert_eq!(report.state, RunState::Finished);
    assert_eq!(*seen.lock().unwrap(), Some((dec!(90000), 50)));
    let last = report.final_snapshot().unwrap();
    assert_eq!(last.cash, dec!(90000));
    assert_eq!(last.position("Y").unwrap().avg_cost, dec!(20));
}

#[tokio::test]
async fn test_cancel_leaves_working_orders_at_venue() {
    let venue = Arc::new(SimulatedVenue::new(dec!(100000), OrderCost::zero()));
    let (feed, quotes) = ChannelFeed::new(8);
    let (clock, ticks) = Clock::manual(8);

    let module = StrategyModule::new("resting_bid", |ctx| {
        ctx.run_daily(
            |c| {
                c.order_limit("X", 100, dec!(5))?;
                Ok(())
            },
            "open",
        )?;
        Ok(())
    });
    let setup = LiveSetup::new(
        live_config(),
        module,
        Arc::new(MemoryProvider::new()),
        venue.clone(),
        Arc::new(feed),
    )
    .clock(clock)
    .run_id("resting");
    let handle = start_live(setup).await.unwrap();
    assert_eq!(handle.run_id(), "resting");
    wait_for(&handle, "broker_connection").await;

    quotes.send(quote(dec!(10))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    ticks.send(at(2, 9, 0)).await.unwrap();
    ticks.send(at(2, 9, 30)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.state, RunState::Finished);
    assert_eq!(report.orders.len(), 1);
    assert_eq!(report.orders[0].status, OrderStatus::Pending);
    assert!(report.fills.is_empty());

    let at_venue = venue.account_snapshot().await.unwrap();
    assert_eq!(at_venue.orders.len(), 1);
    assert_eq!(at_venue.orders[0].order_id, report.orders[0].id);
    drop(ticks);
}

#[tokio::test]
async fn test_event_stream_reports_state_changes() {
    let venue = Arc::new(SimulatedVenue::new(dec!(100000), OrderCost::zero()));
    let (feed, _quotes) = ChannelFeed::new(4);
    let (clock, ticks) = Clock::manual(4);
    let setup = LiveSetup::new(
        live_config(),
        StrategyModule::new("idle", |_| Ok(())),
        Arc::new(MemoryProvider::new()),
        venue,
        Arc::new(feed),
    )
    .clock(clock);

    let handle = start_live(setup).await.unwrap();
    let mut events = handle.events();
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.state() != RunState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    handle.pause().unwrap();
    assert_eq!(handle.state(), RunState::Paused);
    handle.resume().unwrap();
    drop(ticks);

    let mut transitions = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        if event.kind == "state" {
            transitions.push(event.message);
        }
    }
    assert!(transitions.contains(&"running -> paused".to_string()));
    assert!(transitions.contains(&"paused -> running".to_string()));
    assert_eq!(handle.wait().await.unwrap().state, RunState::Finished);
}
