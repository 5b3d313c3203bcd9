//! Live broker adapter
//!
//! Strategy calls are synchronous and only enqueue work. One
//! order-management task owns the venue session: it places and cancels
//! orders, forwards fills to the ledger, and on every (re)connect pulls the
//! venue's account snapshot and reconciles before trading resumes.

use super::{Broker, Fill, Order, OrderId, OrderKind, OrderRequest, OrderStatus, RejectReason, Venue, VenueEvent};
use crate::config::BrokerConfig;
use crate::engine::EventLog;
use crate::error::{EngineError, Result};
use crate::ledger::{diff_orders, LedgerCommand, LedgerHandle, LedgerSnapshot, ReconcileDiff, ReconcileReport};
use crate::telemetry::{self, CounterMetric, LatencyMetric};
use crate::ws::Backoff;
use chrono::{Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Connection and queueing knobs for the live adapter
#[derive(Debug, Clone)]
pub struct LiveBrokerSettings {
    pub connect_timeout: Duration,
    pub reconcile_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed connects before giving up (0 = never)
    pub max_reconnects: u32,
    pub queue: usize,
    /// Accept sells beyond the current holding
    pub allow_short: bool,
}

impl Default for LiveBrokerSettings {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

impl LiveBrokerSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            reconcile_timeout: config.reconcile_timeout(),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            max_reconnects: config.max_reconnects,
            queue: config.order_queue,
            allow_short: false,
        }
    }

    pub fn allow_short(mut self, allow: bool) -> Self {
        self.allow_short = allow;
        self
    }
}

#[derive(Debug)]
enum BrokerCommand {
    Place(Order),
    Cancel(OrderId),
    Shutdown,
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    orders: Mutex<BTreeMap<OrderId, Order>>,
    fills: Mutex<Vec<Fill>>,
    reports: Mutex<Vec<ReconcileReport>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wall_clock() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Broker backed by a live venue
pub struct LiveBroker {
    run_id: String,
    allow_short: bool,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    commands: mpsc::Sender<BrokerCommand>,
}

impl LiveBroker {
    /// Start the order-management task
    pub fn spawn(
        venue: Arc<dyn Venue>,
        ledger: LedgerHandle,
        events: EventLog,
        settings: LiveBrokerSettings,
        run_id: impl Into<String>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue.max(1));
        let allow_short = settings.allow_short;
        let shared = Arc::new(Shared::default());

        let manager = OrderManager {
            venue,
            ledger,
            events,
            settings,
            shared: shared.clone(),
            commands: rx,
        };
        let task = tokio::spawn(manager.run());

        let broker = Arc::new(Self {
            run_id: run_id.into(),
            allow_short,
            next_id: AtomicU64::new(0),
            shared,
            commands: tx,
        });
        (broker, task)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Reports from every reconciliation pass so far
    pub fn reconcile_reports(&self) -> Vec<ReconcileReport> {
        lock(&self.shared.reports).clone()
    }

    /// Stop the order-management task. Open orders stay working at the venue.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(BrokerCommand::Shutdown).await;
    }

    fn refuse(&self, order: Order, reason: RejectReason, now: NaiveDateTime) -> EngineError {
        let mut order = order;
        let symbol = order.symbol.clone();
        order.reject(reason.clone(), now);
        lock(&self.shared.orders).insert(order.id, order);
        telemetry::increment(CounterMetric::OrdersRejected, 1);
        EngineError::rejected(symbol, reason)
    }
}

impl Broker for LiveBroker {
    fn name(&self) -> &str {
        "live"
    }

    fn submit(
        &self,
        request: OrderRequest,
        account: &LedgerSnapshot,
        now: NaiveDateTime,
    ) -> Result<OrderId> {
        if !self.is_connected() {
            return Err(EngineError::BrokerConnection("venue disconnected".into()));
        }

        let id = OrderId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let order = Order::new(id, request, &self.run_id, now);

        if order.quantity == 0 {
            return Err(self.refuse(order, RejectReason::InvalidQuantity, now));
        }
        if let OrderKind::Limit { price } = order.kind {
            if price.is_sign_negative() || price.is_zero() {
                return Err(self.refuse(order, RejectReason::InvalidLimitPrice, now));
            }
        }
        if order.quantity < 0 && !self.allow_short {
            let pending_sells: i64 = lock(&self.shared.orders)
                .values()
                .filter(|o| o.is_open() && o.symbol == order.symbol && o.remaining() < 0)
                .map(|o| o.remaining().abs())
                .sum();
            let available = (account.quantity(&order.symbol) - pending_sells).max(0);
            if order.quantity.abs() > available {
                let reason = RejectReason::InsufficientPosition {
                    requested: order.quantity.abs(),
                    available,
                };
                return Err(self.refuse(order, reason, now));
            }
        }

        lock(&self.shared.orders).insert(id, order.clone());
        if let Err(e) = self.commands.try_send(BrokerCommand::Place(order)) {
            lock(&self.shared.orders).remove(&id);
            return Err(EngineError::BrokerConnection(format!("order queue: {e}")));
        }
        telemetry::increment(CounterMetric::OrdersSubmitted, 1);
        Ok(id)
    }

    fn cancel(&self, id: OrderId, _now: NaiveDateTime) -> Result<()> {
        let open = lock(&self.shared.orders)
            .get(&id)
            .map(|o| o.is_open())
            .ok_or(EngineError::UnknownOrder(id))?;
        if !open {
            return Ok(());
        }
        if !self.is_connected() {
            return Err(EngineError::BrokerConnection("venue disconnected".into()));
        }
        self.commands
            .try_send(BrokerCommand::Cancel(id))
            .map_err(|e| EngineError::BrokerConnection(format!("order queue: {e}")))
    }

    fn order(&self, id: OrderId) -> Option<Order> {
        lock(&self.shared.orders).get(&id).cloned()
    }

    fn open_orders(&self) -> Vec<Order> {
        lock(&self.shared.orders)
            .values()
            .filter(|o| o.is_open())
            .cloned()
            .collect()
    }

    fn orders(&self) -> Vec<Order> {
        lock(&self.shared.orders).values().cloned().collect()
    }

    fn fills(&self) -> Vec<Fill> {
        lock(&self.shared.fills).clone()
    }
}

/// Why a connected session ended
enum SessionEnd {
    Disconnected,
    Shutdown,
}

struct OrderManager {
    venue: Arc<dyn Venue>,
    ledger: LedgerHandle,
    events: EventLog,
    settings: LiveBrokerSettings,
    shared: Arc<Shared>,
    commands: mpsc::Receiver<BrokerCommand>,
}

impl OrderManager {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.settings.initial_backoff, self.settings.max_backoff);
        let mut sessions = 0u64;

        loop {
            let connected = match timeout(self.settings.connect_timeout, self.venue.connect()).await {
                Ok(Ok(rx)) => Some(rx),
                Ok(Err(e)) => {
                    self.events.error(wall_clock(), &e);
                    None
                }
                Err(_) => {
                    self.events.error(
                        wall_clock(),
                        &EngineError::BrokerConnection("connect timed out".into()),
                    );
                    None
                }
            };

            let venue_rx = match connected {
                Some(venue_rx) => {
                    self.events.info(
                        wall_clock(),
                        "broker_connection",
                        format!("connected to {} venue", self.venue.name()),
                    );
                    match self.reconcile().await {
                        Ok(()) => Some(venue_rx),
                        Err(e) => {
                            self.events.error(wall_clock(), &e);
                            None
                        }
                    }
                }
                None => None,
            };

            let Some(venue_rx) = venue_rx else {
                let delay = backoff.next_delay();
                if backoff.exhausted(self.settings.max_reconnects) {
                    self.events.error(
                        wall_clock(),
                        &EngineError::BrokerConnection(format!(
                            "giving up after {} attempts",
                            backoff.attempts()
                        )),
                    );
                    break;
                }
                if !self.wait_offline(delay).await {
                    break;
                }
                continue;
            };

            backoff.reset();
            sessions += 1;
            if sessions > 1 {
                telemetry::increment(CounterMetric::BrokerReconnects, 1);
            }
            self.shared.connected.store(true, Ordering::SeqCst);

            let end = self.session(venue_rx).await;
            self.shared.connected.store(false, Ordering::SeqCst);
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Disconnected => {
                    self.events.warn(wall_clock(), "broker_connection", "venue session lost");
                }
            }
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        tracing::info!(venue = self.venue.name(), "Order manager stopped");
    }

    /// Sleep out a backoff delay while refusing queued work. Returns false on shutdown.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None | Some(BrokerCommand::Shutdown) => return false,
                    Some(BrokerCommand::Place(order)) => {
                        self.reject_local(
                            order.id,
                            RejectReason::Venue { message: "venue disconnected".into() },
                        );
                    }
                    Some(BrokerCommand::Cancel(id)) => {
                        tracing::debug!(order_id = %id, "Cancel dropped while disconnected");
                    }
                },
            }
        }
    }

    async fn session(&mut self, mut venue_rx: mpsc::Receiver<VenueEvent>) -> SessionEnd {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(BrokerCommand::Shutdown) => return SessionEnd::Shutdown,
                    Some(BrokerCommand::Place(order)) => {
                        let started = Instant::now();
                        if let Err(e) = self.venue.place_order(&order).await {
                            self.events.error(wall_clock(), &e);
                            self.reject_local(order.id, RejectReason::Venue { message: e.to_string() });
                            if e.is_retryable() {
                                return SessionEnd::Disconnected;
                            }
                        }
                        telemetry::record_latency(LatencyMetric::OrderSubmission, started.elapsed());
                    }
                    Some(BrokerCommand::Cancel(id)) => {
                        if let Err(e) = self.venue.cancel_order(id).await {
                            self.events.error(wall_clock(), &e);
                            if e.is_retryable() {
                                return SessionEnd::Disconnected;
                            }
                        }
                    }
                },
                event = venue_rx.recv() => match event {
                    Some(VenueEvent::Fill(fill)) => self.on_fill(fill).await,
                    Some(VenueEvent::Rejected { order_id, reason }) => {
                        let symbol = self.reject_local(order_id, reason.clone());
                        self.events.error(
                            wall_clock(),
                            &EngineError::rejected(symbol.unwrap_or_default(), reason),
                        );
                    }
                    Some(VenueEvent::Cancelled { order_id }) => {
                        if let Some(order) = lock(&self.shared.orders).get_mut(&order_id) {
                            order.transition(OrderStatus::Cancelled, wall_clock());
                        }
                    }
                    Some(VenueEvent::Disconnected) | None => return SessionEnd::Disconnected,
                },
            }
        }
    }

    async fn on_fill(&mut self, fill: Fill) {
        match lock(&self.shared.orders).get_mut(&fill.order_id) {
            Some(order) => order.record_fill(fill.quantity, fill.price, fill.timestamp),
            None => tracing::warn!(order_id = %fill.order_id, "Fill for unknown order"),
        }
        lock(&self.shared.fills).push(fill.clone());
        telemetry::increment(CounterMetric::Fills, 1);
        if let Err(e) = self.ledger.send(LedgerCommand::ApplyFill(fill)).await {
            tracing::error!(error = %e, "Fill not delivered to ledger");
        }
    }

    fn reject_local(&self, id: OrderId, reason: RejectReason) -> Option<String> {
        let mut orders = lock(&self.shared.orders);
        let order = orders.get_mut(&id)?;
        order.reject(reason, wall_clock());
        telemetry::increment(CounterMetric::OrdersRejected, 1);
        Some(order.symbol.clone())
    }

    /// Pull the venue's view and let it win over local state. The session
    /// only goes live once this succeeds.
    async fn reconcile(&mut self) -> Result<()> {
        let started = Instant::now();
        let snapshot = timeout(self.settings.reconcile_timeout, self.venue.account_snapshot())
            .await
            .map_err(|_| EngineError::BrokerConnection("account snapshot timed out".into()))??;
        telemetry::record_latency(LatencyMetric::Reconciliation, started.elapsed());

        let held = self.ledger.snapshot();
        let order_diffs = {
            let mut orders = lock(&self.shared.orders);
            let diffs = diff_orders(&orders, &held, &snapshot);
            for diff in &diffs {
                if let ReconcileDiff::OrderState {
                    order_id,
                    venue_status,
                    venue_filled,
                    ..
                } = diff
                {
                    if let Some(order) = orders.get_mut(order_id) {
                        order.filled = *venue_filled;
                        order.transition(*venue_status, wall_clock());
                    }
                }
            }
            diffs
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = LedgerCommand::Reconcile {
            snapshot,
            at: wall_clock(),
            reply: Some(reply_tx),
        };
        self.ledger.send(command).await?;
        let mut report = reply_rx.await.unwrap_or_default();
        if !order_diffs.is_empty() {
            telemetry::record_reconcile_drift(order_diffs.len());
        }
        report.extend(order_diffs);

        if report.is_clean() {
            self.events.info(wall_clock(), "reconcile", "local state matches venue");
        } else {
            for diff in &report.diffs {
                let detail = serde_json::to_string(diff).unwrap_or_else(|_| format!("{diff:?}"));
                self.events.warn(wall_clock(), "reconcile_drift", detail);
            }
        }
        lock(&self.shared.reports).push(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{OrderCost, SimulatedVenue};
    use crate::ledger::{spawn_ledger, AccountSnapshot, Ledger, VenuePosition};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 31, 0)
            .unwrap()
    }

    fn settings() -> LiveBrokerSettings {
        LiveBrokerSettings {
            connect_timeout: Duration::from_secs(1),
            reconcile_timeout: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_reconnects: 0,
            queue: 16,
            allow_short: false,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_fill_reaches_ledger() {
        let venue = Arc::new(SimulatedVenue::new(dec!(10000), OrderCost::zero()));
        venue.set_price("X", dec!(10), ts());
        let (ledger, _ledger_task) = spawn_ledger(Ledger::new(dec!(10000)), 16);
        let (broker, _task) = LiveBroker::spawn(venue.clone(), ledger.clone(), EventLog::default(), settings(), "run");

        wait_until(|| broker.is_connected()).await;
        let id = broker
            .submit(OrderRequest::market("X", 100), &ledger.snapshot(), ts())
            .unwrap();

        wait_until(|| ledger.snapshot().quantity("X") == 100).await;
        assert_eq!(broker.order(id).unwrap().status, OrderStatus::Filled);
        assert_eq!(ledger.snapshot().cash, dec!(9000));
        assert_eq!(broker.fills().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_while_disconnected_is_retryable() {
        let venue = Arc::new(SimulatedVenue::new(dec!(10000), OrderCost::zero()));
        venue.fail_next_connects(1000);
        let (ledger, _ledger_task) = spawn_ledger(Ledger::new(dec!(10000)), 16);
        let (broker, _task) = LiveBroker::spawn(venue, ledger.clone(), EventLog::default(), settings(), "run");

        let err = broker
            .submit(OrderRequest::market("X", 100), &ledger.snapshot(), ts())
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(broker.orders().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_reconciles_to_venue() {
        let venue = Arc::new(SimulatedVenue::new(dec!(10000), OrderCost::zero()));
        let (ledger, _ledger_task) = spawn_ledger(Ledger::new(dec!(10000)), 16);
        let events = EventLog::default();
        let (broker, _task) = LiveBroker::spawn(venue.clone(), ledger.clone(), events.clone(), settings(), "run");

        wait_until(|| broker.reconcile_reports().len() == 1).await;
        assert!(broker.reconcile_reports()[0].is_clean());

        // Activity outside the engine, then the session drops
        let mut outside = AccountSnapshot::new(dec!(8000));
        outside.positions.insert(
            "X".into(),
            VenuePosition {
                quantity: 200,
                avg_cost: dec!(10),
                last_price: Some(dec!(10)),
            },
        );
        venue.set_account(&outside);
        venue.fail_next_connects(2);
        venue.disconnect();

        wait_until(|| broker.reconcile_reports().len() == 2).await;
        assert_eq!(broker.reconcile_reports()[1].diffs.len(), 2);
        wait_until(|| ledger.snapshot().quantity("X") == 200).await;
        assert_eq!(ledger.snapshot().cash, dec!(8000));
        assert!(events.count("reconcile_drift") >= 2);
        assert!(events.count("broker_connection") >= 3);
    }

    #[tokio::test]
    async fn test_oversell_refused_locally() {
        let venue = Arc::new(SimulatedVenue::new(dec!(10000), OrderCost::zero()));
        let (ledger, _ledger_task) = spawn_ledger(Ledger::new(dec!(10000)), 16);
        let (broker, _task) = LiveBroker::spawn(venue, ledger.clone(), EventLog::default(), settings(), "run");
        wait_until(|| broker.is_connected()).await;

        let err = broker
            .submit(OrderRequest::market("X", -100), &ledger.snapshot(), ts())
            .unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected { .. }));
        assert_eq!(broker.orders()[0].status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_reconnects() {
        let venue = Arc::new(SimulatedVenue::new(dec!(10000), OrderCost::zero()));
        venue.fail_next_connects(10);
        let (ledger, _ledger_task) = spawn_ledger(Ledger::new(dec!(10000)), 16);
        let events = EventLog::default();
        let mut limited = settings();
        limited.max_reconnects = 3;
        let (_broker, task) = LiveBroker::spawn(venue, ledger, events.clone(), limited, "run");

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.count("broker_connection"), 4);
    }

    #[tokio::test]
    async fn test_short_sell_accepted_when_allowed() {
        let venue = Arc::new(SimulatedVenue::new(dec!(10000), OrderCost::zero()));
        let (ledger, _ledger_task) = spawn_ledger(Ledger::new(dec!(10000)), 16);
        let (broker, _task) = LiveBroker::spawn(
            venue,
            ledger.clone(),
            EventLog::default(),
            settings().allow_short(true),
            "run",
        );
        wait_until(|| broker.is_connected()).await;

        let id = broker
            .submit(OrderRequest::limit("X", -100, dec!(20)), &ledger.snapshot(), ts())
            .unwrap();
        assert_ne!(broker.order(id).unwrap().status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_order_filled_during_outage_is_closed_on_reconnect() {
        let venue = Arc::new(SimulatedVenue::new(dec!(10000), OrderCost::zero()));
        venue.set_price("X", dec!(10), ts());
        let (ledger, _ledger_task) = spawn_ledger(Ledger::new(dec!(10000)), 16);
        let (broker, _task) = LiveBroker::spawn(venue.clone(), ledger.clone(), EventLog::default(), settings(), "run");
        wait_until(|| broker.reconcile_reports().len() == 1).await;

        let id = broker
            .submit(OrderRequest::limit("X", 100, dec!(9)), &ledger.snapshot(), ts())
            .unwrap();
        wait_until(|| venue.working_orders() == 1).await;

        // The order fills while the session is down, so no fill event arrives
        venue.fail_next_connects(1000);
        venue.disconnect();
        wait_until(|| !broker.is_connected()).await;
        venue.set_price("X", dec!(8), ts());
        venue.fail_next_connects(0);

        wait_until(|| broker.reconcile_reports().len() == 2).await;
        let order = broker.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled, 100);
        assert!(broker.open_orders().is_empty());
        wait_until(|| ledger.snapshot().quantity("X") == 100).await;
        assert_eq!(ledger.snapshot().cash, dec!(9100));
    }

    /// Connects fine but never hands out an account snapshot
    struct NoSnapshotVenue(SimulatedVenue);

    #[async_trait::async_trait]
    impl Venue for NoSnapshotVenue {
        fn name(&self) -> &str {
            "no-snapshot"
        }

        async fn connect(&self) -> Result<mpsc::Receiver<VenueEvent>> {
            self.0.connect().await
        }

        async fn place_order(&self, order: &Order) -> Result<()> {
            self.0.place_order(order).await
        }

        async fn cancel_order(&self, id: OrderId) -> Result<()> {
            self.0.cancel_order(id).await
        }

        async fn account_snapshot(&self) -> Result<AccountSnapshot> {
            Err(EngineError::BrokerConnection("snapshot unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_reconcile_never_goes_live() {
        let venue = Arc::new(NoSnapshotVenue(SimulatedVenue::new(dec!(10000), OrderCost::zero())));
        let (ledger, _ledger_task) = spawn_ledger(Ledger::new(dec!(10000)), 16);
        let events = EventLog::default();
        let mut limited = settings();
        limited.max_reconnects = 2;
        let (broker, task) = LiveBroker::spawn(venue, ledger.clone(), events.clone(), limited, "run");

        let err = broker
            .submit(OrderRequest::market("X", 100), &ledger.snapshot(), ts())
            .unwrap_err();
        assert!(err.is_retryable());

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!broker.is_connected());
        assert!(broker.reconcile_reports().is_empty());
        // Two connects, each followed by a failed snapshot, then giving up
        assert_eq!(events.count("broker_connection"), 5);
    }
}
