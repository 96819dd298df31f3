//! Debounced pricing synchronizer.
//!
//! Raw coverage edits update the UI immediately, but the value that drives
//! network traffic is the edit after it has been stable for the quiet
//! interval. Each issued recalculation carries a generation number; only
//! the result matching the most recently issued generation is applied, so
//! a slow early response can never overwrite a later one. In-flight
//! requests are never aborted; supersession is cooperative.
//!
//! Round-trip state machine for the coverage slice:
//! `Idle -> Debouncing (quiet timer running) -> Syncing (request in
//! flight) -> Idle`. A new raw edit while `Debouncing` restarts the timer;
//! a new raw edit while `Syncing` re-enters `Debouncing` without touching
//! the in-flight request.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::aggregate::{Coverages, Premium, QuoteAggregate};
use crate::cache::QuoteCache;
use crate::service::QuoteService;

/// Minimum idle time after the last raw edit before a recalculation fires.
pub const QUIET_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    /// Quiet timer running; the displayed premium is stale.
    Debouncing,
    /// Recalculation request in flight.
    Syncing,
}

/// What a pricing view renders: the last server-derived premium and
/// whether it is currently stale. The premium is never locally guessed;
/// until the first server value arrives it is simply absent.
#[derive(Debug, Clone, Serialize)]
pub struct PricingView {
    pub premium: Option<Premium>,
    pub phase: SyncPhase,
}

impl PricingView {
    pub fn is_stale(&self) -> bool {
        self.phase != SyncPhase::Idle
    }
}

enum Command {
    /// Populate from a freshly fetched aggregate. Never issues a request;
    /// honored only once per synchronizer (one quote number each).
    Prime(Box<QuoteAggregate>),
    Edit(Coverages),
}

/// Handle to one quote number's pricing synchronizer. Dropping the handle
/// stops the background loop.
pub struct PricingSync {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<PricingView>,
}

impl PricingSync {
    pub fn spawn(
        service: Arc<dyn QuoteService>,
        cache: QuoteCache,
        quote_number: impl Into<String>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(PricingView {
            premium: None,
            phase: SyncPhase::Idle,
        });
        let worker = Synchronizer {
            service,
            cache,
            quote_number: quote_number.into(),
            view: view_tx,
            initialized: false,
            generation: 0,
        };
        tokio::spawn(worker.run(command_rx));
        Self { commands, view }
    }

    /// Populate the view from a fetched aggregate without triggering a
    /// recalculation.
    pub fn prime(&self, aggregate: &QuoteAggregate) {
        let _ = self.commands.send(Command::Prime(Box::new(aggregate.clone())));
    }

    /// Record a raw coverage edit. Coalesced behind the quiet interval.
    pub fn edit(&self, coverages: Coverages) {
        let _ = self.commands.send(Command::Edit(coverages));
    }

    pub fn view(&self) -> watch::Receiver<PricingView> {
        self.view.clone()
    }
}

struct Synchronizer {
    service: Arc<dyn QuoteService>,
    cache: QuoteCache,
    quote_number: String,
    view: watch::Sender<PricingView>,
    initialized: bool,
    generation: u64,
}

impl Synchronizer {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (results_tx, mut results) = mpsc::unbounded_channel::<(u64, crate::error::Result<QuoteAggregate>)>();

        let mut pending: Option<Coverages> = None;
        let mut deadline: Option<Instant> = None;
        let mut in_flight = false;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Prime(aggregate)) => {
                            if self.initialized {
                                debug!(quote_number = %self.quote_number, "already primed, populate ignored");
                                continue;
                            }
                            self.initialized = true;
                            self.publish(Some(aggregate.premium), pending.is_some(), in_flight);
                        }
                        Some(Command::Edit(coverages)) => {
                            pending = Some(coverages);
                            deadline = Some(Instant::now() + QUIET_INTERVAL);
                            self.publish_keep_premium(true, in_flight);
                        }
                        None => break,
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let coverages = match pending.take() {
                        Some(c) => c,
                        None => continue,
                    };
                    self.generation += 1;
                    let generation = self.generation;
                    in_flight = true;
                    self.publish_keep_premium(false, true);

                    let service = self.service.clone();
                    let quote_number = self.quote_number.clone();
                    let results_tx = results_tx.clone();
                    tokio::spawn(async move {
                        let result = service.update_coverage(&quote_number, coverages).await;
                        let _ = results_tx.send((generation, result));
                    });
                }
                Some((generation, result)) = results.recv() => {
                    if generation != self.generation {
                        // Superseded while in flight. Diagnostics only,
                        // never user-facing.
                        debug!(
                            quote_number = %self.quote_number,
                            generation,
                            latest = self.generation,
                            "discarding stale pricing response"
                        );
                        continue;
                    }
                    in_flight = false;
                    match result {
                        Ok(aggregate) => {
                            self.cache.write(&self.quote_number, aggregate.clone());
                            self.publish(Some(aggregate.premium), deadline.is_some(), false);
                        }
                        Err(e) => {
                            // Displayed premium survives a failed
                            // recalculation; the next edit retries.
                            warn!(quote_number = %self.quote_number, error = %e, "recalculation failed");
                            self.publish_keep_premium(deadline.is_some(), false);
                        }
                    }
                }
            }
        }
    }

    fn phase(debouncing: bool, syncing: bool) -> SyncPhase {
        if debouncing {
            SyncPhase::Debouncing
        } else if syncing {
            SyncPhase::Syncing
        } else {
            SyncPhase::Idle
        }
    }

    fn publish(&self, premium: Option<Premium>, debouncing: bool, syncing: bool) {
        let _ = self.view.send(PricingView {
            premium,
            phase: Self::phase(debouncing, syncing),
        });
    }

    fn publish_keep_premium(&self, debouncing: bool, syncing: bool) {
        let premium = self.view.borrow().premium;
        self.publish(premium, debouncing, syncing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::PrimaryDriver;
    use crate::error::{FlowError, Result};
    use crate::service::tests::sample_aggregate;
    use crate::service::{DriverInput, NewQuoteRequest, PaymentCard, VehicleInput};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::advance;

    /// Pricing backend probe: records every coverage slice it receives and
    /// returns a premium encoding the call index, so tests can tell which
    /// response produced the displayed value. Calls can be held behind
    /// pre-registered gates to control resolution order.
    struct PricingProbe {
        quote_number: String,
        calls: AtomicUsize,
        sent: Mutex<Vec<Coverages>>,
        gates: Mutex<VecDeque<Arc<Notify>>>,
        fail_calls: Mutex<Vec<usize>>,
    }

    impl PricingProbe {
        fn new(quote_number: &str) -> Arc<Self> {
            Arc::new(Self {
                quote_number: quote_number.to_string(),
                calls: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                gates: Mutex::new(VecDeque::new()),
                fail_calls: Mutex::new(Vec::new()),
            })
        }

        /// Gate the next call; returns the handle that releases it.
        fn add_gate(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.gates.lock().unwrap().push_back(gate.clone());
            gate
        }

        fn fail_call(&self, index: usize) {
            self.fail_calls.lock().unwrap().push(index);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn premium_for_call(index: usize) -> f64 {
            (index as f64 + 1.0) * 100.0
        }
    }

    #[async_trait]
    impl QuoteService for PricingProbe {
        async fn create_quote(&self, _request: NewQuoteRequest) -> Result<QuoteAggregate> {
            unreachable!("probe only prices")
        }
        async fn get_quote(&self, quote_number: &str) -> Result<QuoteAggregate> {
            Ok(sample_aggregate(quote_number))
        }
        async fn update_primary_driver(
            &self,
            _quote_number: &str,
            _driver: PrimaryDriver,
        ) -> Result<QuoteAggregate> {
            unreachable!("probe only prices")
        }
        async fn update_drivers(
            &self,
            _quote_number: &str,
            _drivers: Vec<DriverInput>,
        ) -> Result<QuoteAggregate> {
            unreachable!("probe only prices")
        }
        async fn update_vehicles(
            &self,
            _quote_number: &str,
            _vehicles: Vec<VehicleInput>,
        ) -> Result<QuoteAggregate> {
            unreachable!("probe only prices")
        }
        async fn update_coverage(
            &self,
            quote_number: &str,
            coverages: Coverages,
        ) -> Result<QuoteAggregate> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push(coverages.clone());
            let gate = self.gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.fail_calls.lock().unwrap().contains(&index) {
                return Err(FlowError::Service("pricing backend unavailable".to_string()));
            }
            let mut aggregate = sample_aggregate(quote_number);
            aggregate.coverages = coverages;
            aggregate.premium = Premium::from_term_total(Self::premium_for_call(index));
            Ok(aggregate)
        }
        async fn bind_quote(&self, _quote_number: &str, _card: PaymentCard) -> Result<String> {
            unreachable!("probe only prices")
        }
        async fn email_exists(&self, _email: &str) -> Result<bool> {
            Ok(false)
        }
        async fn create_account(&self, _email: &str) -> Result<uuid::Uuid> {
            Ok(uuid::Uuid::new_v4())
        }
    }

    fn spawn_sync(probe: Arc<PricingProbe>) -> (PricingSync, QuoteCache) {
        let cache = QuoteCache::new();
        let quote_number = probe.quote_number.clone();
        let sync = PricingSync::spawn(probe, cache.clone(), quote_number);
        (sync, cache)
    }

    /// Let the synchronizer loop and any spawned request tasks run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn coverages_with_roadside(on: bool) -> Coverages {
        let mut c = crate::service::tests::sample_coverages();
        c.roadside_assistance = on;
        c
    }

    #[tokio::test(start_paused = true)]
    async fn edits_within_quiet_window_coalesce_to_one_request() {
        let probe = PricingProbe::new("DZSYNC0001");
        let (sync, _cache) = spawn_sync(probe.clone());

        let mut c = coverages_with_roadside(false);
        for limit in [50_000, 100_000, 250_000, 300_000] {
            c.bodily_injury_limit = limit;
            sync.edit(c.clone());
            settle().await;
            advance(Duration::from_millis(100)).await;
        }
        settle().await;
        assert_eq!(probe.calls(), 0, "fired before the quiet window elapsed");

        advance(QUIET_INTERVAL).await;
        settle().await;

        assert_eq!(probe.calls(), 1);
        let sent = probe.sent.lock().unwrap();
        assert_eq!(sent[0].bodily_injury_limit, 300_000);
    }

    #[tokio::test(start_paused = true)]
    async fn priming_from_a_fetched_aggregate_never_calls_the_service() {
        let probe = PricingProbe::new("DZSYNC0002");
        let (sync, _cache) = spawn_sync(probe.clone());

        let aggregate = sample_aggregate("DZSYNC0002");
        sync.prime(&aggregate);
        settle().await;
        advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(probe.calls(), 0);
        let view = sync.view();
        let view = view.borrow();
        assert_eq!(view.phase, SyncPhase::Idle);
        assert_eq!(
            view.premium.map(|p| p.total),
            Some(aggregate.premium.total)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prime_is_one_shot_per_quote_number() {
        let probe = PricingProbe::new("DZSYNC0003");
        let (sync, _cache) = spawn_sync(probe.clone());

        let aggregate = sample_aggregate("DZSYNC0003");
        sync.prime(&aggregate);
        settle().await;

        let mut replayed = sample_aggregate("DZSYNC0003");
        replayed.premium = Premium::from_term_total(9_999.0);
        sync.prime(&replayed);
        settle().await;

        let view = sync.view();
        assert_eq!(
            view.borrow().premium.map(|p| p.total),
            Some(aggregate.premium.total)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_response_is_discarded() {
        let probe = PricingProbe::new("DZSYNC0004");
        let (sync, cache) = spawn_sync(probe.clone());

        let gate_a = probe.add_gate();
        let gate_b = probe.add_gate();

        // Request A.
        sync.edit(coverages_with_roadside(false));
        settle().await;
        advance(QUIET_INTERVAL).await;
        settle().await;
        assert_eq!(probe.calls(), 1);

        // Request B issued while A is still in flight.
        sync.edit(coverages_with_roadside(true));
        settle().await;
        advance(QUIET_INTERVAL).await;
        settle().await;
        assert_eq!(probe.calls(), 2);

        // B resolves first and is applied.
        gate_b.notify_one();
        settle().await;
        let view = sync.view();
        assert_eq!(
            view.borrow().premium.map(|p| p.total),
            Some(PricingProbe::premium_for_call(1))
        );
        assert_eq!(view.borrow().phase, SyncPhase::Idle);

        // A finally lands and must not overwrite B.
        gate_a.notify_one();
        settle().await;
        assert_eq!(
            view.borrow().premium.map(|p| p.total),
            Some(PricingProbe::premium_for_call(1))
        );
        let cached = cache.read("DZSYNC0004").into_aggregate().unwrap();
        assert_eq!(cached.premium.total, PricingProbe::premium_for_call(1));
        assert!(cached.coverages.roadside_assistance);
    }

    #[tokio::test(start_paused = true)]
    async fn roadside_toggle_storm_fires_once_with_final_state() {
        let probe = PricingProbe::new("DZSYNC0005");
        let (sync, _cache) = spawn_sync(probe.clone());

        for on in [true, false, true] {
            sync.edit(coverages_with_roadside(on));
            settle().await;
            advance(Duration::from_millis(100)).await;
        }
        settle().await;
        advance(QUIET_INTERVAL).await;
        settle().await;

        assert_eq!(probe.calls(), 1);
        let sent = probe.sent.lock().unwrap();
        assert!(sent[0].roadside_assistance, "final toggle state was on");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recalculation_preserves_displayed_premium() {
        let probe = PricingProbe::new("DZSYNC0006");
        let (sync, cache) = spawn_sync(probe.clone());

        let aggregate = sample_aggregate("DZSYNC0006");
        sync.prime(&aggregate);
        settle().await;

        probe.fail_call(0);
        sync.edit(coverages_with_roadside(true));
        settle().await;
        advance(QUIET_INTERVAL).await;
        settle().await;

        let view = sync.view();
        assert_eq!(view.borrow().phase, SyncPhase::Idle);
        // No flicker to zero or absent.
        assert_eq!(
            view.borrow().premium.map(|p| p.total),
            Some(aggregate.premium.total)
        );
        // The failed response never touched the cache.
        assert!(matches!(
            cache.read("DZSYNC0006"),
            crate::cache::CacheRead::Absent
        ));

        // The user retries by editing again; this one succeeds.
        sync.edit(coverages_with_roadside(true));
        settle().await;
        advance(QUIET_INTERVAL).await;
        settle().await;
        assert_eq!(probe.calls(), 2);
        assert_eq!(
            view.borrow().premium.map(|p| p.total),
            Some(PricingProbe::premium_for_call(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_flight_debounces_without_cancelling() {
        let probe = PricingProbe::new("DZSYNC0007");
        let (sync, _cache) = spawn_sync(probe.clone());

        let gate = probe.add_gate();
        sync.edit(coverages_with_roadside(false));
        settle().await;
        advance(QUIET_INTERVAL).await;
        settle().await;
        assert_eq!(probe.calls(), 1);
        {
            let view = sync.view();
            assert_eq!(view.borrow().phase, SyncPhase::Syncing);
        }

        // Raw edit while syncing: back to debouncing, request stays out.
        sync.edit(coverages_with_roadside(true));
        settle().await;
        {
            let view = sync.view();
            assert_eq!(view.borrow().phase, SyncPhase::Debouncing);
        }
        assert_eq!(probe.calls(), 1);

        gate.notify_one();
        settle().await;
        advance(QUIET_INTERVAL).await;
        settle().await;
        assert_eq!(probe.calls(), 2);
    }
}
