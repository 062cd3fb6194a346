//! Discovery and tick driving.
//!
//! Two discovery strategies converge on the same cache: a live bucket watch
//! when the connection supports log filters, and a bounded traversal of the
//! registry's linked-list index when it does not. Independently of either, a
//! high-frequency cache scan re-reads every cached candidate's live state and
//! routes it through the state machine.

use crate::buckets::{buckets_for, Bucket};
use crate::cache::{Cache, CacheEntry};
use crate::error::{RegistryError, Result};
use crate::ledger::Ledger;
use crate::queue::{DiscoveryQueue, DiscoveryQueueReceiver, DiscoveryQueueSender};
use crate::registry::{
    DiscoveredRequest, ScheduledTx, SchedulerRegistry, TemporalUnit, WatchHandle, NULL_IDENTIFIER,
};
use crate::router::{Router, TxStatus};
use crate::stats::StatsStore;
use crate::txpool::TxPool;
use crate::utils::compact_error;
use crate::wallet::Wallet;
use alloy::primitives::Address;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const DISCOVERY_QUEUE_LEN: usize = 512;
/// The backfill traversal re-runs on the cache-scan cadence scaled by this.
const BACKFILL_SCAN_DELAY: u64 = 1;

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

pub struct Scanner {
    scan_interval_ms: u64,
    scan_spread: u64,
    chain_interval_ms: u64,
    ledger: Arc<dyn Ledger>,
    registry: Arc<dyn SchedulerRegistry>,
    cache: Arc<Cache>,
    router: Arc<Router>,
    wallet: Arc<Wallet>,
    stats: Arc<StatsStore>,
    txpool: Arc<TxPool>,
    // Candidates with a tick outstanding; a new tick for the same identifier
    // must not start while one is in flight.
    in_flight: Arc<StdMutex<HashSet<Address>>>,
    watchers: Mutex<HashMap<Bucket, WatchHandle>>,
    queue_tx: Mutex<Option<DiscoveryQueueSender>>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    scanning: AtomicBool,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scan_interval_ms: u64,
        scan_spread: u64,
        chain_interval_ms: u64,
        ledger: Arc<dyn Ledger>,
        registry: Arc<dyn SchedulerRegistry>,
        cache: Arc<Cache>,
        router: Arc<Router>,
        wallet: Arc<Wallet>,
        stats: Arc<StatsStore>,
        txpool: Arc<TxPool>,
    ) -> Self {
        Self {
            scan_interval_ms,
            scan_spread,
            chain_interval_ms,
            ledger,
            registry,
            cache,
            router,
            wallet,
            stats,
            txpool,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            watchers: Mutex::new(HashMap::new()),
            queue_tx: Mutex::new(None),
            shutdown: Mutex::new(None),
            scanning: AtomicBool::new(false),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<Address>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Relaxed)
    }

    pub async fn start(self: &Arc<Self>) -> Result<bool> {
        if self.is_scanning() {
            self.stop().await;
        }

        let (queue_sender, queue_receiver) = DiscoveryQueue::new(DISCOVERY_QUEUE_LEN);
        let (shutdown_tx, _) = broadcast::channel(8);

        self.txpool.start().await;
        self.spawn_dispatcher(queue_receiver, shutdown_tx.subscribe());
        self.spawn_cache_scan_loop(shutdown_tx.subscribe());

        *self.queue_tx.lock().await = Some(queue_sender);
        if self.ledger.supports_event_filters().await {
            if let Err(err) = self.watch_chain().await {
                tracing::warn!("[SCAN] Initial bucket watch failed: {}", compact_error(err));
            }
            self.spawn_chain_loop(shutdown_tx.subscribe());
            tracing::info!("[SCAN] Watching STARTED.");
        } else {
            self.spawn_backfill_loop(shutdown_tx.subscribe());
            tracing::info!("[SCAN] Log filters unsupported, backfill scanner STARTED.");
        }

        *self.shutdown.lock().await = Some(shutdown_tx);
        self.scanning.store(true, Ordering::Relaxed);
        tracing::info!("[SCAN] Scanning STARTED.");
        Ok(true)
    }

    /// Stop timers, watchers and subscriptions. The cache is left intact so
    /// a restart resumes from known candidates without rediscovery cost.
    pub async fn stop(&self) {
        if let Some(shutdown_tx) = self.shutdown.lock().await.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(queue_sender) = self.queue_tx.lock().await.take() {
            queue_sender.close().await;
        }
        self.watchers.lock().await.clear();
        self.txpool.stop().await;
        self.scanning.store(false, Ordering::Relaxed);
        tracing::info!("[SCAN] Scanning STOPPED.");
    }

    // -----------------------------------------------------------------------
    // Discovery: shared sink
    // -----------------------------------------------------------------------

    fn handle_discovered(&self, request: &DiscoveredRequest) {
        if request.address == NULL_IDENTIFIER {
            tracing::debug!("[SCAN] Null identifier discovery ignored.");
            return;
        }
        if self.cache.has(request.address) {
            return;
        }

        tracing::info!("[SCAN] Discovered {}.", request.address);
        self.cache.set(
            request.address,
            CacheEntry {
                bounty: request.bounty,
                temporal_unit: request.temporal_unit,
                claimed_by: None,
                was_called: false,
                window_start: request.window_start,
                claim_window_start: request.claim_window_start(),
                status: TxStatus::BeforeClaimWindow,
            },
        );

        for account in self.wallet.addresses() {
            if let Err(err) = self.stats.discovered(*account, request.address) {
                tracing::warn!("[SCAN] Stats write failed: {}", compact_error(err));
            }
        }
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        mut receiver: DiscoveryQueueReceiver,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    maybe_request = receiver.recv() => {
                        let Some(request) = maybe_request else { break };
                        this.handle_discovered(&request);
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Live strategy: bucket watchers
    // -----------------------------------------------------------------------

    /// Recompute the tracked buckets from the current head and diff the
    /// watcher set: new buckets gain a subscription, stale ones are dropped.
    pub async fn watch_chain(&self) -> Result<()> {
        let latest = self.ledger.latest_block().await?;
        let target = buckets_for(&latest);
        let Some(queue_sender) = self.queue_tx.lock().await.clone() else {
            return Ok(());
        };

        let mut watchers = self.watchers.lock().await;
        watchers.retain(|bucket, _| target.contains(*bucket));
        for bucket in target.all() {
            if watchers.contains_key(&bucket) {
                continue;
            }
            match self
                .registry
                .watch_bucket(bucket, queue_sender.clone())
                .await
            {
                Ok(handle) => {
                    tracing::debug!("[BUCKET] Watching {bucket:?}.");
                    watchers.insert(bucket, handle);
                }
                Err(err) => {
                    tracing::warn!(
                        "[BUCKET] Failed to watch {bucket:?}: {}",
                        compact_error(err)
                    );
                }
            }
        }
        Ok(())
    }

    fn spawn_chain_loop(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(this.chain_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.watch_chain().await {
                            tracing::warn!(
                                "[BUCKET] Watch refresh failed: {}",
                                compact_error(err)
                            );
                        }
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Backfill strategy: linked-list traversal
    // -----------------------------------------------------------------------

    /// One backfill pass: traverse the registry's index backward across the
    /// block window and forward across the timestamp window, storing every
    /// in-window candidate that is still upcoming.
    pub async fn backfill_scan(&self) -> Result<()> {
        let latest = self.ledger.latest_block().await?;
        let left_block = latest.number.saturating_sub(self.scan_spread);
        let right_block = left_block + 2 * self.scan_spread;
        let left_timestamp = self.ledger.block_by_number(left_block).await?.timestamp;
        let right_timestamp = (2 * latest.timestamp).saturating_sub(left_timestamp);

        tracing::debug!(
            "[SCAN] Backfill bounds | blocks: {left_block}..{right_block} | timestamps: {left_timestamp}..{right_timestamp}"
        );

        let first = self
            .registry
            .previous_from_right(right_block, TemporalUnit::Blocks)
            .await?;
        self.traverse(
            first,
            Direction::Backward,
            |window_start| window_start >= left_block,
            |window_start| window_start < left_block,
        )
        .await?;

        let first = self
            .registry
            .next_from_left(left_timestamp, TemporalUnit::Timestamp)
            .await?;
        self.traverse(
            first,
            Direction::Forward,
            |window_start| window_start <= right_timestamp,
            |window_start| window_start > right_timestamp,
        )
        .await?;

        Ok(())
    }

    async fn traverse(
        &self,
        first: Address,
        direction: Direction,
        should_store: impl Fn(u64) -> bool,
        at_bound: impl Fn(u64) -> bool,
    ) -> Result<()> {
        let mut current = first;
        while current != NULL_IDENTIFIER {
            let window_start = match self.cache.get(current) {
                Ok(entry) => entry.window_start,
                Err(_) => {
                    let state = self.registry.fetch_state(current).await?;
                    let tracker_window_start = self.registry.window_start_for(current).await?;
                    if tracker_window_start != state.window_start {
                        return Err(RegistryError::DataMismatch {
                            id: current,
                            tracker: tracker_window_start,
                            request: state.window_start,
                        }
                        .into());
                    }
                    if should_store(state.window_start) && state.is_upcoming() {
                        self.handle_discovered(&discovered_from_state(&state));
                    }
                    state.window_start
                }
            };

            if at_bound(window_start) {
                break;
            }

            current = match direction {
                Direction::Backward => self.registry.previous_request(current).await?,
                Direction::Forward => self.registry.next_request(current).await?,
            };
        }
        Ok(())
    }

    fn spawn_backfill_loop(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let period = this.scan_interval_ms.saturating_mul(BACKFILL_SCAN_DELAY);
            let mut ticker = tokio::time::interval(Duration::from_millis(period.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.backfill_scan().await {
                            tracing::warn!("[SCAN] Backfill pass failed: {}", compact_error(err));
                        }
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Cache scan: the engine's tick
    // -----------------------------------------------------------------------

    /// Route every cached candidate through the state machine, one task per
    /// identifier, never two ticks for the same identifier at once.
    pub async fn scan_cache(self: &Arc<Self>) {
        let ids = self.cache.stored();
        if ids.is_empty() {
            return;
        }

        for id in ids {
            if !self.lock_in_flight().insert(id) {
                continue;
            }
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = this.tick(id).await {
                    tracing::warn!("[SCAN] Tick failed for {id}: {}", compact_error(err));
                }
                this.lock_in_flight().remove(&id);
            });
        }
    }

    async fn tick(&self, id: Address) -> Result<()> {
        if !self.cache.has(id) {
            return Ok(());
        }
        let state = self.registry.fetch_state(id).await?;
        self.router.route(&state).await?;
        Ok(())
    }

    fn spawn_cache_scan_loop(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(this.scan_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => this.scan_cache().await,
                }
            }
        });
    }
}

fn discovered_from_state(state: &ScheduledTx) -> DiscoveredRequest {
    DiscoveredRequest {
        address: state.address,
        temporal_unit: state.temporal_unit,
        window_start: state.window_start,
        freeze_period_length: state.freeze_period_length,
        claim_window_size: state.claim_window_size,
        bounty: state.bounty,
    }
}
