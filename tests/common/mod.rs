//! Shared in-memory collaborators for the integration suites.

#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time_warden::actions::Actions;
use time_warden::buckets::{calc_bucket, Bucket};
use time_warden::cache::Cache;
use time_warden::error::{RegistryError, Result};
use time_warden::ledger::{BlockRef, Ledger, PoolTx, RpcLedger, TxReceipt};
use time_warden::queue::DiscoveryQueueSender;
use time_warden::registry::{
    ScheduledTx, SchedulerRegistry, TemporalUnit, WatchHandle, NULL_IDENTIFIER,
};
use time_warden::router::Router;
use time_warden::scanner::Scanner;
use time_warden::stats::StatsStore;
use time_warden::strategy::EconomicStrategy;
use time_warden::txpool::{Pool, TxPool};
use time_warden::wallet::{ReceiptAwaiter, TransactionSender, TxOpts, Wallet};

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct MockLedger {
    pub block: Mutex<BlockRef>,
    pub blocks_by_number: Mutex<HashMap<u64, BlockRef>>,
    pub receipts: Mutex<HashMap<B256, TxReceipt>>,
    pub transactions: Mutex<HashMap<B256, PoolTx>>,
    pub gas_price: U256,
    pub event_filters: bool,
}

impl MockLedger {
    pub fn new(number: u64, timestamp: u64) -> Self {
        Self {
            block: Mutex::new(BlockRef { number, timestamp }),
            blocks_by_number: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            gas_price: U256::from(20_000_000_000u64),
            event_filters: false,
        }
    }

    pub fn put_receipt(&self, receipt: TxReceipt, from: Address, to: Address) {
        let hash = receipt.transaction_hash;
        let block_number = receipt.block_number;
        self.receipts.lock().expect("lock").insert(hash, receipt);
        self.transactions.lock().expect("lock").insert(
            hash,
            PoolTx {
                hash,
                from,
                to: Some(to),
                input: Bytes::new(),
                gas_price: U256::ZERO,
                block_number,
            },
        );
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn latest_block(&self) -> Result<BlockRef> {
        Ok(*self.block.lock().expect("lock"))
    }

    async fn block_by_number(&self, number: u64) -> Result<BlockRef> {
        let known = self.blocks_by_number.lock().expect("lock").get(&number).copied();
        Ok(known.unwrap_or(BlockRef {
            number,
            timestamp: number * 15,
        }))
    }

    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        Ok(self.receipts.lock().expect("lock").get(&hash).cloned())
    }

    async fn transaction(&self, hash: B256) -> Result<Option<PoolTx>> {
        Ok(self.transactions.lock().expect("lock").get(&hash).cloned())
    }

    async fn network_gas_price(&self) -> Result<U256> {
        Ok(self.gas_price)
    }

    async fn supports_event_filters(&self) -> bool {
        self.event_filters
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockRegistry {
    pub states: Mutex<HashMap<Address, ScheduledTx>>,
    /// Identifiers ordered by ascending window start; the linked list.
    pub chain: Mutex<Vec<Address>>,
    /// Tracker-side window starts that disagree with the request state.
    pub tracker_overrides: Mutex<HashMap<Address, u64>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: ScheduledTx) {
        let id = state.address;
        let window_start = state.window_start;
        self.states.lock().expect("lock").insert(id, state);
        let mut chain = self.chain.lock().expect("lock");
        chain.retain(|existing| *existing != id);
        let position = chain
            .iter()
            .position(|existing| {
                let states = self.states.lock().expect("lock");
                states
                    .get(existing)
                    .map(|s| s.window_start > window_start)
                    .unwrap_or(false)
            })
            .unwrap_or(chain.len());
        chain.insert(position, id);
    }

    pub fn set_state(&self, state: ScheduledTx) {
        self.states
            .lock()
            .expect("lock")
            .insert(state.address, state);
    }

    fn position(&self, id: Address) -> Option<usize> {
        self.chain
            .lock()
            .expect("lock")
            .iter()
            .position(|existing| *existing == id)
    }
}

#[async_trait]
impl SchedulerRegistry for MockRegistry {
    async fn previous_request(&self, id: Address) -> Result<Address> {
        let Some(position) = self.position(id) else {
            return Ok(NULL_IDENTIFIER);
        };
        if position == 0 {
            return Ok(NULL_IDENTIFIER);
        }
        Ok(self.chain.lock().expect("lock")[position - 1])
    }

    async fn next_request(&self, id: Address) -> Result<Address> {
        let Some(position) = self.position(id) else {
            return Ok(NULL_IDENTIFIER);
        };
        let chain = self.chain.lock().expect("lock");
        Ok(chain.get(position + 1).copied().unwrap_or(NULL_IDENTIFIER))
    }

    async fn previous_from_right(&self, bound: u64, unit: TemporalUnit) -> Result<Address> {
        let chain = self.chain.lock().expect("lock");
        let states = self.states.lock().expect("lock");
        Ok(chain
            .iter()
            .rev()
            .find(|id| {
                states
                    .get(*id)
                    .map(|s| s.temporal_unit == unit && s.window_start <= bound)
                    .unwrap_or(false)
            })
            .copied()
            .unwrap_or(NULL_IDENTIFIER))
    }

    async fn next_from_left(&self, bound: u64, unit: TemporalUnit) -> Result<Address> {
        let chain = self.chain.lock().expect("lock");
        let states = self.states.lock().expect("lock");
        Ok(chain
            .iter()
            .find(|id| {
                states
                    .get(*id)
                    .map(|s| s.temporal_unit == unit && s.window_start >= bound)
                    .unwrap_or(false)
            })
            .copied()
            .unwrap_or(NULL_IDENTIFIER))
    }

    async fn window_start_for(&self, id: Address) -> Result<u64> {
        if let Some(window_start) = self.tracker_overrides.lock().expect("lock").get(&id) {
            return Ok(*window_start);
        }
        self.states
            .lock()
            .expect("lock")
            .get(&id)
            .map(|s| s.window_start)
            .ok_or_else(|| RegistryError::MalformedPayload(format!("unknown request {id}")).into())
    }

    async fn requests_in_bucket(&self, bucket: Bucket) -> Result<Vec<Address>> {
        let states = self.states.lock().expect("lock");
        Ok(states
            .values()
            .filter(|s| calc_bucket(s.window_start, s.temporal_unit) == bucket)
            .map(|s| s.address)
            .collect())
    }

    async fn fetch_state(&self, id: Address) -> Result<ScheduledTx> {
        self.states
            .lock()
            .expect("lock")
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::MalformedPayload(format!("unknown request {id}")).into())
    }

    async fn watch_bucket(
        &self,
        _bucket: Bucket,
        _queue: DiscoveryQueueSender,
    ) -> Result<WatchHandle> {
        Ok(WatchHandle::new(tokio::spawn(async {})))
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

pub struct MockSender {
    pub ledger: Arc<MockLedger>,
    pub sends: Mutex<Vec<(Address, TxOpts)>>,
    pub scripted_receipts: Mutex<VecDeque<TxReceipt>>,
    /// When set, a send registers no receipt; the test provides it later.
    pub hold_receipts: AtomicBool,
    next_nonce: AtomicU64,
}

impl MockSender {
    pub fn new(ledger: Arc<MockLedger>) -> Self {
        Self {
            ledger,
            sends: Mutex::new(Vec::new()),
            scripted_receipts: Mutex::new(VecDeque::new()),
            hold_receipts: AtomicBool::new(false),
            next_nonce: AtomicU64::new(1),
        }
    }

    pub fn script_receipt(&self, receipt: TxReceipt) {
        self.scripted_receipts
            .lock()
            .expect("lock")
            .push_back(receipt);
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().expect("lock").len()
    }
}

#[async_trait]
impl TransactionSender for MockSender {
    async fn send(&self, from: Address, opts: &TxOpts) -> Result<B256> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::SeqCst);
        let hash = B256::from(U256::from(nonce));
        self.sends
            .lock()
            .expect("lock")
            .push((from, opts.clone()));

        if !self.hold_receipts.load(Ordering::SeqCst) {
            let mut receipt = self
                .scripted_receipts
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(TxReceipt {
                    transaction_hash: hash,
                    block_number: Some(1),
                    succeeded: true,
                    gas_used: U256::from(90_000),
                    logs: Vec::new(),
                });
            receipt.transaction_hash = hash;
            self.ledger.put_receipt(receipt, from, opts.to);
        }
        Ok(hash)
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub struct ScriptedStrategy {
    pub claim: bool,
}

#[async_trait]
impl EconomicStrategy for ScriptedStrategy {
    async fn should_claim(&self, _candidate: &ScheduledTx) -> bool {
        self.claim
    }

    async fn execution_gas_price(&self, candidate: &ScheduledTx) -> Result<U256> {
        Ok(candidate.gas_price)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub ledger: Arc<MockLedger>,
    pub registry: Arc<MockRegistry>,
    pub cache: Arc<Cache>,
    pub stats: Arc<StatsStore>,
    pub pool: Arc<Pool>,
    pub sender: Arc<MockSender>,
    pub wallet: Arc<Wallet>,
    pub actions: Arc<Actions>,
    pub router: Arc<Router>,
    pub claiming: Arc<AtomicBool>,
}

/// A TxPool over a never-connected provider; fine as long as the test never
/// starts its subscriptions.
fn detached_txpool(ledger: Arc<dyn Ledger>) -> Arc<TxPool> {
    let url: reqwest::Url = "http://127.0.0.1:1".parse().expect("url");
    let provider = ProviderBuilder::new().connect_http(url);
    Arc::new(TxPool::new(
        Arc::new(RpcLedger::new(provider.erased())),
        ledger,
    ))
}

pub fn harness(accounts: Vec<Address>, should_claim: bool, claiming_enabled: bool) -> Harness {
    let ledger = Arc::new(MockLedger::new(100, 1_700_000_000));
    let registry = Arc::new(MockRegistry::new());
    let cache = Arc::new(Cache::new());
    let stats = Arc::new(StatsStore::open_in_memory().expect("stats"));
    let pool = Arc::new(Pool::new());
    let sender = Arc::new(MockSender::new(ledger.clone()));

    let ledger_dyn: Arc<dyn Ledger> = ledger.clone();
    let gas = Arc::new(time_warden::strategy::GasPriceService::new(
        None,
        ledger_dyn.clone(),
    ));
    let strategy: Arc<dyn EconomicStrategy> = Arc::new(ScriptedStrategy {
        claim: should_claim,
    });
    let awaiter = ReceiptAwaiter::new(ledger_dyn.clone(), 0).with_poll_interval(5, 50);
    let wallet = Arc::new(Wallet::new(accounts, sender.clone(), awaiter));
    let claiming = Arc::new(AtomicBool::new(claiming_enabled));
    let actions = Arc::new(Actions::new(
        wallet.clone(),
        cache.clone(),
        stats.clone(),
        pool.clone(),
        strategy.clone(),
        gas,
        claiming.clone(),
    ));
    let router = Arc::new(Router::new(
        cache.clone(),
        actions.clone(),
        wallet.clone(),
        strategy,
    ));

    Harness {
        ledger,
        registry,
        cache,
        stats,
        pool,
        sender,
        wallet,
        actions,
        router,
        claiming,
    }
}

pub fn scanner_for(harness: &Harness, scan_spread: u64) -> Arc<Scanner> {
    let ledger_dyn: Arc<dyn Ledger> = harness.ledger.clone();
    Arc::new(Scanner::new(
        50,
        scan_spread,
        60_000,
        ledger_dyn.clone(),
        harness.registry.clone(),
        harness.cache.clone(),
        harness.router.clone(),
        harness.wallet.clone(),
        harness.stats.clone(),
        detached_txpool(ledger_dyn),
    ))
}

// ---------------------------------------------------------------------------
// Candidate builders
// ---------------------------------------------------------------------------

pub fn block_candidate(address: Address, window_start: u64, now: u64) -> ScheduledTx {
    ScheduledTx {
        address,
        temporal_unit: TemporalUnit::Blocks,
        window_start,
        window_end: window_start + 50,
        freeze_period_length: 10,
        claim_window_size: 30,
        reserved_window_size: 16,
        bounty: U256::from(1_000_000u64),
        required_deposit: U256::from(100),
        claimed_by: NULL_IDENTIFIER,
        was_called: false,
        is_cancelled: false,
        owner: Address::ZERO,
        gas_price: U256::from(20_000_000_000u64),
        call_gas: U256::from(50_000),
        now,
    }
}

pub fn cache_entry_for(candidate: &ScheduledTx) -> time_warden::cache::CacheEntry {
    time_warden::cache::CacheEntry {
        bounty: candidate.bounty,
        temporal_unit: candidate.temporal_unit,
        claimed_by: if candidate.claimed_by == NULL_IDENTIFIER {
            None
        } else {
            Some(candidate.claimed_by)
        },
        was_called: candidate.was_called,
        window_start: candidate.window_start,
        claim_window_start: candidate.claim_window_start(),
        status: time_warden::router::TxStatus::BeforeClaimWindow,
    }
}
