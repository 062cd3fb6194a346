use crate::ledger::{Ledger, RpcLedger};
use crate::utils::{compact_error, now_ms};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::Provider;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

/// Entries older than this are pruned even without a mined-confirmation
/// observation, so a dropped transaction cannot pin pool memory forever.
const POOL_ENTRY_TTL_MS: u64 = 10 * 60 * 1_000;

/// A transaction our own connection has observed as mempool-pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub gas_price: U256,
    pub seen_ms: u64,
}

/// Hash-keyed index of observed pending transactions. Only ever consulted
/// for existence checks; multiple competing agents may be racing for the
/// same candidate, and submitting behind an equivalent pending call wastes
/// gas with no benefit.
#[derive(Default)]
pub struct Pool {
    entries: DashMap<B256, PoolEntry>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entry: PoolEntry) -> bool {
        if self.entries.contains_key(&entry.hash) {
            return false;
        }
        self.entries.insert(entry.hash, entry);
        true
    }

    pub fn has_hash(&self, hash: B256) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn del(&self, hash: B256) {
        self.entries.remove(&hash);
    }

    pub fn wipe(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stored(&self) -> Vec<B256> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Whether an equivalent call is already pending: same destination, same
    /// function selector, and (for executions) at least the given gas price.
    pub fn has_pending(&self, to: Address, selector: [u8; 4], min_gas_price: Option<U256>) -> bool {
        self.entries.iter().any(|entry| {
            entry.to == Some(to)
                && entry.input.len() >= 4
                && entry.input[..4] == selector
                && min_gas_price
                    .map(|min| entry.gas_price >= min)
                    .unwrap_or(true)
        })
    }

    fn prune_older_than(&self, cutoff_ms: u64) {
        self.entries.retain(|_, entry| entry.seen_ms >= cutoff_ms);
    }
}

/// Watches the connection's pending-transaction and new-block streams to keep
/// the pool current: pending hashes are hydrated and inserted, mined hashes
/// are deleted.
pub struct TxPool {
    pool: Arc<Pool>,
    rpc: Arc<RpcLedger>,
    ledger: Arc<dyn Ledger>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

impl TxPool {
    pub fn new(rpc: Arc<RpcLedger>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            pool: Arc::new(Pool::new()),
            rpc,
            ledger,
            shutdown: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool)
    }

    pub async fn running(&self) -> bool {
        self.shutdown.lock().await.is_some()
    }

    pub async fn start(&self) {
        if self.running().await {
            self.stop().await;
        }
        let (shutdown_tx, _) = broadcast::channel(4);
        self.spawn_pending_watcher(shutdown_tx.subscribe()).await;
        self.spawn_mined_watcher(shutdown_tx.subscribe()).await;
        *self.shutdown.lock().await = Some(shutdown_tx);
        tracing::info!("[POOL] Pending-transaction watch started.");
    }

    pub async fn stop(&self) {
        if let Some(shutdown_tx) = self.shutdown.lock().await.take() {
            let _ = shutdown_tx.send(());
            tracing::info!("[POOL] Pending-transaction watch stopped.");
        }
        self.pool.wipe();
    }

    async fn spawn_pending_watcher(&self, mut shutdown: broadcast::Receiver<()>) {
        let pool = Arc::clone(&self.pool);
        let ledger = Arc::clone(&self.ledger);
        let provider = self.rpc.provider().clone();

        tokio::spawn(async move {
            let subscription = match provider.subscribe_pending_transactions().await {
                Ok(sub) => sub,
                Err(err) => {
                    tracing::warn!(
                        "[POOL] Pending-tx subscription unavailable: {}",
                        compact_error(err)
                    );
                    return;
                }
            };
            let mut stream = subscription.into_stream();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    maybe_hash = stream.next() => {
                        let Some(hash) = maybe_hash else { break };
                        if pool.has_hash(hash) {
                            continue;
                        }
                        match ledger.transaction(hash).await {
                            Ok(Some(tx)) if tx.block_number.is_none() => {
                                pool.set(PoolEntry {
                                    hash: tx.hash,
                                    from: tx.from,
                                    to: tx.to,
                                    input: tx.input,
                                    gas_price: tx.gas_price,
                                    seen_ms: now_ms(),
                                });
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::debug!(
                                    "[POOL] Pending-tx hydration failed: {}",
                                    compact_error(err)
                                );
                            }
                        }
                    }
                }
            }
        });
    }

    async fn spawn_mined_watcher(&self, mut shutdown: broadcast::Receiver<()>) {
        let pool = Arc::clone(&self.pool);
        let ledger = Arc::clone(&self.ledger);
        let provider = self.rpc.provider().clone();

        tokio::spawn(async move {
            let subscription = match provider.subscribe_blocks().await {
                Ok(sub) => sub,
                Err(err) => {
                    tracing::warn!(
                        "[POOL] Head subscription unavailable: {}",
                        compact_error(err)
                    );
                    return;
                }
            };
            let mut stream = subscription.into_stream();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    maybe_header = stream.next() => {
                        let Some(_header) = maybe_header else { break };
                        for hash in pool.stored() {
                            match ledger.transaction(hash).await {
                                Ok(Some(tx)) if tx.block_number.is_some() => pool.del(hash),
                                Ok(None) => pool.del(hash),
                                Ok(_) => {}
                                Err(err) => {
                                    tracing::debug!(
                                        "[POOL] Mined check failed for {hash}: {}",
                                        compact_error(err)
                                    );
                                }
                            }
                        }
                        pool.prune_older_than(now_ms().saturating_sub(POOL_ENTRY_TTL_MS));
                    }
                }
            }
        });
    }
}
