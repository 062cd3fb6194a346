//! Node assembly and lifecycle: builds the engine out of its collaborators,
//! exposes the scanning/claiming switches and account-level reports, and
//! supervises the WS connection, rotating through configured endpoints with
//! bounded retries when the provider goes dark.

use crate::actions::Actions;
use crate::cache::Cache;
use crate::error::Result;
use crate::ledger::{Ledger, RpcLedger};
use crate::registry::OnChainRegistry;
use crate::router::Router;
use crate::scanner::Scanner;
use crate::stats::StatsStore;
use crate::strategy::{DepositAwareStrategy, GasPriceService};
use crate::txpool::TxPool;
use crate::utils::compact_error;
use crate::utils::config::Config;
use crate::wallet::{ReceiptAwaiter, RpcSender, Wallet};
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const HEALTH_POLL_INTERVAL_MS: u64 = 30_000;
const HEALTH_FAILURE_BUDGET: u32 = 3;

pub struct TimeNode {
    chain_id: u64,
    ledger: Arc<dyn Ledger>,
    cache: Arc<Cache>,
    wallet: Arc<Wallet>,
    stats: Arc<StatsStore>,
    scanner: Arc<Scanner>,
    claiming: Arc<AtomicBool>,
}

impl TimeNode {
    pub fn assemble(config: &Config, rpc: Arc<RpcLedger>) -> anyhow::Result<Self> {
        let ledger: Arc<dyn Ledger> = rpc.clone();
        let cache = Arc::new(Cache::new());
        let stats = Arc::new(StatsStore::open(&config.stats_db_path)?);
        let registry = Arc::new(OnChainRegistry::new(
            rpc.clone(),
            config.tracker_address,
            config.factory_address,
        ));
        let txpool = Arc::new(TxPool::new(rpc.clone(), ledger.clone()));
        let gas = Arc::new(GasPriceService::new(
            config.gas_price_api_url.clone(),
            ledger.clone(),
        ));
        let strategy = Arc::new(DepositAwareStrategy::new(
            config.max_claim_deposit_wei,
            config.min_claim_bounty_wei,
            gas.clone(),
        ));
        let wallet = Arc::new(Wallet::new(
            config.accounts.clone(),
            Arc::new(RpcSender::new(rpc.clone())),
            ReceiptAwaiter::new(ledger.clone(), config.confirmation_blocks),
        ));
        let claiming = Arc::new(AtomicBool::new(config.claiming_enabled));
        let actions = Arc::new(Actions::new(
            wallet.clone(),
            cache.clone(),
            stats.clone(),
            txpool.pool(),
            strategy.clone(),
            gas,
            claiming.clone(),
        ));
        let router = Arc::new(Router::new(
            cache.clone(),
            actions,
            wallet.clone(),
            strategy,
        ));
        let scanner = Arc::new(Scanner::new(
            config.scan_interval_ms,
            config.scan_spread,
            config.chain_interval_ms,
            ledger.clone(),
            registry,
            cache.clone(),
            router,
            wallet.clone(),
            stats.clone(),
            txpool,
        ));

        let node = Self {
            chain_id: config.chain_id,
            ledger,
            cache,
            wallet,
            stats,
            scanner,
            claiming,
        };
        node.startup_message();
        Ok(node)
    }

    fn startup_message(&self) {
        tracing::info!(
            "[NODE] time_warden {} operating on chain {}.",
            env!("CARGO_PKG_VERSION"),
            self.chain_id
        );
        tracing::info!(
            "[NODE] Controlling {} account(s), claiming {}.",
            self.wallet.addresses().len(),
            if self.claiming.load(Ordering::Relaxed) {
                "enabled"
            } else {
                "disabled"
            }
        );
    }

    pub async fn start_scanning(&self) -> Result<bool> {
        // A restart hard-resets the scanner.
        if self.scanner.is_scanning() {
            self.scanner.stop().await;
        }
        self.scanner.start().await
    }

    pub async fn stop_scanning(&self) {
        self.scanner.stop().await;
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn start_claiming(&self) -> bool {
        self.claiming.store(true, Ordering::Relaxed);
        true
    }

    pub fn stop_claiming(&self) -> bool {
        self.claiming.store(false, Ordering::Relaxed);
        false
    }

    /// Cached candidates claimed by each controlled account and not yet
    /// executed.
    pub fn claimed_not_executed(&self) -> HashMap<Address, Vec<Address>> {
        let mut report: HashMap<Address, Vec<Address>> = self
            .wallet
            .addresses()
            .iter()
            .map(|account| (*account, Vec::new()))
            .collect();

        for id in self.cache.stored() {
            let Ok(entry) = self.cache.get(id) else {
                continue;
            };
            let Some(claimer) = entry.claimed_by else {
                continue;
            };
            if entry.was_called {
                continue;
            }
            if let Some(bucket) = report.get_mut(&claimer) {
                bucket.push(id);
            }
        }
        report
    }

    /// Failed claim attempts per controlled account, from the stats ledger.
    pub fn unsuccessful_claims(&self) -> HashMap<Address, Vec<Address>> {
        self.wallet
            .addresses()
            .iter()
            .map(|account| {
                let failed = self.stats.failed_claims(*account).unwrap_or_default();
                (*account, failed)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Connection supervision
// ---------------------------------------------------------------------------

async fn connect(url: &str) -> Result<Arc<RpcLedger>> {
    let provider = ProviderBuilder::new()
        .connect_ws(WsConnect::new(url))
        .await
        .map_err(|err| crate::error::RpcError::Transport(compact_error(err)))?;
    Ok(Arc::new(RpcLedger::new(provider.erased())))
}

/// Run the node against the configured endpoints until `shutdown` fires.
///
/// On sustained health-check failure the current node is stopped (cache
/// intact, in-flight submissions tracked to completion by their own tasks)
/// and scanning restarts against the next endpoint after a linear backoff.
/// Exceeding the retry budget without a successful reconnect gives up.
pub async fn run_supervised(
    config: Config,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut tries: u32 = 0;

    loop {
        let url = &config.ws_urls[(tries as usize) % config.ws_urls.len()];
        tracing::info!("[NODE] Connecting to {url}...");

        match connect(url).await {
            Ok(rpc) => {
                let node = TimeNode::assemble(&config, rpc)?;
                if let Err(err) = node.start_scanning().await {
                    tracing::error!("[NODE] Start failed: {}", compact_error(err));
                } else {
                    tries = 0;
                    let mut failures: u32 = 0;
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                node.stop_scanning().await;
                                tracing::info!("[NODE] Shutdown complete.");
                                return Ok(());
                            }
                            _ = tokio::time::sleep(Duration::from_millis(HEALTH_POLL_INTERVAL_MS)) => {
                                match node.ledger.latest_block().await {
                                    Ok(_) => failures = 0,
                                    Err(err) => {
                                        failures += 1;
                                        tracing::warn!(
                                            "[NODE] Health check {failures}/{HEALTH_FAILURE_BUDGET} failed: {}",
                                            compact_error(err)
                                        );
                                    }
                                }
                                if failures >= HEALTH_FAILURE_BUDGET {
                                    tracing::warn!("[NODE] Connection unhealthy, reconnecting.");
                                    node.stop_scanning().await;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!("[NODE] Connect failed: {}", compact_error(err));
            }
        }

        tries += 1;
        if tries >= config.max_reconnect_tries {
            anyhow::bail!("gave up after {tries} reconnect attempts");
        }
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(u64::from(tries))) => {}
        }
    }
}
