//! Account pool and submission tracking. Key management and signing live
//! behind the `TransactionSender` seam (the node holds the keys); what this
//! module owns is the part the engine's correctness depends on: atomic
//! check-and-claim of a free account, per-account pending bookkeeping, and
//! waiting out confirmations before a receipt is trusted.

use crate::error::{Result, RpcError};
use crate::ledger::{Ledger, RpcLedger, TxReceipt};
use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const RECEIPT_POLL_INTERVAL_MS: u64 = 3_000;
const RECEIPT_MAX_POLLS: u32 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOpts {
    pub to: Address,
    pub value: U256,
    pub gas: u64,
    pub gas_price: U256,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    WalletBusy,
    InProgress,
}

#[derive(Debug, Clone)]
pub struct WalletReceipt {
    pub receipt: Option<TxReceipt>,
    pub from: Address,
    pub status: SendStatus,
}

/// Signs and submits a transaction from one of the controlled accounts.
#[async_trait]
pub trait TransactionSender: Send + Sync {
    async fn send(&self, from: Address, opts: &TxOpts) -> Result<B256>;
}

/// Sender for node-managed accounts: delegates signing to the connected node
/// via `eth_sendTransaction`.
pub struct RpcSender {
    rpc: Arc<RpcLedger>,
}

impl RpcSender {
    pub fn new(rpc: Arc<RpcLedger>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl TransactionSender for RpcSender {
    async fn send(&self, from: Address, opts: &TxOpts) -> Result<B256> {
        self.rpc
            .raw(
                "eth_sendTransaction",
                (json!({
                    "from": from,
                    "to": opts.to,
                    "value": opts.value,
                    "gas": U256::from(opts.gas),
                    "gasPrice": opts.gas_price,
                    "data": opts.data,
                }),),
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Receipt awaiter
// ---------------------------------------------------------------------------

/// Bounded receipt poll: a receipt counts as final only once it is buried
/// under the configured confirmation depth and the transaction still reports
/// a block number when re-fetched (an uncle'd inclusion does not).
pub struct ReceiptAwaiter {
    ledger: Arc<dyn Ledger>,
    confirmation_blocks: u64,
    poll_interval_ms: u64,
    max_polls: u32,
}

impl ReceiptAwaiter {
    pub fn new(ledger: Arc<dyn Ledger>, confirmation_blocks: u64) -> Self {
        Self {
            ledger,
            confirmation_blocks,
            poll_interval_ms: RECEIPT_POLL_INTERVAL_MS,
            max_polls: RECEIPT_MAX_POLLS,
        }
    }

    /// Override the poll cadence; the defaults suit mainnet block times.
    pub fn with_poll_interval(mut self, interval_ms: u64, max_polls: u32) -> Self {
        self.poll_interval_ms = interval_ms;
        self.max_polls = max_polls;
        self
    }

    pub async fn wait_for_confirmations(&self, hash: B256) -> Result<TxReceipt> {
        for _ in 0..self.max_polls {
            if let Some(receipt) = self.ledger.receipt(hash).await? {
                if let Some(included_at) = receipt.block_number {
                    let latest = self.ledger.latest_block().await?;
                    if latest.number.saturating_sub(included_at) >= self.confirmation_blocks {
                        let still_canonical = self
                            .ledger
                            .transaction(hash)
                            .await?
                            .map(|tx| tx.block_number.is_some())
                            .unwrap_or(false);
                        if !still_canonical {
                            return Err(RpcError::Uncle(hash).into());
                        }
                        return Ok(receipt);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(self.poll_interval_ms)).await;
        }
        Err(RpcError::ReceiptTimeout {
            hash,
            polls: self.max_polls,
        }
        .into())
    }
}

// ---------------------------------------------------------------------------
// Account pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PendingSubmission {
    to: Address,
    hash: Option<B256>,
}

pub struct Wallet {
    accounts: Vec<Address>,
    // One slot per account; Some while a submission is outstanding. The
    // free-account check and the claim must happen under one lock or two
    // concurrent dispatches could pick the same account and collide on nonce.
    states: Mutex<Vec<Option<PendingSubmission>>>,
    sender: Arc<dyn TransactionSender>,
    awaiter: ReceiptAwaiter,
}

impl Wallet {
    pub fn new(
        accounts: Vec<Address>,
        sender: Arc<dyn TransactionSender>,
        awaiter: ReceiptAwaiter,
    ) -> Self {
        let states = Mutex::new(vec![None; accounts.len()]);
        Self {
            accounts,
            states,
            sender,
            awaiter,
        }
    }

    fn lock_states(&self) -> MutexGuard<'_, Vec<Option<PendingSubmission>>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.accounts
    }

    pub fn is_known_address(&self, address: Address) -> bool {
        self.accounts.contains(&address)
    }

    pub fn index_of(&self, address: Address) -> Option<usize> {
        self.accounts.iter().position(|a| *a == address)
    }

    /// Whether any controlled account has an unconfirmed submission targeting
    /// this candidate.
    pub fn has_pending_transaction(&self, candidate: Address) -> bool {
        self.lock_states()
            .iter()
            .flatten()
            .any(|pending| pending.to == candidate)
    }

    pub fn is_next_account_free(&self) -> bool {
        self.lock_states().iter().any(|slot| slot.is_none())
    }

    fn reserve_next(&self, to: Address) -> Option<usize> {
        let mut states = self.lock_states();
        let index = states.iter().position(|slot| slot.is_none())?;
        states[index] = Some(PendingSubmission { to, hash: None });
        Some(index)
    }

    fn reserve_index(&self, index: usize, to: Address) -> bool {
        let mut states = self.lock_states();
        match states.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(PendingSubmission { to, hash: None });
                true
            }
            _ => false,
        }
    }

    fn record_hash(&self, index: usize, hash: B256) {
        if let Some(Some(pending)) = self.lock_states().get_mut(index) {
            pending.hash = Some(hash);
        }
    }

    fn release(&self, index: usize) {
        if let Some(slot) = self.lock_states().get_mut(index) {
            *slot = None;
        }
    }

    pub async fn send_from_next(&self, opts: &TxOpts) -> Result<WalletReceipt> {
        let Some(index) = self.reserve_next(opts.to) else {
            return Ok(WalletReceipt {
                receipt: None,
                from: Address::ZERO,
                status: SendStatus::WalletBusy,
            });
        };
        self.submit(index, opts).await
    }

    pub async fn send_from_index(&self, index: usize, opts: &TxOpts) -> Result<WalletReceipt> {
        if index >= self.accounts.len() {
            return Ok(WalletReceipt {
                receipt: None,
                from: Address::ZERO,
                status: SendStatus::WalletBusy,
            });
        }
        if !self.reserve_index(index, opts.to) {
            return Ok(WalletReceipt {
                receipt: None,
                from: self.accounts[index],
                status: SendStatus::InProgress,
            });
        }
        self.submit(index, opts).await
    }

    async fn submit(&self, index: usize, opts: &TxOpts) -> Result<WalletReceipt> {
        let from = self.accounts[index];
        let hash = match self.sender.send(from, opts).await {
            Ok(hash) => hash,
            Err(err) => {
                self.release(index);
                return Err(err);
            }
        };
        self.record_hash(index, hash);
        tracing::debug!("[WALLET] Submitted {hash} from {from}.");

        let result = self.awaiter.wait_for_confirmations(hash).await;
        self.release(index);
        let receipt = result?;
        Ok(WalletReceipt {
            receipt: Some(receipt),
            from,
            status: SendStatus::Ok,
        })
    }
}
