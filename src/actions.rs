//! Claim / execute dispatch.
//!
//! Both operations are idempotent with respect to repeated Router invocation:
//! while a submission for a candidate is outstanding anywhere — a controlled
//! account's pending slot or the observed mempool — they short-circuit with a
//! backpressure status instead of submitting again.

use crate::cache::Cache;
use crate::ledger::TxReceipt;
use crate::registry::ScheduledTx;
use crate::stats::StatsStore;
use crate::strategy::{EconomicStrategy, GasPriceService};
use crate::txpool::Pool;
use crate::utils::compact_error;
use crate::wallet::{SendStatus, TxOpts, Wallet, WalletReceipt};
use alloy::primitives::{b256, keccak256, Bytes, B256, U256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Topic emitted by a request that was successfully executed; the bounty paid
/// out is the first word of the log data.
pub const EXECUTED_LOG_TOPIC: B256 =
    b256!("3e504bb8b225ad41f613b0c3c4205cdd752d1615b4d77cd1773417282fcfb5d9");
/// Topic emitted when a request aborts the execution attempt; the abort
/// reason code is the first word of the log data.
pub const ABORTED_LOG_TOPIC: B256 =
    b256!("c008bc849b42227c61d5063a1313ce509a6e99211bfd59e827e417be6c65c81b");

const CLAIM_GAS: u64 = 120_000;
const EXECUTE_GAS_OVERHEAD: u64 = 180_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    NotEnabled,
    InProgress,
    WalletBusy,
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    WasCancelled,
    AlreadyCalled,
    BeforeCallWindow,
    AfterCallWindow,
    ReservedForClaimer,
    InsufficientGas,
    TooLowGasPrice,
    Unknown,
}

impl AbortReason {
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => Self::WasCancelled,
            1 => Self::AlreadyCalled,
            2 => Self::BeforeCallWindow,
            3 => Self::AfterCallWindow,
            4 => Self::ReservedForClaimer,
            5 => Self::InsufficientGas,
            6 => Self::TooLowGasPrice,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteStatus {
    InProgress,
    WalletBusy,
    Pending,
    Success,
    Aborted(AbortReason),
    Failed,
}

pub fn claim_selector() -> [u8; 4] {
    let hash = keccak256("claim()".as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn execute_selector() -> [u8; 4] {
    let hash = keccak256("execute()".as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Gas limit for an execution: the candidate's declared call gas plus the
/// wrapper's fixed overhead, scaled by 65/64 for the outer call's own cost.
pub fn execution_gas_amount(call_gas: U256) -> u64 {
    let padded = call_gas.saturating_add(U256::from(EXECUTE_GAS_OVERHEAD));
    let scaled = padded.saturating_mul(U256::from(65u64)) / U256::from(64u64);
    if scaled > U256::from(u64::MAX) {
        u64::MAX
    } else {
        scaled.to::<u64>()
    }
}

/// Find the executed signal in a receipt and decode the paid bounty.
pub fn decode_executed_bounty(receipt: &TxReceipt) -> Option<U256> {
    let log = receipt
        .logs
        .iter()
        .find(|log| log.topics.contains(&EXECUTED_LOG_TOPIC))?;
    let word = log.data.get(..32)?;
    Some(U256::from_be_slice(word))
}

/// Find the aborted signal in a receipt and classify the reason.
pub fn decode_abort_reason(receipt: &TxReceipt) -> Option<AbortReason> {
    let log = receipt
        .logs
        .iter()
        .find(|log| log.topics.contains(&ABORTED_LOG_TOPIC))?;
    let word = log.data.get(..32)?;
    let code = U256::from_be_slice(word);
    if code > U256::from(u64::MAX) {
        return Some(AbortReason::Unknown);
    }
    Some(AbortReason::from_code(code.to::<u64>()))
}

pub struct Actions {
    wallet: Arc<Wallet>,
    cache: Arc<Cache>,
    stats: Arc<StatsStore>,
    pool: Arc<Pool>,
    strategy: Arc<dyn EconomicStrategy>,
    gas: Arc<GasPriceService>,
    claiming: Arc<AtomicBool>,
}

impl Actions {
    pub fn new(
        wallet: Arc<Wallet>,
        cache: Arc<Cache>,
        stats: Arc<StatsStore>,
        pool: Arc<Pool>,
        strategy: Arc<dyn EconomicStrategy>,
        gas: Arc<GasPriceService>,
        claiming: Arc<AtomicBool>,
    ) -> Self {
        Self {
            wallet,
            cache,
            stats,
            pool,
            strategy,
            gas,
            claiming,
        }
    }

    pub async fn claim(&self, candidate: &ScheduledTx) -> ClaimStatus {
        if !self.claiming.load(Ordering::Relaxed) {
            return ClaimStatus::NotEnabled;
        }
        if self.wallet.has_pending_transaction(candidate.address) {
            return ClaimStatus::InProgress;
        }
        if !self.wallet.is_next_account_free() {
            return ClaimStatus::WalletBusy;
        }
        if self
            .pool
            .has_pending(candidate.address, claim_selector(), None)
        {
            return ClaimStatus::Pending;
        }

        let gas_price = match self.gas.network_gas_price().await {
            Ok(price) => price,
            Err(err) => {
                tracing::error!("[CLAIM] Gas price unavailable: {}", compact_error(err));
                return ClaimStatus::Failed;
            }
        };
        let opts = TxOpts {
            to: candidate.address,
            value: candidate.required_deposit,
            gas: CLAIM_GAS,
            gas_price,
            data: Bytes::from(claim_selector().to_vec()),
        };

        tracing::info!("[CLAIM] Claiming {}...", candidate.address);
        let sent = match self.wallet.send_from_next(&opts).await {
            Ok(sent) => sent,
            Err(err) => {
                tracing::error!(
                    "[CLAIM] Submission failed for {}: {}",
                    candidate.address,
                    compact_error(err)
                );
                return ClaimStatus::Failed;
            }
        };

        match sent.status {
            SendStatus::WalletBusy => ClaimStatus::WalletBusy,
            SendStatus::InProgress => ClaimStatus::InProgress,
            SendStatus::Ok => self.settle_claim(candidate, &sent, gas_price),
        }
    }

    fn settle_claim(
        &self,
        candidate: &ScheduledTx,
        sent: &WalletReceipt,
        gas_price: U256,
    ) -> ClaimStatus {
        let Some(receipt) = sent.receipt.as_ref() else {
            return ClaimStatus::Failed;
        };

        let cost = receipt.gas_used.saturating_mul(gas_price);
        if let Err(err) = self.stats.update_claimed(sent.from, candidate.address, cost) {
            tracing::warn!("[CLAIM] Stats write failed: {}", compact_error(err));
        }

        if receipt.succeeded {
            self.cache.update(candidate.address, |entry| {
                entry.claimed_by = Some(sent.from);
            });
            tracing::info!("[CLAIM] {} claimed by {}.", candidate.address, sent.from);
            ClaimStatus::Success
        } else {
            if let Err(err) = self.stats.add_failed_claim(sent.from, candidate.address) {
                tracing::warn!("[CLAIM] Stats write failed: {}", compact_error(err));
            }
            tracing::warn!("[CLAIM] Claim of {} reverted.", candidate.address);
            ClaimStatus::Failed
        }
    }

    pub async fn execute(&self, candidate: &ScheduledTx) -> ExecuteStatus {
        if self.wallet.has_pending_transaction(candidate.address) {
            return ExecuteStatus::InProgress;
        }
        if !self.wallet.is_next_account_free() {
            return ExecuteStatus::WalletBusy;
        }

        let gas_price = match self.strategy.execution_gas_price(candidate).await {
            Ok(price) => price,
            Err(err) => {
                tracing::error!("[EXEC] Gas price unavailable: {}", compact_error(err));
                return ExecuteStatus::Failed;
            }
        };
        let opts = TxOpts {
            to: candidate.address,
            value: U256::ZERO,
            gas: execution_gas_amount(candidate.call_gas),
            gas_price,
            data: Bytes::from(execute_selector().to_vec()),
        };

        let claimer_index = self.wallet.index_of(candidate.claimed_by);
        let sent = if let (Some(index), true) = (claimer_index, candidate.in_reserved_window()) {
            tracing::debug!(
                "[EXEC] {} claimed by local account {index}, executing in reserved window.",
                candidate.address
            );
            self.wallet.send_from_index(index, &opts).await
        } else if !self.pool.has_pending(
            candidate.address,
            execute_selector(),
            Some(candidate.gas_price),
        ) {
            tracing::info!("[EXEC] Executing {}...", candidate.address);
            self.wallet.send_from_next(&opts).await
        } else {
            return ExecuteStatus::Pending;
        };

        let sent = match sent {
            Ok(sent) => sent,
            Err(err) => {
                tracing::error!(
                    "[EXEC] Submission failed for {}: {}",
                    candidate.address,
                    compact_error(err)
                );
                return ExecuteStatus::Failed;
            }
        };

        match sent.status {
            SendStatus::WalletBusy => ExecuteStatus::WalletBusy,
            SendStatus::InProgress => ExecuteStatus::InProgress,
            SendStatus::Ok => self.settle_execution(candidate, &sent, gas_price),
        }
    }

    fn settle_execution(
        &self,
        candidate: &ScheduledTx,
        sent: &WalletReceipt,
        gas_price: U256,
    ) -> ExecuteStatus {
        let Some(receipt) = sent.receipt.as_ref() else {
            return ExecuteStatus::Failed;
        };

        if let Some(bounty) = decode_executed_bounty(receipt) {
            // Gas is reimbursed on a successful execution; only the bounty
            // moves the books.
            self.cache.update(candidate.address, |entry| {
                entry.was_called = true;
            });
            if let Err(err) =
                self.stats
                    .update_executed(sent.from, candidate.address, bounty, U256::ZERO, true)
            {
                tracing::warn!("[EXEC] Stats write failed: {}", compact_error(err));
            }
            tracing::info!(
                "[EXEC] {} executed by {}, bounty {bounty}.",
                candidate.address,
                sent.from
            );
            return ExecuteStatus::Success;
        }

        let cost = receipt.gas_used.saturating_mul(gas_price);
        if let Err(err) =
            self.stats
                .update_executed(sent.from, candidate.address, U256::ZERO, cost, false)
        {
            tracing::warn!("[EXEC] Stats write failed: {}", compact_error(err));
        }

        if let Some(reason) = decode_abort_reason(receipt) {
            tracing::warn!(
                "[EXEC] Execution of {} aborted: {reason:?}.",
                candidate.address
            );
            return ExecuteStatus::Aborted(reason);
        }
        tracing::warn!("[EXEC] Execution of {} failed without a signal.", candidate.address);
        ExecuteStatus::Failed
    }

    /// Sweep-after-execution of an emptied request. The current registry
    /// version changed the shape of this call and the node does not support
    /// it yet; callers must not mistake the missing sweep for success.
    pub fn cleanup(&self, _candidate: &ScheduledTx) -> crate::error::Result<()> {
        Err(crate::error::EngineError::NotImplemented("request cleanup").into())
    }
}
