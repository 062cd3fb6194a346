use crate::actions::{Actions, ExecuteStatus};
use crate::cache::Cache;
use crate::error::{EngineError, Result};
use crate::registry::ScheduledTx;
use crate::strategy::EconomicStrategy;
use crate::utils::compact_error;
use crate::wallet::Wallet;
use alloy::primitives::Address;
use dashmap::DashMap;
use std::sync::Arc;

/// Upper bound on status transitions within one tick. A legitimate chain
/// walks at most the whole lifecycle once; anything longer means a predicate
/// is misbehaving.
const MAX_TRANSITIONS_PER_TICK: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    BeforeClaimWindow,
    ClaimWindow,
    FreezePeriod,
    ExecutionWindow,
    Executed,
    Missed,
    Done,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::BeforeClaimWindow => "BeforeClaimWindow",
            TxStatus::ClaimWindow => "ClaimWindow",
            TxStatus::FreezePeriod => "FreezePeriod",
            TxStatus::ExecutionWindow => "ExecutionWindow",
            TxStatus::Executed => "Executed",
            TxStatus::Missed => "Missed",
            TxStatus::Done => "Done",
        }
    }
}

/// Per-candidate state machine. One instance serves every candidate; the
/// status table is keyed by identifier and a missing key means
/// `BeforeClaimWindow`.
pub struct Router {
    cache: Arc<Cache>,
    actions: Arc<Actions>,
    wallet: Arc<Wallet>,
    strategy: Arc<dyn EconomicStrategy>,
    states: DashMap<Address, TxStatus>,
}

impl Router {
    pub fn new(
        cache: Arc<Cache>,
        actions: Arc<Actions>,
        wallet: Arc<Wallet>,
        strategy: Arc<dyn EconomicStrategy>,
    ) -> Self {
        Self {
            cache,
            actions,
            wallet,
            strategy,
            states: DashMap::new(),
        }
    }

    pub fn status_of(&self, id: Address) -> TxStatus {
        self.states
            .get(&id)
            .map(|status| *status)
            .unwrap_or(TxStatus::BeforeClaimWindow)
    }

    /// Advance a candidate to its fixed point for this tick.
    ///
    /// The snapshot is taken once by the caller, so a candidate that crossed
    /// several window boundaries since the last tick walks through all of
    /// them now instead of burning one tick per transition. The state table
    /// is only written after the whole chain evaluated without error.
    pub async fn route(&self, candidate: &ScheduledTx) -> Result<TxStatus> {
        let id = candidate.address;
        let mut status = self.status_of(id);
        let mut steps = 0usize;

        loop {
            let next = self.transition(status, candidate).await?;
            if next == status {
                break;
            }
            tracing::info!("[ROUTE] {id} {} -> {}", status.as_str(), next.as_str());
            status = next;
            steps += 1;
            if steps > MAX_TRANSITIONS_PER_TICK {
                return Err(EngineError::TransitionBudget {
                    id,
                    status: status.as_str(),
                }
                .into());
            }
        }

        if status == TxStatus::Done {
            self.states.remove(&id);
        } else {
            self.states.insert(id, status);
            self.cache.update(id, |entry| entry.status = status);
        }
        Ok(status)
    }

    async fn transition(&self, status: TxStatus, candidate: &ScheduledTx) -> Result<TxStatus> {
        Ok(match status {
            TxStatus::BeforeClaimWindow => {
                if candidate.is_cancelled {
                    // Retire through the terminal path.
                    TxStatus::Executed
                } else if candidate.before_claim_window() {
                    TxStatus::BeforeClaimWindow
                } else {
                    TxStatus::ClaimWindow
                }
            }
            TxStatus::ClaimWindow => self.claim_window(candidate).await,
            TxStatus::FreezePeriod => {
                if candidate.in_freeze_period() {
                    TxStatus::FreezePeriod
                } else if candidate.in_execution_window() {
                    TxStatus::ExecutionWindow
                } else {
                    TxStatus::FreezePeriod
                }
            }
            TxStatus::ExecutionWindow => self.execution_window(candidate).await,
            TxStatus::Executed => {
                if let Err(err) = self.actions.cleanup(candidate) {
                    tracing::debug!(
                        "[ROUTE] {} cleanup unavailable: {}",
                        candidate.address,
                        compact_error(err)
                    );
                }
                TxStatus::Done
            }
            TxStatus::Missed => {
                tracing::warn!("[ROUTE] {} missed its execution window.", candidate.address);
                TxStatus::Done
            }
            TxStatus::Done => {
                self.cache.del(candidate.address);
                TxStatus::Done
            }
        })
    }

    async fn claim_window(&self, candidate: &ScheduledTx) -> TxStatus {
        if !candidate.in_claim_window() {
            return TxStatus::FreezePeriod;
        }
        if candidate.is_claimed() {
            return TxStatus::FreezePeriod;
        }
        if !self.strategy.should_claim(candidate).await {
            tracing::debug!(
                "[ROUTE] {} claim not worth taking, waiting.",
                candidate.address
            );
            return TxStatus::ClaimWindow;
        }

        let outcome = self.actions.claim(candidate).await;
        tracing::debug!("[ROUTE] {} claim outcome: {outcome:?}", candidate.address);
        // Whatever the outcome, the status does not advance: contention
        // statuses retry next tick and a settled claim shows up as
        // `is_claimed` on the next snapshot.
        TxStatus::ClaimWindow
    }

    async fn execution_window(&self, candidate: &ScheduledTx) -> TxStatus {
        if candidate.was_called {
            return TxStatus::Executed;
        }
        if candidate.is_missed() {
            return TxStatus::Missed;
        }
        if candidate.in_reserved_window() && !self.is_local_claim(candidate) {
            return TxStatus::ExecutionWindow;
        }

        match self.actions.execute(candidate).await {
            ExecuteStatus::Success => TxStatus::Executed,
            outcome => {
                tracing::debug!(
                    "[ROUTE] {} execute outcome: {outcome:?}",
                    candidate.address
                );
                TxStatus::ExecutionWindow
            }
        }
    }

    fn is_local_claim(&self, candidate: &ScheduledTx) -> bool {
        let local = candidate.is_claimed() && self.wallet.is_known_address(candidate.claimed_by);
        if !local {
            tracing::debug!(
                "[ROUTE] {} in reserved window and not claimed by this node.",
                candidate.address
            );
        }
        local
    }
}
