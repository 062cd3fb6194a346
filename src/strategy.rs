use crate::error::Result;
use crate::ledger::Ledger;
use crate::registry::ScheduledTx;
use crate::utils::compact_error;
use alloy::primitives::U256;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const GAS_API_TIMEOUT_MS: u64 = 2_000;
const WEI_PER_GWEI: u64 = 1_000_000_000;

/// Economic decisions consumed by the engine as pure functions: whether a
/// claim is worth its deposit, and what to bid for an execution.
#[async_trait]
pub trait EconomicStrategy: Send + Sync {
    async fn should_claim(&self, candidate: &ScheduledTx) -> bool;
    async fn execution_gas_price(&self, candidate: &ScheduledTx) -> Result<U256>;
}

// ---------------------------------------------------------------------------
// Network gas price
// ---------------------------------------------------------------------------

// Gas express API shape: gwei tiers, e.g. {"safeLow":1.1,"standard":2,...}.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GasExpressResponse {
    safe_low: f64,
    standard: f64,
    fast: f64,
    fastest: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPriceEstimate {
    pub safe_low: U256,
    pub standard: U256,
    pub fast: U256,
    pub fastest: U256,
}

fn gwei_to_wei(gwei: f64) -> Option<U256> {
    if !gwei.is_finite() || gwei < 0.0 {
        return None;
    }
    Some(U256::from((gwei * WEI_PER_GWEI as f64) as u128))
}

/// Fetches gas price tiers from an HTTP estimation endpoint, falling back to
/// the node's own `eth_gasPrice` when the endpoint is unset or unreachable.
pub struct GasPriceService {
    endpoint: Option<String>,
    client: reqwest::Client,
    ledger: Arc<dyn Ledger>,
}

impl GasPriceService {
    pub fn new(endpoint: Option<String>, ledger: Arc<dyn Ledger>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(GAS_API_TIMEOUT_MS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint,
            client,
            ledger,
        }
    }

    async fn fetch_estimate(&self, endpoint: &str) -> Option<GasPriceEstimate> {
        let response = self.client.get(endpoint).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let parsed: GasExpressResponse = response.json().await.ok()?;
        Some(GasPriceEstimate {
            safe_low: gwei_to_wei(parsed.safe_low)?,
            standard: gwei_to_wei(parsed.standard)?,
            fast: gwei_to_wei(parsed.fast)?,
            fastest: gwei_to_wei(parsed.fastest)?,
        })
    }

    pub async fn network_gas_price(&self) -> Result<U256> {
        if let Some(endpoint) = self.endpoint.as_deref() {
            if let Some(estimate) = self.fetch_estimate(endpoint).await {
                return Ok(estimate.standard);
            }
            tracing::debug!("[GAS] Estimation endpoint unavailable, falling back to eth_gasPrice.");
        }
        self.ledger.network_gas_price().await
    }
}

// ---------------------------------------------------------------------------
// Default strategy
// ---------------------------------------------------------------------------

/// Gate-only default: a claim must stay within the configured deposit ceiling
/// and clear the minimum bounty; executions bid the candidate's declared
/// price, raised to the network estimate when that is higher (a call priced
/// below its declared gas price is aborted by the registry).
pub struct DepositAwareStrategy {
    max_deposit: U256,
    min_bounty: U256,
    gas: Arc<GasPriceService>,
}

impl DepositAwareStrategy {
    pub fn new(max_deposit: U256, min_bounty: U256, gas: Arc<GasPriceService>) -> Self {
        Self {
            max_deposit,
            min_bounty,
            gas,
        }
    }
}

#[async_trait]
impl EconomicStrategy for DepositAwareStrategy {
    async fn should_claim(&self, candidate: &ScheduledTx) -> bool {
        if candidate.is_cancelled {
            return false;
        }
        if candidate.required_deposit > self.max_deposit {
            tracing::debug!(
                "[GAS] {} deposit {} above ceiling, not claiming.",
                candidate.address,
                candidate.required_deposit
            );
            return false;
        }
        candidate.bounty >= self.min_bounty
    }

    async fn execution_gas_price(&self, candidate: &ScheduledTx) -> Result<U256> {
        let network = match self.gas.network_gas_price().await {
            Ok(price) => price,
            Err(err) => {
                tracing::debug!(
                    "[GAS] Network estimate failed, using declared price: {}",
                    compact_error(err)
                );
                return Ok(candidate.gas_price);
            }
        };
        Ok(candidate.gas_price.max(network))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::ledger::{BlockRef, PoolTx, TxReceipt};
    use crate::registry::{TemporalUnit, NULL_IDENTIFIER};
    use alloy::primitives::{address, Address, B256};

    struct FlatLedger;

    #[async_trait]
    impl Ledger for FlatLedger {
        async fn latest_block(&self) -> Result<BlockRef> {
            Ok(BlockRef {
                number: 1,
                timestamp: 1,
            })
        }
        async fn block_by_number(&self, number: u64) -> Result<BlockRef> {
            Ok(BlockRef {
                number,
                timestamp: 1,
            })
        }
        async fn receipt(&self, _hash: B256) -> Result<Option<TxReceipt>> {
            Ok(None)
        }
        async fn transaction(&self, _hash: B256) -> Result<Option<PoolTx>> {
            Ok(None)
        }
        async fn network_gas_price(&self) -> Result<U256> {
            Ok(U256::from(30_000_000_000u64))
        }
        async fn supports_event_filters(&self) -> bool {
            false
        }
    }

    fn candidate(deposit: u64, bounty: u64, gas_price: u64) -> ScheduledTx {
        ScheduledTx {
            address: address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec"),
            temporal_unit: TemporalUnit::Blocks,
            window_start: 100,
            window_end: 150,
            freeze_period_length: 10,
            claim_window_size: 30,
            reserved_window_size: 16,
            bounty: U256::from(bounty),
            required_deposit: U256::from(deposit),
            claimed_by: NULL_IDENTIFIER,
            was_called: false,
            is_cancelled: false,
            owner: Address::ZERO,
            gas_price: U256::from(gas_price),
            call_gas: U256::from(50_000),
            now: 60,
        }
    }

    fn strategy(max_deposit: u64, min_bounty: u64) -> DepositAwareStrategy {
        let gas = Arc::new(GasPriceService::new(None, Arc::new(FlatLedger)));
        DepositAwareStrategy::new(U256::from(max_deposit), U256::from(min_bounty), gas)
    }

    #[test]
    fn test_gwei_to_wei_conversion() {
        assert_eq!(gwei_to_wei(2.0), Some(U256::from(2_000_000_000u64)));
        assert_eq!(gwei_to_wei(0.5), Some(U256::from(500_000_000u64)));
        assert_eq!(gwei_to_wei(-1.0), None);
        assert_eq!(gwei_to_wei(f64::NAN), None);
    }

    #[tokio::test]
    async fn test_should_claim_enforces_deposit_ceiling_and_bounty_floor() {
        let strategy = strategy(1_000, 50);
        assert!(strategy.should_claim(&candidate(500, 100, 20)).await);
        assert!(!strategy.should_claim(&candidate(2_000, 100, 20)).await);
        assert!(!strategy.should_claim(&candidate(500, 10, 20)).await);

        let mut cancelled = candidate(500, 100, 20);
        cancelled.is_cancelled = true;
        assert!(!strategy.should_claim(&cancelled).await);
    }

    #[tokio::test]
    async fn test_execution_price_never_undercuts_declared_price() {
        let strategy = strategy(1_000, 0);
        // Declared above network estimate: keep declared.
        let high = candidate(0, 0, 50_000_000_000);
        assert_eq!(
            strategy.execution_gas_price(&high).await.expect("price"),
            U256::from(50_000_000_000u64)
        );
        // Declared below: raise to network.
        let low = candidate(0, 0, 10);
        assert_eq!(
            strategy.execution_gas_price(&low).await.expect("price"),
            U256::from(30_000_000_000u64)
        );
    }

    #[tokio::test]
    async fn test_network_gas_price_falls_back_to_ledger() {
        let gas = GasPriceService::new(None, Arc::new(FlatLedger));
        assert_eq!(
            gas.network_gas_price().await.expect("price"),
            U256::from(30_000_000_000u64)
        );
    }
}
