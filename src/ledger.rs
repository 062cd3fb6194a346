use crate::error::{Result, RpcError};
use crate::utils::compact_error;
use alloy::primitives::{Address, Bytes, B256, U256, U64};
use alloy::providers::{DynProvider, Provider};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::future::IntoFuture;
use std::time::Duration;

const RPC_CALL_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    pub succeeded: bool,
    pub gas_used: U256,
    pub logs: Vec<ReceiptLog>,
}

/// A transaction as observed in the mempool or a block body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTx {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub gas_price: U256,
    pub block_number: Option<u64>,
}

/// Read-side boundary to the ledger. Everything the engine learns about
/// chain state flows through this interface so tests can substitute an
/// in-memory ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn latest_block(&self) -> Result<BlockRef>;
    async fn block_by_number(&self, number: u64) -> Result<BlockRef>;
    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>>;
    async fn transaction(&self, hash: B256) -> Result<Option<PoolTx>>;
    async fn network_gas_price(&self) -> Result<U256>;
    /// Capability probe: whether the endpoint supports log filters, which
    /// decides between live bucket-watch discovery and backfill polling.
    async fn supports_event_filters(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Raw JSON-RPC payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    number: U64,
    timestamp: U64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    block_number: Option<U64>,
    status: Option<U64>,
    gas_used: U256,
    logs: Vec<RawLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: B256,
    from: Address,
    to: Option<Address>,
    input: Bytes,
    gas_price: Option<U256>,
    block_number: Option<U64>,
}

impl From<RawReceipt> for TxReceipt {
    fn from(raw: RawReceipt) -> Self {
        Self {
            transaction_hash: raw.transaction_hash,
            block_number: raw.block_number.map(|n| n.to::<u64>()),
            succeeded: raw.status.map(|s| s == U64::from(1)).unwrap_or(false),
            gas_used: raw.gas_used,
            logs: raw
                .logs
                .into_iter()
                .map(|log| ReceiptLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                })
                .collect(),
        }
    }
}

impl From<RawTransaction> for PoolTx {
    fn from(raw: RawTransaction) -> Self {
        Self {
            hash: raw.hash,
            from: raw.from,
            to: raw.to,
            input: raw.input,
            gas_price: raw.gas_price.unwrap_or(U256::ZERO),
            block_number: raw.block_number.map(|n| n.to::<u64>()),
        }
    }
}

// ---------------------------------------------------------------------------
// WS-backed implementation
// ---------------------------------------------------------------------------

pub struct RpcLedger {
    provider: DynProvider,
}

async fn with_timeout<T, F>(context: &str, fut: F) -> Result<T>
where
    F: IntoFuture<Output = std::result::Result<T, alloy::transports::TransportError>>,
{
    match tokio::time::timeout(Duration::from_millis(RPC_CALL_TIMEOUT_MS), fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(RpcError::Transport(compact_error(err)).into()),
        Err(_) => Err(RpcError::Timeout {
            waited_ms: RPC_CALL_TIMEOUT_MS,
            context: context.to_string(),
        }
        .into()),
    }
}

impl RpcLedger {
    pub fn new(provider: DynProvider) -> Self {
        Self { provider }
    }

    /// The underlying provider, for subscription consumers.
    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    async fn block_by_tag(&self, tag: &str) -> Result<BlockRef> {
        let block: Option<RawBlock> = with_timeout(
            "eth_getBlockByNumber",
            self.provider
                .raw_request("eth_getBlockByNumber".into(), (tag.to_string(), false)),
        )
        .await?;
        let block = block.ok_or_else(|| RpcError::NullBlock(tag.to_string()))?;
        Ok(BlockRef {
            number: block.number.to::<u64>(),
            timestamp: block.timestamp.to::<u64>(),
        })
    }

    /// Timeout-wrapped raw JSON-RPC escape hatch for collaborators that need
    /// a method this trait does not model (e.g. `eth_sendTransaction`).
    pub async fn raw<P, R>(&self, method: &'static str, params: P) -> Result<R>
    where
        P: alloy::rpc::json_rpc::RpcSend,
        R: alloy::rpc::json_rpc::RpcRecv,
    {
        with_timeout(method, self.provider.raw_request(method.into(), params)).await
    }

    /// `eth_call` against `to` with the given calldata, at the latest block.
    pub async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        with_timeout(
            "eth_call",
            self.provider.raw_request(
                "eth_call".into(),
                (json!({ "to": to, "data": data }), "latest"),
            ),
        )
        .await
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn latest_block(&self) -> Result<BlockRef> {
        self.block_by_tag("latest").await
    }

    async fn block_by_number(&self, number: u64) -> Result<BlockRef> {
        self.block_by_tag(&format!("0x{number:x}")).await
    }

    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        let raw: Option<RawReceipt> = with_timeout(
            "eth_getTransactionReceipt",
            self.provider
                .raw_request("eth_getTransactionReceipt".into(), (hash,)),
        )
        .await?;
        Ok(raw.map(TxReceipt::from))
    }

    async fn transaction(&self, hash: B256) -> Result<Option<PoolTx>> {
        let raw: Option<RawTransaction> = with_timeout(
            "eth_getTransactionByHash",
            self.provider
                .raw_request("eth_getTransactionByHash".into(), (hash,)),
        )
        .await?;
        Ok(raw.map(PoolTx::from))
    }

    async fn network_gas_price(&self) -> Result<U256> {
        with_timeout(
            "eth_gasPrice",
            self.provider
                .raw_request("eth_gasPrice".into(), json!([])),
        )
        .await
    }

    async fn supports_event_filters(&self) -> bool {
        let probe: Result<String> = with_timeout(
            "eth_newFilter",
            self.provider
                .raw_request("eth_newFilter".into(), (json!({}),)),
        )
        .await;
        match probe {
            Ok(filter_id) => {
                let _: Result<bool> = with_timeout(
                    "eth_uninstallFilter",
                    self.provider
                        .raw_request("eth_uninstallFilter".into(), (filter_id,)),
                )
                .await;
                true
            }
            Err(err) => {
                tracing::debug!("[RPC] Log filter probe failed: {}", compact_error(err));
                false
            }
        }
    }
}
