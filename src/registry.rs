//! Boundary to the on-chain scheduling registry: the tracker's linked-list
//! index, the factory's bucket index and per-request state reads. The engine
//! only ever sees the decoded types below; raw ABI handling stays here.

use crate::buckets::Bucket;
use crate::error::{RegistryError, Result};
use crate::ledger::{Ledger, RpcLedger};
use crate::queue::{DiscoveryLane, DiscoveryQueueSender};
use crate::utils::{compact_error, hex};
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::providers::Provider;
use alloy::rpc::types::Filter;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Sentinel returned by the tracker when a linked-list walk runs off the end.
pub const NULL_IDENTIFIER: Address = Address::ZERO;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemporalUnit {
    Blocks,
    Timestamp,
}

impl TemporalUnit {
    pub fn code(self) -> u64 {
        match self {
            TemporalUnit::Blocks => 1,
            TemporalUnit::Timestamp => 2,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Blocks),
            2 => Some(Self::Timestamp),
            _ => None,
        }
    }
}

/// Fresh-from-ledger snapshot of one scheduled call, including the `now`
/// observation on its temporal axis. All window predicates are pure functions
/// of this snapshot, so a whole transition chain costs one registry read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTx {
    pub address: Address,
    pub temporal_unit: TemporalUnit,
    pub window_start: u64,
    /// Execution window end.
    pub window_end: u64,
    pub freeze_period_length: u64,
    pub claim_window_size: u64,
    pub reserved_window_size: u64,
    pub bounty: U256,
    pub required_deposit: U256,
    /// Zero when unclaimed.
    pub claimed_by: Address,
    pub was_called: bool,
    pub is_cancelled: bool,
    pub owner: Address,
    pub gas_price: U256,
    pub call_gas: U256,
    /// Block number or ledger timestamp, depending on `temporal_unit`.
    pub now: u64,
}

impl ScheduledTx {
    pub fn claim_window_start(&self) -> u64 {
        self.window_start
            .saturating_sub(self.freeze_period_length)
            .saturating_sub(self.claim_window_size)
    }

    fn freeze_period_start(&self) -> u64 {
        self.window_start.saturating_sub(self.freeze_period_length)
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by != NULL_IDENTIFIER
    }

    pub fn before_claim_window(&self) -> bool {
        self.now < self.claim_window_start()
    }

    pub fn in_claim_window(&self) -> bool {
        self.claim_window_start() <= self.now && self.now < self.freeze_period_start()
    }

    pub fn in_freeze_period(&self) -> bool {
        self.freeze_period_start() <= self.now && self.now < self.window_start
    }

    pub fn in_execution_window(&self) -> bool {
        self.window_start <= self.now && self.now <= self.window_end
    }

    /// The claimer-exclusive leading portion of the execution window.
    pub fn in_reserved_window(&self) -> bool {
        self.window_start <= self.now
            && self.now < self.window_start.saturating_add(self.reserved_window_size)
    }

    pub fn is_missed(&self) -> bool {
        self.window_end <= self.now && !self.was_called
    }

    /// Whether the candidate still has an actionable window ahead of it.
    pub fn is_upcoming(&self) -> bool {
        self.before_claim_window()
            || self.in_claim_window()
            || self.in_freeze_period()
            || self.in_execution_window()
    }
}

/// What a discovery source learns about a candidate before the first full
/// state fetch; exactly what the cache needs for its summary entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRequest {
    pub address: Address,
    pub temporal_unit: TemporalUnit,
    pub window_start: u64,
    pub freeze_period_length: u64,
    pub claim_window_size: u64,
    pub bounty: U256,
}

impl DiscoveredRequest {
    pub fn claim_window_start(&self) -> u64 {
        self.window_start
            .saturating_sub(self.freeze_period_length)
            .saturating_sub(self.claim_window_size)
    }
}

/// Running bucket subscription; aborted on drop so a stale watcher can never
/// outlive the scanner that registered it.
pub struct WatchHandle {
    handle: JoinHandle<()>,
}

impl WatchHandle {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[async_trait]
pub trait SchedulerRegistry: Send + Sync {
    async fn previous_request(&self, id: Address) -> Result<Address>;
    async fn next_request(&self, id: Address) -> Result<Address>;
    /// Entry point for the backward traversal: the last request whose window
    /// start does not exceed `bound` on the given axis.
    async fn previous_from_right(&self, bound: u64, unit: TemporalUnit) -> Result<Address>;
    /// Entry point for the forward traversal.
    async fn next_from_left(&self, bound: u64, unit: TemporalUnit) -> Result<Address>;
    async fn window_start_for(&self, id: Address) -> Result<u64>;
    async fn requests_in_bucket(&self, bucket: Bucket) -> Result<Vec<Address>>;
    async fn fetch_state(&self, id: Address) -> Result<ScheduledTx>;
    /// Stream newly scheduled requests in `bucket` into the discovery queue.
    async fn watch_bucket(
        &self,
        bucket: Bucket,
        queue: DiscoveryQueueSender,
    ) -> Result<WatchHandle>;
}

// ---------------------------------------------------------------------------
// ABI plumbing
// ---------------------------------------------------------------------------

const REQUEST_DATA_WORDS: usize = 14;

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

struct CallData {
    bytes: Vec<u8>,
}

impl CallData {
    fn new(signature: &str) -> Self {
        Self {
            bytes: selector(signature).to_vec(),
        }
    }

    fn push_address(mut self, value: Address) -> Self {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(value.as_slice());
        self.bytes.extend_from_slice(&word);
        self
    }

    fn push_u256(mut self, value: U256) -> Self {
        self.bytes.extend_from_slice(&value.to_be_bytes::<32>());
        self
    }

    fn build(self) -> Bytes {
        Bytes::from(self.bytes)
    }
}

fn decode_address_return(payload: &[u8]) -> Result<Address> {
    hex::word(payload, 0)
        .and_then(hex::word_to_address)
        .ok_or_else(|| {
            RegistryError::InvalidAddress(format!("0x{}", alloy::hex::encode(payload))).into()
        })
}

// ---------------------------------------------------------------------------
// On-chain implementation
// ---------------------------------------------------------------------------

pub struct OnChainRegistry {
    rpc: Arc<RpcLedger>,
    tracker: Address,
    factory: Address,
}

impl OnChainRegistry {
    pub fn new(rpc: Arc<RpcLedger>, tracker: Address, factory: Address) -> Self {
        Self {
            rpc,
            tracker,
            factory,
        }
    }

    /// Topic of the factory's request-scheduled event:
    /// `RequestScheduled(int256 indexed bucket, address request, uint256[5] params)`
    /// with params `[temporalUnit, windowStart, freezePeriodLength,
    /// claimWindowSize, bounty]`.
    pub fn scheduled_event_topic() -> B256 {
        keccak256("RequestScheduled(int256,address,uint256[5])".as_bytes())
    }

    async fn tracker_call(&self, data: Bytes) -> Result<Bytes> {
        self.rpc.call(self.tracker, data).await
    }

    async fn factory_call(&self, data: Bytes) -> Result<Bytes> {
        self.rpc.call(self.factory, data).await
    }
}

/// Decode the non-indexed payload of a request-scheduled event.
pub fn decode_scheduled_event(data: &[u8]) -> Result<DiscoveredRequest> {
    let malformed =
        |what: &str| RegistryError::MalformedPayload(format!("scheduled event: {what}"));

    let address = hex::word(data, 0)
        .and_then(hex::word_to_address)
        .ok_or_else(|| {
            RegistryError::InvalidAddress(format!("0x{}", alloy::hex::encode(data)))
        })?;
    let unit_code = hex::word(data, 1)
        .and_then(hex::word_to_u64)
        .ok_or_else(|| malformed("temporal unit"))?;
    let temporal_unit = TemporalUnit::from_code(unit_code)
        .ok_or_else(|| malformed("unknown temporal unit code"))?;
    let window_start = hex::word(data, 2)
        .and_then(hex::word_to_u64)
        .ok_or_else(|| malformed("window start"))?;
    let freeze_period_length = hex::word(data, 3)
        .and_then(hex::word_to_u64)
        .ok_or_else(|| malformed("freeze period"))?;
    let claim_window_size = hex::word(data, 4)
        .and_then(hex::word_to_u64)
        .ok_or_else(|| malformed("claim window size"))?;
    let bounty = hex::word(data, 5)
        .and_then(hex::word_to_u256)
        .ok_or_else(|| malformed("bounty"))?;

    Ok(DiscoveredRequest {
        address,
        temporal_unit,
        window_start,
        freeze_period_length,
        claim_window_size,
        bounty,
    })
}

fn decode_request_data(id: Address, payload: &[u8], now: u64) -> Result<ScheduledTx> {
    if payload.len() < REQUEST_DATA_WORDS * 32 {
        return Err(RegistryError::MalformedPayload(format!(
            "requestData for `{id}` returned {} bytes",
            payload.len()
        ))
        .into());
    }
    let malformed = |what: &str| {
        RegistryError::MalformedPayload(format!("requestData for `{id}`: {what}"))
    };
    let u64_at = |index: usize, what: &str| -> Result<u64> {
        hex::word(payload, index)
            .and_then(hex::word_to_u64)
            .ok_or_else(|| malformed(what).into())
    };
    let u256_at = |index: usize, what: &str| -> Result<U256> {
        hex::word(payload, index)
            .and_then(hex::word_to_u256)
            .ok_or_else(|| malformed(what).into())
    };
    let address_at = |index: usize, what: &str| -> Result<Address> {
        hex::word(payload, index)
            .and_then(hex::word_to_address)
            .ok_or_else(|| malformed(what).into())
    };

    let temporal_unit = TemporalUnit::from_code(u64_at(0, "temporal unit")?)
        .ok_or_else(|| malformed("unknown temporal unit code"))?;
    let window_start = u64_at(1, "window start")?;
    let window_size = u64_at(2, "window size")?;

    Ok(ScheduledTx {
        address: id,
        temporal_unit,
        window_start,
        window_end: window_start.saturating_add(window_size),
        freeze_period_length: u64_at(3, "freeze period")?,
        claim_window_size: u64_at(4, "claim window size")?,
        reserved_window_size: u64_at(5, "reserved window size")?,
        bounty: u256_at(6, "bounty")?,
        required_deposit: u256_at(7, "required deposit")?,
        claimed_by: address_at(8, "claimed by")?,
        was_called: u64_at(9, "was called")? != 0,
        is_cancelled: u64_at(10, "is cancelled")? != 0,
        owner: address_at(11, "owner")?,
        gas_price: u256_at(12, "gas price")?,
        call_gas: u256_at(13, "call gas")?,
        now,
    })
}

#[async_trait]
impl SchedulerRegistry for OnChainRegistry {
    async fn previous_request(&self, id: Address) -> Result<Address> {
        let data = CallData::new("previousRequest(address)")
            .push_address(id)
            .build();
        decode_address_return(&self.tracker_call(data).await?)
    }

    async fn next_request(&self, id: Address) -> Result<Address> {
        let data = CallData::new("nextRequest(address)").push_address(id).build();
        decode_address_return(&self.tracker_call(data).await?)
    }

    async fn previous_from_right(&self, bound: u64, unit: TemporalUnit) -> Result<Address> {
        let data = CallData::new("previousFromRight(uint256,uint256)")
            .push_u256(U256::from(bound))
            .push_u256(U256::from(unit.code()))
            .build();
        decode_address_return(&self.tracker_call(data).await?)
    }

    async fn next_from_left(&self, bound: u64, unit: TemporalUnit) -> Result<Address> {
        let data = CallData::new("nextFromLeft(uint256,uint256)")
            .push_u256(U256::from(bound))
            .push_u256(U256::from(unit.code()))
            .build();
        decode_address_return(&self.tracker_call(data).await?)
    }

    async fn window_start_for(&self, id: Address) -> Result<u64> {
        let data = CallData::new("windowStartFor(address)")
            .push_address(id)
            .build();
        let payload = self.tracker_call(data).await?;
        hex::word(&payload, 0)
            .and_then(hex::word_to_u64)
            .ok_or_else(|| {
                RegistryError::MalformedPayload(format!("windowStartFor for `{id}`")).into()
            })
    }

    async fn requests_in_bucket(&self, bucket: Bucket) -> Result<Vec<Address>> {
        let data = CallData::new("requestsInBucket(int256)")
            .push_u256(bucket.encoded())
            .build();
        let payload = self.factory_call(data).await?;

        // Dynamic array return: offset word, length word, then one word per id.
        let malformed = || RegistryError::MalformedPayload("requestsInBucket".to_string());
        let offset = hex::word(&payload, 0)
            .and_then(hex::word_to_u64)
            .ok_or_else(malformed)? as usize;
        let length_index = offset / 32;
        let length = hex::word(&payload, length_index)
            .and_then(hex::word_to_u64)
            .ok_or_else(malformed)? as usize;

        let mut out = Vec::with_capacity(length);
        for i in 0..length {
            let id = hex::word(&payload, length_index + 1 + i)
                .and_then(hex::word_to_address)
                .ok_or_else(|| {
                    RegistryError::InvalidAddress(format!("requestsInBucket entry {i}"))
                })?;
            out.push(id);
        }
        Ok(out)
    }

    async fn fetch_state(&self, id: Address) -> Result<ScheduledTx> {
        let data = CallData::new("requestData(address)").push_address(id).build();
        let payload = self.factory_call(data).await?;
        // Decode first so a malformed payload surfaces before the block read.
        let partial = decode_request_data(id, &payload, 0)?;
        let latest = self.rpc.latest_block().await?;
        let now = match partial.temporal_unit {
            TemporalUnit::Blocks => latest.number,
            TemporalUnit::Timestamp => latest.timestamp,
        };
        Ok(ScheduledTx { now, ..partial })
    }

    async fn watch_bucket(
        &self,
        bucket: Bucket,
        queue: DiscoveryQueueSender,
    ) -> Result<WatchHandle> {
        let filter = Filter::new()
            .address(self.factory)
            .event_signature(Self::scheduled_event_topic())
            .topic1(B256::from(bucket.encoded()));

        let subscription = self
            .rpc
            .provider()
            .subscribe_logs(&filter)
            .await
            .map_err(|err| crate::error::RpcError::Transport(compact_error(err)))?;

        // Replay what the bucket already holds before relying on the stream,
        // so a watcher registered mid-bucket still sees earlier schedules.
        let existing = self.requests_in_bucket(bucket).await.unwrap_or_default();
        let backlog: Vec<DiscoveredRequest> = {
            let mut out = Vec::new();
            for id in existing {
                if id == NULL_IDENTIFIER {
                    continue;
                }
                match self.fetch_state(id).await {
                    Ok(state) => out.push(DiscoveredRequest {
                        address: id,
                        temporal_unit: state.temporal_unit,
                        window_start: state.window_start,
                        freeze_period_length: state.freeze_period_length,
                        claim_window_size: state.claim_window_size,
                        bounty: state.bounty,
                    }),
                    Err(err) => {
                        tracing::warn!(
                            "[BUCKET] Backlog fetch failed for {id}: {}",
                            compact_error(err)
                        );
                    }
                }
            }
            out
        };

        let handle = tokio::spawn(async move {
            let mut stream = subscription.into_stream();
            for request in backlog {
                let _ = queue.enqueue(request, DiscoveryLane::Live).await;
            }
            while let Some(log) = stream.next().await {
                match decode_scheduled_event(log.inner.data.data.as_ref()) {
                    Ok(request) => {
                        if request.address == NULL_IDENTIFIER {
                            tracing::debug!("[BUCKET] Null identifier event ignored.");
                            continue;
                        }
                        let _ = queue.enqueue(request, DiscoveryLane::Live).await;
                    }
                    Err(err) => {
                        // Registry emitted something we cannot decode. That is
                        // a contract bug, not a transient condition.
                        tracing::error!(
                            "[BUCKET] Integrity failure decoding scheduled event: {}",
                            compact_error(err)
                        );
                    }
                }
            }
        });

        Ok(WatchHandle::new(handle))
    }
}
