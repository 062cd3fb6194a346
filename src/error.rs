use alloy::primitives::{Address, B256};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WardenError>;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("network error: {0}")]
    Rpc(#[from] RpcError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Failures that indicate the scheduling registry itself is misbehaving.
/// These abort the current scan iteration and are never blind-retried.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid identifier in registry response: {0}")]
    InvalidAddress(String),
    #[error("window start mismatch for `{id}`: tracker={tracker}, request={request}")]
    DataMismatch {
        id: Address,
        tracker: u64,
        request: u64,
    },
    #[error("malformed registry payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rpc call timed out after {waited_ms}ms: {context}")]
    Timeout { waited_ms: u64, context: String },
    #[error("block `{0}` not available")]
    NullBlock(String),
    #[error("transaction `{0}` ended up in an uncle block")]
    Uncle(B256),
    #[error("no receipt for `{hash}` after {polls} polls")]
    ReceiptTimeout { hash: B256, polls: u32 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("attempted to access cache entry that does not exist: {0}")]
    CacheMiss(Address),
    #[error("transition budget exhausted for `{id}` while in {status}")]
    TransitionBudget { id: Address, status: &'static str },
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}
