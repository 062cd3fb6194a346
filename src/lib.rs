//! time_warden: an autonomous agent that discovers calls scheduled for
//! future execution on the ledger, tracks each through its temporal windows,
//! and submits claim/execute transactions from a pool of controlled accounts
//! at the right moment — without double-submitting and without taking
//! unprofitable work.

pub mod actions;
pub mod buckets;
pub mod cache;
pub mod error;
pub mod ledger;
pub mod node;
pub mod queue;
pub mod registry;
pub mod router;
pub mod scanner;
pub mod stats;
pub mod strategy;
pub mod txpool;
pub mod utils;
pub mod wallet;
