use crate::error::{EngineError, Result};
use alloy::primitives::{Address, U256};
use std::env;

const DEFAULT_SCAN_INTERVAL_MS: u64 = 4_000;
const DEFAULT_SCAN_SPREAD: u64 = 50;
const DEFAULT_CHAIN_INTERVAL_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_CONFIRMATION_BLOCKS: u64 = 12;
const DEFAULT_MAX_RECONNECT_TRIES: u32 = 5;
const DEFAULT_STATS_DB_PATH: &str = "warden-stats.db";

pub struct Config {
    /// Ordered WS endpoints; reconnect rotates through them.
    pub ws_urls: Vec<String>,
    pub chain_id: u64,
    pub tracker_address: Address,
    pub factory_address: Address,
    /// Controlled accounts, in wallet order.
    pub accounts: Vec<Address>,
    pub claiming_enabled: bool,
    pub scan_interval_ms: u64,
    pub scan_spread: u64,
    pub chain_interval_ms: u64,
    pub confirmation_blocks: u64,
    pub max_reconnect_tries: u32,
    pub stats_db_path: String,
    pub gas_price_api_url: Option<String>,
    pub max_claim_deposit_wei: U256,
    pub min_claim_bounty_wei: U256,
}

fn require(name: &str) -> Result<String> {
    env::var(name).map_err(|_| EngineError::MissingConfig(format!("{name} must be set")).into())
}

fn validate_ws_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.parse::<reqwest::Url>().map_err(|e| {
        EngineError::InvalidConfig(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(EngineError::InvalidConfig(format!(
            "{name} must use ws(s) scheme, got `{other}`"
        ))
        .into()),
    }
}

fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.parse::<reqwest::Url>().map_err(|e| {
        EngineError::InvalidConfig(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(EngineError::InvalidConfig(format!(
            "{name} must use http(s) scheme, got `{other}`"
        ))
        .into()),
    }
}

fn parse_address(name: &str, raw: &str) -> Result<Address> {
    raw.trim().parse::<Address>().map_err(|_| {
        EngineError::InvalidConfig(format!("{name} must be a 0x address, got `{raw}`")).into()
    })
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn load_clamped_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn load_wei(name: &str, default: U256) -> U256 {
    env::var(name)
        .ok()
        .and_then(|raw| crate::utils::hex::to_u256(&raw))
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let ws_raw = require("ETH_WS_URL")?;
        let ws_urls: Vec<String> = ws_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if ws_urls.is_empty() {
            return Err(EngineError::InvalidConfig(
                "ETH_WS_URL must contain at least one endpoint".to_string(),
            )
            .into());
        }
        for url in &ws_urls {
            validate_ws_url("ETH_WS_URL entry", url)?;
        }

        let chain_id_raw = require("CHAIN_ID")?;
        let chain_id = chain_id_raw.trim().parse::<u64>().map_err(|_| {
            EngineError::InvalidConfig(format!("CHAIN_ID must be a valid u64, got `{chain_id_raw}`"))
        })?;

        let tracker_address = parse_address("SCHEDULER_TRACKER_ADDRESS", &require("SCHEDULER_TRACKER_ADDRESS")?)?;
        let factory_address = parse_address("SCHEDULER_FACTORY_ADDRESS", &require("SCHEDULER_FACTORY_ADDRESS")?)?;

        let accounts_raw = require("WARDEN_ACCOUNTS")?;
        let mut accounts = Vec::new();
        for entry in accounts_raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            accounts.push(parse_address("WARDEN_ACCOUNTS entry", entry)?);
        }
        if accounts.is_empty() {
            return Err(EngineError::InvalidConfig(
                "WARDEN_ACCOUNTS must list at least one controlled account".to_string(),
            )
            .into());
        }

        let gas_price_api_url = env::var("GAS_PRICE_API_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(url) = gas_price_api_url.as_deref() {
            validate_http_url("GAS_PRICE_API_URL", url)?;
        }

        Ok(Self {
            ws_urls,
            chain_id,
            tracker_address,
            factory_address,
            accounts,
            claiming_enabled: env::var("CLAIMING_ENABLED")
                .ok()
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            scan_interval_ms: load_clamped_u64(
                "SCAN_INTERVAL_MS",
                DEFAULT_SCAN_INTERVAL_MS,
                500,
                60_000,
            ),
            scan_spread: load_clamped_u64("SCAN_SPREAD", DEFAULT_SCAN_SPREAD, 10, 1_000),
            chain_interval_ms: load_clamped_u64(
                "CHAIN_INTERVAL_MS",
                DEFAULT_CHAIN_INTERVAL_MS,
                30_000,
                3_600_000,
            ),
            confirmation_blocks: load_clamped_u64(
                "CONFIRMATION_BLOCKS",
                DEFAULT_CONFIRMATION_BLOCKS,
                1,
                64,
            ),
            max_reconnect_tries: load_clamped_u64("MAX_RECONNECT_TRIES", u64::from(DEFAULT_MAX_RECONNECT_TRIES), 1, 64)
                as u32,
            stats_db_path: env::var("STATS_DB_PATH")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_STATS_DB_PATH.to_string()),
            gas_price_api_url,
            max_claim_deposit_wei: load_wei("MAX_CLAIM_DEPOSIT_WEI", U256::MAX),
            min_claim_bounty_wei: load_wei("MIN_CLAIM_BOUNTY_WEI", U256::ZERO),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_keys() {
        for key in [
            "ETH_WS_URL",
            "CHAIN_ID",
            "SCHEDULER_TRACKER_ADDRESS",
            "SCHEDULER_FACTORY_ADDRESS",
            "WARDEN_ACCOUNTS",
            "CLAIMING_ENABLED",
            "SCAN_INTERVAL_MS",
            "GAS_PRICE_API_URL",
        ] {
            std::env::remove_var(key);
        }
    }

    fn set_minimum_valid_env() {
        std::env::set_var("ETH_WS_URL", "ws://localhost:8546");
        std::env::set_var("CHAIN_ID", "1");
        std::env::set_var(
            "SCHEDULER_TRACKER_ADDRESS",
            "0x72059fee98e3a3fa80618cb1446b550af0f5e1ec",
        );
        std::env::set_var(
            "SCHEDULER_FACTORY_ADDRESS",
            "0x48e258a63f5acd3630d9e2a4e2c6a9f8f6aed4e8",
        );
        std::env::set_var(
            "WARDEN_ACCOUNTS",
            "0xa4b197b83b06f97c1be081e95f872458f7f9a978",
        );
    }

    #[test]
    fn test_load_requires_ws_url() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys();
        assert!(Config::load().is_err());
        clear_keys();
    }

    #[test]
    fn test_load_rejects_http_scheme_for_ws_url() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys();
        set_minimum_valid_env();
        std::env::set_var("ETH_WS_URL", "http://localhost:8545");
        assert!(Config::load().is_err());
        clear_keys();
    }

    #[test]
    fn test_load_applies_defaults_and_clamps() {
        let _guard = env_lock().lock().expect("env lock");
        clear_keys();
        set_minimum_valid_env();
        std::env::set_var("SCAN_INTERVAL_MS", "1");

        let config = Config::load().expect("config");
        assert_eq!(config.scan_interval_ms, 500);
        assert_eq!(config.scan_spread, 50);
        assert_eq!(config.confirmation_blocks, 12);
        assert!(!config.claiming_enabled);
        assert_eq!(config.accounts.len(), 1);
        clear_keys();
    }
}
