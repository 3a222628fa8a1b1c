//! Process configuration, loaded from a TOML file and overridable by
//! environment variables (`DEX_PROXY__SECTION__KEY`-style is intentionally
//! not supported; config is small enough that a single file is clearer).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::{DexProxyErrorContext, DexProxyResult};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub poller: PollerConfig,
    pub venues: HashMap<String, VenueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_redis_pool_min")]
    pub min_pool_size: u32,
    #[serde(default = "default_redis_pool_max")]
    pub max_pool_size: u32,
}

fn default_redis_pool_min() -> u32 {
    1
}

fn default_redis_pool_max() -> u32 {
    10
}

/// Poller intervals, grounded on `rest_order_status_syncer.py`'s
/// constructor arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub start_polling_after_insert_ms: u64,
    pub order_records_poll_interval_ms: u64,
    pub order_action_records_poll_interval_ms: u64,
    pub refetch_order_action_records_after_s: u64,
    pub mark_insert_failed_only_after_s: u64,
    pub finalising_rejected_inserts_poll_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            start_polling_after_insert_ms: 200,
            order_records_poll_interval_ms: 500,
            order_action_records_poll_interval_ms: 500,
            refetch_order_action_records_after_s: 30,
            mark_insert_failed_only_after_s: 60,
            finalising_rejected_inserts_poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub kind: String,
    #[serde(default)]
    pub max_gas_price_wei: Option<u128>,
    #[serde(default)]
    pub nonce_pool_size: Option<u64>,
    #[serde(default)]
    pub extra: Option<toml::Value>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> DexProxyResult<Self> {
        let raw = std::fs::read_to_string(path).dex_context("reading config file")?;

        let config: Self = toml::from_str(&raw).dex_context("parsing config file")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            listen_addr = "0.0.0.0:8080"

            [venues.drift]
            kind = "drift"
            max_gas_price_wei = 5000000000
        "#;

        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.poller.order_records_poll_interval_ms, 500);
        assert_eq!(
            config.venues.get("drift").unwrap().max_gas_price_wei,
            Some(5_000_000_000)
        );
    }
}
