//! Negotiation timeouts
use std::time::Duration;

use anyhow::Context;

pub const COUNTERSIGN_TIMEOUT_ENV: &str = "SALE_COUNTERSIGN_TIMEOUT_MS";
pub const CERTIFY_TIMEOUT_ENV: &str = "SALE_CERTIFY_TIMEOUT_MS";
pub const DELIVERY_TIMEOUT_ENV: &str = "SALE_DELIVERY_TIMEOUT_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationConfig {
    /// Upper bound on one counterparty signature round-trip.
    pub countersign_timeout: Duration,
    /// Upper bound on the ordering authority's answer.
    pub certify_timeout: Duration,
    /// Upper bound on pushing or fetching committed versions between peers.
    pub delivery_timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            countersign_timeout: Duration::from_secs(30),
            certify_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl NegotiationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any timeout set in the environment (milliseconds).
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = read_millis(COUNTERSIGN_TIMEOUT_ENV)? {
            config.countersign_timeout = ms;
        }
        if let Some(ms) = read_millis(CERTIFY_TIMEOUT_ENV)? {
            config.certify_timeout = ms;
        }
        if let Some(ms) = read_millis(DELIVERY_TIMEOUT_ENV)? {
            config.delivery_timeout = ms;
        }
        Ok(config)
    }

    pub fn set_countersign_timeout(mut self, timeout: Duration) -> Self {
        self.countersign_timeout = timeout;
        self
    }

    pub fn set_certify_timeout(mut self, timeout: Duration) -> Self {
        self.certify_timeout = timeout;
        self
    }

    pub fn set_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }
}

fn read_millis(var: &str) -> anyhow::Result<Option<Duration>> {
    match std::env::var(var) {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{var} must be a number of milliseconds, got {raw:?}"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {var}")),
    }
}
