//! Device configuration.
//!
//! Defaults can be overridden from JSON (missing fields keep their defaults)
//! or from the environment:
//! - `IONRS_PAGE_SIZE`: allocation granularity in bytes (power of two).
//! - `IONRS_MAX_DESCRIPTORS`: capacity of the device-owned descriptor table.
//! - `IONRS_RECLAIM_GRACE_MS`: how long a signalled victim may take to exit.
//! - `IONRS_RECLAIM_RETRY_MS`: sleep between allocation retries under reclaim.
//! - `IONRS_RECLAIM_MAX_RETRIES`: bound on those retries.
//!
//! Unparsable environment values fall back to the default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IonError, Result};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_MAX_DESCRIPTORS: usize = 1024;

/// Settings for the allocation-failure reclaim protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Deadline given to a signalled victim before another may be chosen.
    pub grace_period_ms: u64,
    /// Sleep between allocation retries.
    pub retry_sleep_ms: u64,
    /// Maximum number of retries after a successful reclaim request.
    pub max_retries: u32,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 1000,
            retry_sleep_ms: 1,
            max_retries: 2000,
        }
    }
}

impl ReclaimConfig {
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub const fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub page_size: usize,
    pub max_descriptors: usize,
    pub reclaim: ReclaimConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
            reclaim: ReclaimConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Defaults overlaid with any `IONRS_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DeviceConfig::from_env`] with an injectable variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        overlay(&lookup, "IONRS_PAGE_SIZE", &mut config.page_size);
        overlay(&lookup, "IONRS_MAX_DESCRIPTORS", &mut config.max_descriptors);
        overlay(
            &lookup,
            "IONRS_RECLAIM_GRACE_MS",
            &mut config.reclaim.grace_period_ms,
        );
        overlay(
            &lookup,
            "IONRS_RECLAIM_RETRY_MS",
            &mut config.reclaim.retry_sleep_ms,
        );
        overlay(
            &lookup,
            "IONRS_RECLAIM_MAX_RETRIES",
            &mut config.reclaim.max_retries,
        );
        config
    }

    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| IonError::invalid(format!("device config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(IonError::invalid(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.max_descriptors == 0 {
            return Err(IonError::invalid("descriptor limit must be non-zero"));
        }
        Ok(())
    }

    /// Round `len` up to the page size. `None` on overflow.
    #[must_use]
    pub fn page_align(&self, len: usize) -> Option<usize> {
        let mask = self.page_size - 1;
        len.checked_add(mask).map(|n| n & !mask)
    }

    #[must_use]
    pub fn page_count(&self, len: usize) -> usize {
        len.div_ceil(self.page_size)
    }
}

fn overlay<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(value) = lookup(key).and_then(|v| v.trim().parse().ok()) {
        *slot = value;
    }
}
