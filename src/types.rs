//! Data structures for catalog search and subset retrieval.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// GEDI data products served by the LP.DAAC subsetter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Product {
    /// Level 1B Geolocated Waveforms
    #[serde(rename = "GEDI01_B")]
    Gedi01B,
    /// Level 2A Elevation and Height Metrics
    #[serde(rename = "GEDI02_A")]
    Gedi02A,
    /// Level 2B Canopy Cover and Vertical Profile Metrics
    #[serde(rename = "GEDI02_B")]
    Gedi02B,
}

impl Product {
    /// Catalog short name for this product.
    pub fn short_name(&self) -> &'static str {
        match self {
            Product::Gedi01B => "GEDI01_B",
            Product::Gedi02A => "GEDI02_A",
            Product::Gedi02B => "GEDI02_B",
        }
    }

    /// Human-readable product description.
    pub fn description(&self) -> &'static str {
        match self {
            Product::Gedi01B => "Level 1B Geolocated Waveforms",
            Product::Gedi02A => "Level 2A Elevation and Height Metrics",
            Product::Gedi02B => "Level 2B Canopy Cover and Vertical Profile Metrics",
        }
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

impl FromStr for Product {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GEDI01_B" => Ok(Product::Gedi01B),
            "GEDI02_A" => Ok(Product::Gedi02A),
            "GEDI02_B" => Ok(Product::Gedi02B),
            _ => Err(format!(
                "invalid product: {s} (expected GEDI01_B, GEDI02_A or GEDI02_B)"
            )),
        }
    }
}

/// Product and dataset version selected for a run. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductSpec {
    /// GEDI product short name.
    pub product: Product,
    /// Dataset version string (e.g. `"002"`).
    pub version: String,
}

impl ProductSpec {
    /// Pair a product with a dataset version.
    pub fn new(product: Product, version: impl Into<String>) -> Self {
        Self {
            product,
            version: version.into(),
        }
    }
}

/// One discrete data product instance listed by the catalog.
///
/// Produced by the catalog search, consumed read-only by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Granule {
    /// Opaque catalog concept identifier.
    pub id: String,
    /// Producer filename for the granule (used as the local filename).
    pub producer_granule_id: String,
    /// Temporal coverage start, as reported by the catalog.
    pub time_start: Option<String>,
    /// Temporal coverage end, as reported by the catalog.
    pub time_end: Option<String>,
    /// URL the subsetter serves this granule's data from.
    pub download_url: String,
}

/// Final outcome of one granule download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Subset file written and verified.
    Succeeded {
        /// Final path of the downloaded file.
        path: PathBuf,
        /// Size of the downloaded file in bytes.
        bytes: u64,
        /// Number of attempts made, including the successful one.
        attempts: u32,
    },
    /// Download terminated without an output file.
    Failed {
        /// Terminating error classification.
        kind: crate::error::DownloadErrorKind,
        /// Number of attempts made before giving up.
        attempts: u32,
    },
    /// Download not attempted.
    Skipped {
        /// Why the granule was skipped.
        reason: String,
    },
}

/// Per-granule result record. Created when a granule reaches a terminal
/// state and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    /// Catalog identifier of the granule this result belongs to.
    pub granule_id: String,
    /// Terminal outcome.
    pub outcome: DownloadOutcome,
}

impl DownloadResult {
    /// Whether this granule counts against the process exit status.
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, DownloadOutcome::Failed { .. })
    }
}

/// Count of failed granules in a result set. Drives the exit-code policy.
pub fn failure_count(results: &[DownloadResult]) -> usize {
    results.iter().filter(|r| r.is_failure()).count()
}

/// Bounded retry policy shared by the catalog search and the download
/// scheduler.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per operation, including the first.
    pub max_attempts: u32,
    /// Backoff delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the given attempt number (1-based), before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(2u32.pow(exp));
        delay.min(self.max_delay)
    }

    /// Jittered exponential delay sequence for `tokio_retry2::Retry`,
    /// bounded to `max_attempts - 1` retries.
    pub fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        let base_ms = self.base_delay.as_millis().max(2) as u64;
        tokio_retry2::strategy::ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2)
            .max_delay_millis(self.max_delay.as_millis() as u64)
            .map(tokio_retry2::strategy::jitter)
            .take(self.max_attempts.saturating_sub(1) as usize)
    }
}
