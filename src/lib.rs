//! GediSub - Acquire subset GEDI altimetry granules from the NASA LP.DAAC subsetter
//!
//! This library queries the NASA CMR catalog for GEDI granules matching a
//! spatial and temporal filter, then downloads the per-granule subset files
//! with authenticated, concurrent transfers.
//!
//! # Features
//!
//! - **Spatiotemporal Filtering**: Bounding box or GeoJSON polygon plus an
//!   optional ISO-8601 time range
//! - **Paged Catalog Search**: Follows the CMR paged listing and
//!   deduplicates granules across overlapping tiles
//! - **Concurrent Downloads**: Bounded worker pool with per-granule retry
//!   and exponential backoff
//! - **Graceful Cancellation**: Ctrl+C lets in-flight transfers finish and
//!   marks the rest cancelled
//! - **Earthdata Login**: Credentials from a flag, netrc file or prompt,
//!   exchanged for a shared session token
//!
//! # Example
//!
//! ```no_run
//! use gedisub::{
//!     CatalogClient, Credentials, DownloadScheduler, Filter, HttpSubsetFetcher, Product,
//!     ProductSpec, RetryPolicy, ShutdownCoordinator, TimeRange, TokenProvider,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = reqwest::Client::builder().cookie_store(true).build()?;
//! let filter = Filter::parse_bbox("40.0,-100.0,42.0,-96.0")?;
//! let time_range = TimeRange::parse("2019-04-01T00:00:00,2019-04-30T23:59:59")?;
//! let spec = ProductSpec::new(Product::Gedi02A, "002");
//!
//! let catalog = CatalogClient::new(client.clone(), RetryPolicy::default());
//! let granules = catalog.plan(&spec, Some(&filter), Some(&time_range)).await?;
//!
//! let credentials = Credentials::resolve(None, std::path::Path::new(".netrc"))?;
//! let tokens = TokenProvider::login(client.clone(), credentials).await?;
//! let fetcher = Arc::new(HttpSubsetFetcher::new(
//!     client,
//!     tokens,
//!     Some(&filter),
//!     Some(&time_range),
//!     0o775,
//! ));
//!
//! let scheduler = DownloadScheduler::new(2, RetryPolicy::default(), ShutdownCoordinator::shared());
//! let results = scheduler
//!     .run(granules, fetcher, std::path::Path::new("./data"))
//!     .await;
//! # Ok(())
//! # }
//! ```

/// Earthdata Login credentials and session tokens
pub mod auth;

/// CMR catalog search
pub mod catalog;

/// Per-granule subset download
pub mod download;

/// Error taxonomy
pub mod error;

/// Spatial and temporal filters
pub mod filter;

/// Download scheduling and retry state machine
pub mod scheduler;

/// Run-level cancellation coordination
pub mod shutdown;

/// Core data structures
pub mod types;

pub use auth::{Credentials, SessionToken, TokenProvider};
pub use catalog::CatalogClient;
pub use download::{HttpSubsetFetcher, SubsetFetcher};
pub use error::{DownloadErrorKind, SubsetError};
pub use filter::{Filter, TimeRange};
pub use scheduler::DownloadScheduler;
pub use shutdown::{SharedShutdown, ShutdownCoordinator};
pub use types::{
    failure_count, DownloadOutcome, DownloadResult, Granule, Product, ProductSpec, RetryPolicy,
};
