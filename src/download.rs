//! Per-granule subset download.
//!
//! One [`SubsetFetcher::fetch`] call issues the authenticated subset request
//! for a single granule, streams the body to a `.partial` file and renames
//! it into place once the transfer verified. The partial file is removed on
//! every other exit path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::auth::TokenProvider;
use crate::error::DownloadErrorKind;
use crate::filter::{Filter, TimeRange};
use crate::types::Granule;

/// Seam between the scheduler and the subset transfer, so scheduler
/// behavior is testable with a scripted fetcher.
#[async_trait]
pub trait SubsetFetcher: Send + Sync {
    /// Download one granule's subset into `dest_dir`.
    ///
    /// Returns the final path and byte size on success, or the
    /// classification of the failure.
    async fn fetch(
        &self,
        granule: &Granule,
        dest_dir: &Path,
    ) -> Result<(PathBuf, u64), DownloadErrorKind>;
}

/// Fetcher backed by the LP.DAAC subsetter over HTTPS.
pub struct HttpSubsetFetcher {
    client: reqwest::Client,
    tokens: Arc<TokenProvider>,
    subset_params: Vec<(String, String)>,
    mode: u32,
}

impl HttpSubsetFetcher {
    /// Build a fetcher that re-attaches the run's spatial and temporal
    /// filter to every per-granule subset request and applies `mode` to
    /// each completed file.
    pub fn new(
        client: reqwest::Client,
        tokens: Arc<TokenProvider>,
        filter: Option<&Filter>,
        time_range: Option<&TimeRange>,
        mode: u32,
    ) -> Self {
        let mut subset_params = Vec::new();
        if let Some(filter) = filter {
            let (key, value) = filter.cmr_query_param();
            subset_params.push((key.to_string(), value));
        }
        if let Some(range) = time_range {
            subset_params.push(("temporal".to_string(), range.cmr_temporal_value()));
        }
        Self {
            client,
            tokens,
            subset_params,
            mode,
        }
    }

    async fn send_request(
        &self,
        granule: &Granule,
    ) -> Result<reqwest::Response, DownloadErrorKind> {
        let (token, generation) = self
            .tokens
            .current()
            .await
            .map_err(|e| DownloadErrorKind::NonTransient(e.to_string()))?;
        let response = self
            .client
            .get(&granule.download_url)
            .query(&self.subset_params)
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // The token went stale mid-run; refresh once (single-flight
            // across workers) and repeat the request against the new token.
            debug!(granule = %granule.id, "Subset request rejected ({status}); refreshing token");
            let token = self
                .tokens
                .refresh(generation)
                .await
                .map_err(|e| DownloadErrorKind::NonTransient(e.to_string()))?;
            let retried = self
                .client
                .get(&granule.download_url)
                .query(&self.subset_params)
                .header(reqwest::header::AUTHORIZATION, token.bearer())
                .send()
                .await
                .map_err(classify_transport)?;
            let status = retried.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(DownloadErrorKind::AuthExpired);
            }
            return classify_status(retried);
        }
        classify_status(response)
    }
}

#[async_trait]
impl SubsetFetcher for HttpSubsetFetcher {
    async fn fetch(
        &self,
        granule: &Granule,
        dest_dir: &Path,
    ) -> Result<(PathBuf, u64), DownloadErrorKind> {
        let final_path = dest_dir.join(&granule.producer_granule_id);
        let partial_path = dest_dir.join(format!("{}.partial", granule.producer_granule_id));

        let response = self.send_request(granule).await?;
        let content_length = response.content_length();

        let mut guard = PartialGuard::new(partial_path.clone());
        let file = tokio::fs::File::create(&partial_path)
            .await
            .map_err(|e| DownloadErrorKind::NonTransient(format!("create {}: {e}", partial_path.display())))?;
        let mut file = BufWriter::new(file);

        let mut bytes_written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(piece) = stream.next().await {
            let chunk = piece.map_err(|e| {
                DownloadErrorKind::Transient(format!("connection lost mid-transfer: {e}"))
            })?;
            bytes_written += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadErrorKind::NonTransient(format!("write: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| DownloadErrorKind::NonTransient(format!("flush: {e}")))?;

        // An empty subset response is malformed, not worth retrying
        if bytes_written == 0 {
            return Err(DownloadErrorKind::NonTransient(
                "empty subset response".to_string(),
            ));
        }
        if let Some(expected) = content_length {
            if bytes_written != expected {
                return Err(DownloadErrorKind::Transient(format!(
                    "truncated transfer: expected {expected} bytes, got {bytes_written}"
                )));
            }
        } else {
            warn!(
                granule = %granule.id,
                "Content-Length header was not present; cannot verify transfer size"
            );
        }

        tokio::fs::rename(&partial_path, &final_path)
            .await
            .map_err(|e| DownloadErrorKind::NonTransient(format!("rename: {e}")))?;
        guard.disarm();

        apply_mode(&final_path, self.mode).await;
        Ok((final_path, bytes_written))
    }
}

/// Removes the partial file on drop unless the transfer completed.
struct PartialGuard {
    path: PathBuf,
    armed: bool,
}

impl PartialGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Map transport-layer failures (timeouts, resets, DNS) to the retryable
/// category.
fn classify_transport(err: reqwest::Error) -> DownloadErrorKind {
    if err.is_builder() || err.is_redirect() {
        DownloadErrorKind::NonTransient(err.to_string())
    } else {
        DownloadErrorKind::Transient(err.to_string())
    }
}

/// Map an HTTP response status to the error taxonomy, passing successes
/// through.
fn classify_status(response: reqwest::Response) -> Result<reqwest::Response, DownloadErrorKind> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(DownloadErrorKind::Transient(format!("HTTP {status}")))
    } else {
        Err(DownloadErrorKind::NonTransient(format!("HTTP {status}")))
    }
}

#[cfg(unix)]
async fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(mode);
    if let Err(e) = tokio::fs::set_permissions(path, permissions).await {
        warn!(path = %path.display(), error = %e, "Failed to set permission mode");
    }
}

#[cfg(not(unix))]
async fn apply_mode(_path: &Path, _mode: u32) {}
