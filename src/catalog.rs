//! Catalog search against the NASA CMR granule listing.
//!
//! Translates the product, spatial filter and time range into one paged
//! granule search, follows pages until the service reports no more entries,
//! and deduplicates the flat candidate list by granule id (overlapping tiles
//! can list the same scene twice).

use std::collections::HashSet;

use serde::Deserialize;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, info, warn};

use crate::error::SubsetError;
use crate::filter::{Filter, TimeRange};
use crate::types::{Granule, ProductSpec, RetryPolicy};

/// CMR granule search endpoint.
pub const CMR_GRANULE_SEARCH: &str = "https://cmr.earthdata.nasa.gov/search/granules.json";

/// Granules requested per page. The listing is paged server-side; small
/// pages keep individual responses cheap for the subsetter-sized result
/// sets this tool works with.
const PAGE_SIZE: usize = 10;

/// Link relation CMR uses for direct data access URLs.
const DATA_REL: &str = "/data#";

#[derive(Deserialize)]
struct SearchResponse {
    feed: Feed,
}

#[derive(Deserialize)]
struct Feed {
    #[serde(default)]
    entry: Vec<Entry>,
}

#[derive(Deserialize)]
struct Entry {
    id: String,
    producer_granule_id: Option<String>,
    title: Option<String>,
    time_start: Option<String>,
    time_end: Option<String>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Deserialize)]
struct Link {
    rel: String,
    href: String,
    #[serde(default)]
    inherited: bool,
}

impl Entry {
    /// Map a catalog entry to a [`Granule`], or `None` when the entry
    /// carries no direct data link.
    fn into_granule(self) -> Option<Granule> {
        let download_url = self
            .links
            .iter()
            .find(|link| link.rel.ends_with(DATA_REL) && !link.inherited)
            .map(|link| link.href.clone())?;
        let producer_granule_id = self
            .producer_granule_id
            .or(self.title)
            .unwrap_or_else(|| self.id.clone());
        Some(Granule {
            id: self.id,
            producer_granule_id,
            time_start: self.time_start,
            time_end: self.time_end,
            download_url,
        })
    }
}

/// Client for the CMR granule search.
pub struct CatalogClient {
    client: reqwest::Client,
    endpoint: String,
    policy: RetryPolicy,
}

impl CatalogClient {
    /// Create a catalog client against the production CMR endpoint.
    pub fn new(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self::with_endpoint(client, CMR_GRANULE_SEARCH, policy)
    }

    /// Create a catalog client against a specific search endpoint.
    pub fn with_endpoint(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            policy,
        }
    }

    /// List every granule matching the product, spatial filter and time
    /// range, deduplicated by id in first-seen order.
    ///
    /// The first page gets a bounded retry; if it still fails the search is
    /// [`SubsetError::CatalogUnavailable`]. A failure on a later page keeps
    /// everything collected so far and surfaces it as
    /// [`SubsetError::PartialCatalogResult`] for the caller to decide on.
    pub async fn plan(
        &self,
        product: &ProductSpec,
        filter: Option<&Filter>,
        time_range: Option<&TimeRange>,
    ) -> Result<Vec<Granule>, SubsetError> {
        let mut granules = Vec::new();
        let mut seen = HashSet::new();
        let mut page_num = 1usize;
        loop {
            let page = match self.fetch_page(product, filter, time_range, page_num).await {
                Ok(page) => page,
                Err(e) if page_num == 1 => {
                    return Err(SubsetError::CatalogUnavailable(e.to_string()));
                }
                Err(e) => {
                    warn!(page = page_num, error = %e, "Catalog page failed; keeping partial list");
                    return Err(SubsetError::PartialCatalogResult {
                        granules,
                        reason: e.to_string(),
                    });
                }
            };
            if page.is_empty() {
                break;
            }
            let added = merge_page(&mut granules, &mut seen, page);
            debug!(page = page_num, added, total = granules.len(), "Catalog page merged");
            page_num += 1;
        }
        info!(
            product = %product.product,
            version = %product.version,
            granules = granules.len(),
            "Catalog query complete"
        );
        Ok(granules)
    }

    /// Fetch and parse one page, retrying transient failures with the
    /// shared backoff policy.
    async fn fetch_page(
        &self,
        product: &ProductSpec,
        filter: Option<&Filter>,
        time_range: Option<&TimeRange>,
        page_num: usize,
    ) -> Result<Vec<Granule>, SubsetError> {
        let strategy = self.policy.retry_strategy();
        Retry::spawn(strategy, || async move {
            match self.request_page(product, filter, time_range, page_num).await {
                Ok(page) => Ok(page),
                Err(e) => {
                    if is_retryable(&e) {
                        warn!(page = page_num, error = %e, "Catalog request failed; will retry");
                        RetryError::to_transient(e)
                    } else {
                        RetryError::to_permanent(e)
                    }
                }
            }
        })
        .await
    }

    async fn request_page(
        &self,
        product: &ProductSpec,
        filter: Option<&Filter>,
        time_range: Option<&TimeRange>,
        page_num: usize,
    ) -> Result<Vec<Granule>, SubsetError> {
        let mut params: Vec<(&str, String)> = vec![
            ("short_name", product.product.short_name().to_string()),
            ("version", product.version.clone()),
        ];
        if let Some(filter) = filter {
            let (key, value) = filter.cmr_query_param();
            params.push((key, value));
        }
        if let Some(range) = time_range {
            params.push(("temporal", range.cmr_temporal_value()));
        }
        params.push(("page_size", PAGE_SIZE.to_string()));
        params.push(("page_num", page_num.to_string()));

        let response = self
            .client
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        let parsed: SearchResponse = response.json().await?;
        let page = parsed
            .feed
            .entry
            .into_iter()
            .filter_map(|entry| {
                let id = entry.id.clone();
                let granule = entry.into_granule();
                if granule.is_none() {
                    warn!(granule = %id, "Catalog entry has no data link; skipping");
                }
                granule
            })
            .collect();
        Ok(page)
    }
}

/// Whether a catalog failure is worth retrying (timeouts, transport
/// errors, 5xx and 429 responses).
fn is_retryable(err: &SubsetError) -> bool {
    match err {
        SubsetError::Http(e) => match e.status() {
            Some(status) => {
                status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            None => true,
        },
        _ => false,
    }
}

/// Append a page to the accumulated granule list, dropping ids already
/// seen. Returns how many granules were added.
pub(crate) fn merge_page(
    granules: &mut Vec<Granule>,
    seen: &mut HashSet<String>,
    page: Vec<Granule>,
) -> usize {
    let before = granules.len();
    for granule in page {
        if seen.insert(granule.id.clone()) {
            granules.push(granule);
        }
    }
    granules.len() - before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granule(id: &str) -> Granule {
        Granule {
            id: id.to_string(),
            producer_granule_id: format!("{id}.h5"),
            time_start: None,
            time_end: None,
            download_url: format!("https://example.com/{id}"),
        }
    }

    #[test]
    fn test_merge_page_deduplicates_across_pages() {
        let mut granules = Vec::new();
        let mut seen = HashSet::new();
        let page_one = vec![granule("G1"), granule("G2")];
        let page_two = vec![granule("G2"), granule("G3")];
        assert_eq!(merge_page(&mut granules, &mut seen, page_one), 2);
        assert_eq!(merge_page(&mut granules, &mut seen, page_two), 1);
        let ids: Vec<&str> = granules.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["G1", "G2", "G3"]);
    }

    #[test]
    fn test_merge_page_preserves_first_seen_order() {
        let mut granules = Vec::new();
        let mut seen = HashSet::new();
        merge_page(&mut granules, &mut seen, vec![granule("B"), granule("A")]);
        merge_page(&mut granules, &mut seen, vec![granule("A"), granule("C")]);
        let ids: Vec<&str> = granules.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_entry_maps_to_granule() {
        let body = r#"{
            "feed": {
                "entry": [{
                    "id": "G1234-LPDAAC_ECS",
                    "producer_granule_id": "GEDI02_A_2019108002012_O01959_T03909_02_001_01.h5",
                    "time_start": "2019-04-18T00:20:12.000Z",
                    "time_end": "2019-04-18T01:52:59.000Z",
                    "links": [
                        {"rel": "http://esipfed.org/ns/fedsearch/1.1/metadata#", "href": "https://example.com/meta.xml"},
                        {"rel": "http://esipfed.org/ns/fedsearch/1.1/data#", "href": "https://example.com/GEDI02_A.h5"}
                    ]
                }]
            }
        }"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        let entries = parsed.feed.entry;
        assert_eq!(entries.len(), 1);
        let granule = entries.into_iter().next().unwrap().into_granule().unwrap();
        assert_eq!(granule.id, "G1234-LPDAAC_ECS");
        assert_eq!(
            granule.producer_granule_id,
            "GEDI02_A_2019108002012_O01959_T03909_02_001_01.h5"
        );
        assert_eq!(granule.download_url, "https://example.com/GEDI02_A.h5");
        assert_eq!(granule.time_start.as_deref(), Some("2019-04-18T00:20:12.000Z"));
    }

    #[test]
    fn test_entry_without_data_link_is_dropped() {
        let body = r#"{
            "feed": {
                "entry": [{
                    "id": "G1",
                    "links": [
                        {"rel": "http://esipfed.org/ns/fedsearch/1.1/metadata#", "href": "https://example.com/meta.xml"}
                    ]
                }]
            }
        }"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        let granule = parsed.feed.entry.into_iter().next().unwrap().into_granule();
        assert!(granule.is_none());
    }

    #[test]
    fn test_inherited_collection_links_are_ignored() {
        let body = r#"{
            "feed": {
                "entry": [{
                    "id": "G1",
                    "links": [
                        {"rel": "http://esipfed.org/ns/fedsearch/1.1/data#", "href": "https://example.com/collection", "inherited": true},
                        {"rel": "http://esipfed.org/ns/fedsearch/1.1/data#", "href": "https://example.com/granule.h5"}
                    ]
                }]
            }
        }"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        let granule = parsed
            .feed
            .entry
            .into_iter()
            .next()
            .unwrap()
            .into_granule()
            .unwrap();
        assert_eq!(granule.download_url, "https://example.com/granule.h5");
    }

    #[test]
    fn test_empty_feed_parses() {
        let parsed: SearchResponse = serde_json::from_str(r#"{"feed": {}}"#).unwrap();
        assert!(parsed.feed.entry.is_empty());
    }
}
