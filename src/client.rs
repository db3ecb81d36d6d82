// src/client.rs
// API client for the marketplace mobile endpoint. Requests carry the fixed
// mobile-app fingerprint (user agent + auth token) and the segment's merged
// params; array-valued params serialize as repeated query keys. The fetch
// seam is a trait so workers can be driven by fakes in tests, and a factory
// seam lets a worker rebuild its client when it rotates proxies.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::catalog::Segment;
use crate::config::{ApiParams, EngineConfig};
use crate::error::FetchError;
use crate::proxy::ProxyHandle;

/// Everything one paged request needs: the segment's static merged params
/// plus this cycle's sampled price window.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub params: ApiParams,
    pub price_min: i64,
    pub price_max: i64,
    pub page_size: u32,
}

impl QuerySpec {
    pub fn for_cycle(segment: &Segment, price_min: i64, price_max: i64) -> Self {
        Self {
            params: segment.params.clone(),
            price_min,
            price_max,
            page_size: segment.page_size,
        }
    }
}

/// One listing as returned by the remote API. Typed fields are the ones the
/// engine itself needs; everything else rides along in `payload`.
#[derive(Debug, Clone)]
pub struct RawOffer {
    pub offer_id: String,
    pub price: Option<i64>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
}

#[derive(Debug, Clone)]
pub struct ListingPage {
    pub offers: Vec<RawOffer>,
    pub pagination: Option<Pagination>,
}

/// The fetch seam. `HttpFetcher` is the real implementation; tests drive
/// workers with scripted fakes.
#[async_trait]
pub trait ListingFetcher: Send + Sync {
    async fn fetch_page(&self, query: &QuerySpec, page: u32) -> Result<ListingPage, FetchError>;
}

/// Builds a fetcher bound to a proxy assignment. Workers call this once at
/// start and again after every proxy rotation.
pub trait FetcherFactory: Send + Sync {
    fn build(&self, proxy: Option<&ProxyHandle>) -> Result<Arc<dyn ListingFetcher>>;
}

// ---------------------------------------------------------------------------
// Real HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpFetcherFactory {
    api_url: String,
    auth_token: String,
    user_agent: String,
    blocked_statuses: Vec<u16>,
    timeout: std::time::Duration,
}

impl HttpFetcherFactory {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            api_url: cfg.api_url.clone(),
            auth_token: cfg.auth_token.clone(),
            user_agent: cfg.user_agent.clone(),
            blocked_statuses: cfg.blocked_status_codes.clone(),
            timeout: std::time::Duration::from_secs(cfg.request_timeout_secs),
        }
    }
}

impl FetcherFactory for HttpFetcherFactory {
    fn build(&self, proxy: Option<&ProxyHandle>) -> Result<Arc<dyn ListingFetcher>> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.timeout);
        if let Some(p) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(&p.url)?);
        }
        Ok(Arc::new(HttpFetcher {
            client: builder.build()?,
            api_url: self.api_url.clone(),
            auth_token: self.auth_token.clone(),
            blocked_statuses: self.blocked_statuses.clone(),
        }))
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    api_url: String,
    auth_token: String,
    blocked_statuses: Vec<u16>,
}

#[async_trait]
impl ListingFetcher for HttpFetcher {
    async fn fetch_page(&self, query: &QuerySpec, page: u32) -> Result<ListingPage, FetchError> {
        let pairs = query_pairs(query, page);
        let resp = self
            .client
            .get(&self.api_url)
            .header("Accept", "application/json")
            .header("X-Authorization", &self.auth_token)
            .query(&pairs)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = resp.status();
        if self.blocked_statuses.contains(&status.as_u16()) {
            return Err(FetchError::Blocked {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("http status {status}")));
        }

        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("decoding response: {e}")))?;
        Ok(body.into_page())
    }
}

/// Flatten the merged params + sampled window + page into query pairs.
/// Arrays become repeated keys (`roomsTotal=STUDIO&roomsTotal=1&...`).
pub fn query_pairs(query: &QuerySpec, page: u32) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(query.params.len() + 3);
    for (key, value) in &query.params {
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    pairs.push((key.clone(), scalar_to_string(item)));
                }
            }
            other => pairs.push((key.clone(), scalar_to_string(other))),
        }
    }
    pairs.push(("priceMin".to_string(), query.price_min.to_string()));
    pairs.push(("priceMax".to_string(), query.price_max.to_string()));
    pairs.push(("page".to_string(), page.to_string()));
    pairs
}

fn scalar_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    response: ResponseBody,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    offers: Vec<serde_json::Value>,
    pagination: Option<Pagination>,
}

impl SearchResponse {
    fn into_page(self) -> ListingPage {
        let offers = self
            .response
            .offers
            .into_iter()
            .filter_map(|v| {
                let parsed = parse_offer(v);
                if parsed.is_none() {
                    tracing::warn!(target: "client", "offer without usable offerId skipped");
                }
                parsed
            })
            .collect();
        ListingPage {
            offers,
            pagination: self.response.pagination,
        }
    }
}

/// Pull the typed fields out of one raw offer object. Offers without an
/// `offerId` are unusable and skipped upstream.
fn parse_offer(v: serde_json::Value) -> Option<RawOffer> {
    let offer_id = match v.get("offerId") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return None,
    };
    let price = v.pointer("/price/value").and_then(|p| p.as_i64());
    let address = v
        .pointer("/location/address")
        .and_then(|a| a.as_str())
        .map(str::to_string);
    let latitude = v.pointer("/location/point/latitude").and_then(|c| c.as_f64());
    let longitude = v.pointer("/location/point/longitude").and_then(|c| c.as_f64());
    let phone = v
        .pointer("/author/phones/0")
        .and_then(|p| p.as_str())
        .map(str::to_string);
    let created_at = v
        .get("creationDate")
        .and_then(|d| d.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Some(RawOffer {
        offer_id,
        price,
        address,
        latitude,
        longitude,
        phone,
        created_at,
        payload: v,
    })
}
