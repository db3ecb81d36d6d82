// src/sink.rs
// The persistence boundary. The surrounding application (store, CRM, web
// API) sits behind this trait; the engine hands each novel listing over by
// value and retains nothing. Implementations must be idempotent under retry:
// the same external ID emitted twice is an upsert, never a duplicate row —
// re-emission after a cache rotation is expected behavior.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::SegmentId;
use crate::client::RawOffer;
use crate::error::SinkError;

/// A deduplicated listing as handed downstream.
#[derive(Debug, Clone, Serialize)]
pub struct ListingRecord {
    /// External marketplace ID, unique within the source.
    pub external_id: String,
    /// Source identifier from configuration, tags which marketplace this is.
    pub source_id: i64,
    /// Segment the listing was discovered under.
    pub segment: SegmentId,
    pub rgid: u64,
    pub price: Option<i64>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    /// Full raw offer object for downstream fields the engine doesn't type.
    pub payload: serde_json::Value,
    pub discovered_at: DateTime<Utc>,
}

impl ListingRecord {
    pub fn from_offer(offer: RawOffer, segment: SegmentId, rgid: u64, source_id: i64) -> Self {
        Self {
            external_id: offer.offer_id,
            source_id,
            segment,
            rgid,
            price: offer.price,
            address: offer.address,
            latitude: offer.latitude,
            longitude: offer.longitude,
            phone: offer.phone,
            payload: offer.payload,
            discovered_at: Utc::now(),
        }
    }
}

/// Workers call this concurrently without coordination; implementations
/// handle their own synchronization.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn ingest(&self, record: ListingRecord) -> Result<(), SinkError>;
}

/// Log-only sink for standalone runs; the real store lives in the embedding
/// application.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn ingest(&self, record: ListingRecord) -> Result<(), SinkError> {
        tracing::info!(
            target: "sink",
            segment = %record.segment,
            id = %record.external_id,
            price = record.price,
            address = record.address.as_deref().unwrap_or("-"),
            "listing ingested"
        );
        Ok(())
    }
}
