// src/error.rs
// Error taxonomy for the ingestion engine. Configuration problems are fatal
// at startup; everything else is contained inside one worker.

use thiserror::Error;

/// Fatal startup errors. Any of these aborts the engine before a single
/// worker is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("location key {0:?} is not a numeric id")]
    BadLocationKey(String),

    #[error("category key {key:?} under location {location_id} is not a numeric id")]
    BadCategoryKey { location_id: u32, key: String },

    #[error("location {location_id} declares no categories")]
    EmptyLocation { location_id: u32 },

    #[error("no locations configured")]
    NoLocations,

    #[error("segment {segment}: missing or malformed {param} range (expected [low, high])")]
    MissingPriceRange { segment: String, param: &'static str },

    #[error("segment {segment}: inverted {param} bounds ({low} > {high})")]
    InvertedPriceBounds {
        segment: String,
        param: &'static str,
        low: i64,
        high: i64,
    },

    #[error("segment {segment}: inverted sleep bounds ({min_us} > {max_us})")]
    InvertedSleepBounds {
        segment: String,
        min_us: u64,
        max_us: u64,
    },

    #[error("proxy pool enabled but the proxy list is empty")]
    EmptyProxyList,

    #[error("market_utc_offset_hours {0} is not a valid UTC offset")]
    BadUtcOffset(i32),
}

/// A single fetch attempt against the remote marketplace API.
///
/// `Blocked` means the remote service actively rejected the current client
/// identity (rate limit / anti-bot); it triggers proxy rotation rather than
/// plain backoff. Which statuses count as a block is configuration, not code.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blocked by remote service (status {status})")]
    Blocked { status: u16 },

    #[error("transient fetch failure: {0}")]
    Transient(String),
}

impl FetchError {
    pub fn is_block(&self) -> bool {
        matches!(self, FetchError::Blocked { .. })
    }
}

/// Persistence failure for one listing record. Never aborts a cycle; the
/// worker retries the record once, then drops it with a warning.
#[derive(Debug, Error)]
#[error("sink rejected listing {external_id}: {reason}")]
pub struct SinkError {
    pub external_id: String,
    pub reason: String,
}

/// Fatal for one worker only. The supervisor decides whether to restart.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("segment {segment}: {streak} consecutive failures, worker giving up")]
    FailureStreakExceeded { segment: String, streak: u32 },

    #[error("segment {segment}: failed to build API client: {reason}")]
    ClientBuild { segment: String, reason: String },
}
