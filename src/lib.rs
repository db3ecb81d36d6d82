// src/lib.rs
// Public library surface for integration tests and for embedding the engine
// in a larger application (the web/CRM side consumes listings through the
// Sink trait and never reaches into the engine).

pub mod catalog;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod jitter;
pub mod proxy;
pub mod sink;
pub mod supervisor;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::catalog::{resolve_segments, PriceBounds, Segment, SegmentId, SleepBounds};
pub use crate::client::{
    FetcherFactory, HttpFetcherFactory, ListingFetcher, ListingPage, QuerySpec, RawOffer,
};
pub use crate::config::{EngineConfig, PriceSampling};
pub use crate::dedup::DedupCache;
pub use crate::error::{ConfigError, FetchError, SinkError, WorkerError};
pub use crate::proxy::{ProxyHandle, ProxyPool};
pub use crate::sink::{ListingRecord, LogSink, Sink};
pub use crate::supervisor::{ShutdownHandle, Supervisor};
pub use crate::worker::{SegmentStatus, StatusSnapshot, Worker, WorkerKnobs, WorkerState};
