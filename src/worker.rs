// src/worker.rs
// One worker owns one segment and drives its fetch → dedup → emit → sleep
// loop as a single tokio task. Failure handling splits two ways: a block
// (anti-bot rejection) spends the retry budget on proxy diversity with a
// flat wait, a transient error gets plain exponential backoff. Crossing the
// consecutive-failure ceiling stops this worker only; the supervisor decides
// what happens next.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;

use crate::catalog::{Segment, SegmentId};
use crate::client::{FetcherFactory, ListingFetcher, QuerySpec, RawOffer};
use crate::config::{EngineConfig, PriceSampling};
use crate::dedup::DedupCache;
use crate::error::{FetchError, WorkerError};
use crate::jitter;
use crate::proxy::{ProxyHandle, ProxyPool};
use crate::sink::{ListingRecord, Sink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Fetching,
    Deduping,
    Emitting,
    Sleeping,
    BackingOff,
    Stopped,
}

/// Live per-segment counters for the operator surface. Shared with the
/// supervisor; workers only ever bump atomics, so a status read never blocks
/// a fetch cycle.
#[derive(Debug)]
pub struct SegmentStatus {
    pub segment: SegmentId,
    pub name: String,
    cycles: AtomicU64,
    novel: AtomicU64,
    seen: AtomicU64,
    filtered_today: AtomicU64,
    failure_streak: AtomicU32,
    restarts: AtomicU32,
    permanently_failed: AtomicBool,
    state: Mutex<WorkerState>,
    current_proxy: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub segment: SegmentId,
    pub name: String,
    pub state: WorkerState,
    pub cycles: u64,
    pub novel: u64,
    pub seen: u64,
    pub filtered_today: u64,
    pub failure_streak: u32,
    pub restarts: u32,
    pub current_proxy: Option<String>,
    pub permanently_failed: bool,
}

impl SegmentStatus {
    pub fn new(segment: &Segment) -> Self {
        Self {
            segment: segment.id,
            name: segment.name.clone(),
            cycles: AtomicU64::new(0),
            novel: AtomicU64::new(0),
            seen: AtomicU64::new(0),
            filtered_today: AtomicU64::new(0),
            failure_streak: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            permanently_failed: AtomicBool::new(false),
            state: Mutex::new(WorkerState::Starting),
            current_proxy: Mutex::new(None),
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().expect("status mutex poisoned") = state;
    }

    fn set_proxy(&self, proxy: Option<&ProxyHandle>) {
        *self.current_proxy.lock().expect("status mutex poisoned") =
            proxy.map(|p| p.url.clone());
    }

    fn set_failure_streak(&self, streak: u32) {
        self.failure_streak.store(streak, Ordering::Relaxed);
    }

    pub fn mark_restarted(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_permanently_failed(&self) {
        self.permanently_failed.store(true, Ordering::Relaxed);
        self.set_state(WorkerState::Stopped);
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.permanently_failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            segment: self.segment,
            name: self.name.clone(),
            state: *self.state.lock().expect("status mutex poisoned"),
            cycles: self.cycles.load(Ordering::Relaxed),
            novel: self.novel.load(Ordering::Relaxed),
            seen: self.seen.load(Ordering::Relaxed),
            filtered_today: self.filtered_today.load(Ordering::Relaxed),
            failure_streak: self.failure_streak.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            current_proxy: self
                .current_proxy
                .lock()
                .expect("status mutex poisoned")
                .clone(),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
        }
    }
}

/// Engine knobs a worker needs, copied out of the config once.
#[derive(Debug, Clone)]
pub struct WorkerKnobs {
    pub source_id: i64,
    pub price_sampling: PriceSampling,
    pub max_consecutive_failures: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_pages: u32,
    /// The marketplace's local timezone; the today-only filter decides
    /// "today" here, not in UTC.
    pub market_offset: FixedOffset,
}

impl WorkerKnobs {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        // the offset range is validated at segment resolution
        let market_offset = FixedOffset::east_opt(cfg.market_utc_offset_hours.saturating_mul(3600))
            .unwrap_or_else(|| Utc.fix());
        Self {
            source_id: cfg.source_id,
            price_sampling: cfg.price_sampling,
            max_consecutive_failures: cfg.max_consecutive_failures,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
            max_pages: cfg.max_pages,
            market_offset,
        }
    }
}

pub struct Worker {
    segment: Segment,
    knobs: WorkerKnobs,
    fetchers: Arc<dyn FetcherFactory>,
    sink: Arc<dyn Sink>,
    cache: Arc<DedupCache>,
    pool: Arc<ProxyPool>,
    status: Arc<SegmentStatus>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segment: Segment,
        knobs: WorkerKnobs,
        fetchers: Arc<dyn FetcherFactory>,
        sink: Arc<dyn Sink>,
        cache: Arc<DedupCache>,
        pool: Arc<ProxyPool>,
        status: Arc<SegmentStatus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            segment,
            knobs,
            fetchers,
            sink,
            cache,
            pool,
            status,
            shutdown,
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drive the segment until cancellation (Ok) or a fatal failure streak
    /// (Err). Merged parameters are immutable for the whole run; only the
    /// sampled price window and the proxy assignment change between cycles.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        self.status.set_state(WorkerState::Starting);

        let mut proxy = self.pool.acquire();
        self.status.set_proxy(proxy.as_ref());
        let mut fetcher = self
            .fetchers
            .build(proxy.as_ref())
            .map_err(|e| WorkerError::ClientBuild {
                segment: self.segment.name.clone(),
                reason: e.to_string(),
            })?;

        let fixed_window = match self.knobs.price_sampling {
            PriceSampling::PerWorker => Some(jitter::sample_price_window(&self.segment.price)),
            PriceSampling::PerCycle => None,
        };

        let max_pages = self.knobs.max_pages;
        let mut streak: u32 = 0;
        while !self.cancelled() {
            self.status.set_state(WorkerState::Fetching);
            let (price_min, price_max) = fixed_window
                .unwrap_or_else(|| jitter::sample_price_window(&self.segment.price));
            let query = QuerySpec::for_cycle(&self.segment, price_min, price_max);

            // Dropping the fetch future on shutdown aborts the in-flight
            // request; nothing leaks past this select.
            let fetched = tokio::select! {
                _ = self.shutdown.changed() => break,
                res = fetch_cycle(fetcher.as_ref(), &query, max_pages) => res,
            };

            match fetched {
                Ok(offers) => {
                    streak = 0;
                    self.status.set_failure_streak(0);

                    let total = offers.len();
                    let novel = self.dedup(offers);
                    let emitted = self.emit(novel).await;

                    self.status.cycles.fetch_add(1, Ordering::Relaxed);
                    counter!("ingest_cycles_total").increment(1);
                    gauge!("ingest_last_cycle_ts")
                        .set(Utc::now().timestamp().max(0) as f64);
                    tracing::debug!(
                        target: "worker",
                        segment = %self.segment.id,
                        fetched = total,
                        emitted,
                        price_min,
                        price_max,
                        "cycle complete"
                    );

                    self.status.set_state(WorkerState::Sleeping);
                    let nap = jitter::sample_sleep(&self.segment.sleep);
                    tokio::select! {
                        _ = self.shutdown.changed() => break,
                        _ = tokio::time::sleep(nap) => {}
                    }
                }
                Err(err) => {
                    streak += 1;
                    self.status.set_failure_streak(streak);
                    counter!("ingest_fetch_errors_total").increment(1);
                    tracing::warn!(
                        target: "worker",
                        segment = %self.segment.id,
                        streak,
                        error = %err,
                        "fetch cycle failed"
                    );

                    if streak >= self.knobs.max_consecutive_failures {
                        self.status.set_state(WorkerState::Stopped);
                        return Err(WorkerError::FailureStreakExceeded {
                            segment: self.segment.name.clone(),
                            streak,
                        });
                    }

                    self.status.set_state(WorkerState::BackingOff);
                    let wait = if err.is_block() && !self.pool.is_empty() {
                        counter!("ingest_blocked_total").increment(1);
                        if let Some(old) = proxy.take() {
                            self.pool.mark_blocked(&old);
                        }
                        proxy = self.pool.acquire();
                        self.status.set_proxy(proxy.as_ref());
                        match self.fetchers.build(proxy.as_ref()) {
                            Ok(f) => {
                                fetcher = f;
                                if proxy.is_some() {
                                    // fresh identity: flat base wait, not an
                                    // escalated backoff
                                    self.knobs.backoff_base
                                } else {
                                    // pool exhausted, everything cooling down
                                    self.knobs.backoff_max
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    target: "worker",
                                    segment = %self.segment.id,
                                    error = %e,
                                    "client rebuild failed after proxy rotation"
                                );
                                self.knobs.backoff_max
                            }
                        }
                    } else {
                        if err.is_block() {
                            counter!("ingest_blocked_total").increment(1);
                        }
                        exponential_backoff(
                            self.knobs.backoff_base,
                            self.knobs.backoff_max,
                            streak,
                        )
                    };

                    tokio::select! {
                        _ = self.shutdown.changed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        if let Some(p) = proxy.take() {
            self.pool.release(&p);
        }
        self.status.set_state(WorkerState::Stopped);
        tracing::info!(target: "worker", segment = %self.segment.id, "worker stopped");
        Ok(())
    }

    /// Partition a cycle's offers into novel vs already-seen. Duplicates
    /// *within* the cycle (overlap across pages) count as seen too. Offers
    /// rejected by the today-only filter go into the dedup bucket as well —
    /// their date won't change, so they are examined once per rotation
    /// window, not on every cycle.
    fn dedup(&self, offers: Vec<RawOffer>) -> Vec<RawOffer> {
        self.status.set_state(WorkerState::Deduping);
        let now = Utc::now();

        let mut batch_ids: HashSet<String> = HashSet::new();
        let mut novel = Vec::new();
        let mut seen_count = 0u64;
        let mut filtered = 0u64;

        for offer in offers {
            if self.cache.seen(self.segment.id, &offer.offer_id)
                || !batch_ids.insert(offer.offer_id.clone())
            {
                seen_count += 1;
                continue;
            }
            if self.segment.filter_today_only
                && !created_today(offer.created_at, self.knobs.market_offset, now)
            {
                self.cache.record(self.segment.id, &offer.offer_id, now);
                filtered += 1;
                continue;
            }
            novel.push(offer);
        }

        self.status.seen.fetch_add(seen_count, Ordering::Relaxed);
        self.status
            .filtered_today
            .fetch_add(filtered, Ordering::Relaxed);
        counter!("ingest_seen_total").increment(seen_count);
        novel
    }

    /// Hand novel records to the sink, one retry each. Records are
    /// independent: a failed one never aborts the batch. Whether the sink
    /// took the record or dropped it after the retry, the ID goes into the
    /// dedup bucket — "dropped" means dropped for this rotation window, not
    /// hammered every cycle.
    async fn emit(&self, novel: Vec<RawOffer>) -> u64 {
        self.status.set_state(WorkerState::Emitting);
        let mut emitted = 0u64;

        for offer in novel {
            let id = offer.offer_id.clone();
            let record = ListingRecord::from_offer(
                offer,
                self.segment.id,
                self.segment.rgid,
                self.knobs.source_id,
            );

            let mut result = self.sink.ingest(record.clone()).await;
            if result.is_err() {
                result = self.sink.ingest(record).await;
            }

            match result {
                Ok(()) => {
                    emitted += 1;
                    self.status.novel.fetch_add(1, Ordering::Relaxed);
                    counter!("ingest_novel_total").increment(1);
                }
                Err(e) => {
                    counter!("ingest_sink_errors_total").increment(1);
                    tracing::warn!(
                        target: "worker",
                        segment = %self.segment.id,
                        id = %id,
                        error = %e,
                        "sink rejected record twice, dropping"
                    );
                }
            }
            self.cache.record(self.segment.id, &id, Utc::now());
        }
        emitted
    }
}

/// Fetch all pages for one cycle, sequentially, starting at page 0. Stops
/// when a page comes back short, the pagination total is reached, or the
/// page cap is hit.
async fn fetch_cycle(
    fetcher: &dyn ListingFetcher,
    query: &QuerySpec,
    max_pages: u32,
) -> Result<Vec<RawOffer>, FetchError> {
    let mut offers = Vec::new();
    for page in 0..max_pages.max(1) {
        let result = fetcher.fetch_page(query, page).await?;
        let got = result.offers.len();
        offers.extend(result.offers);

        if got < query.page_size as usize {
            break;
        }
        if let Some(p) = result.pagination {
            if offers.len() as u64 >= p.total_items {
                break;
            }
        }
    }
    Ok(offers)
}

/// Was the offer created on the current day in the marketplace's timezone?
/// Comparing in UTC would misclassify listings created near local midnight.
/// Undated offers fail the filter.
fn created_today(created_at: Option<DateTime<Utc>>, offset: FixedOffset, now: DateTime<Utc>) -> bool {
    match created_at {
        Some(ts) => {
            ts.with_timezone(&offset).date_naive() == now.with_timezone(&offset).date_naive()
        }
        None => false,
    }
}

fn exponential_backoff(base: Duration, max: Duration, streak: u32) -> Duration {
    let exp = streak.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}
