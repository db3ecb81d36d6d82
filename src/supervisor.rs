// src/supervisor.rs
// Enumerates segments, spawns one worker task per segment, restarts crashed
// workers within a bounded budget, and owns the two engine-wide timers: the
// dedup cache rotation tick and the status log tick. A single watch channel
// propagates shutdown to everything.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge};
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::catalog::{resolve_segments, Segment};
use crate::client::FetcherFactory;
use crate::config::EngineConfig;
use crate::dedup::DedupCache;
use crate::proxy::ProxyPool;
use crate::sink::Sink;
use crate::worker::{SegmentStatus, StatusSnapshot, Worker, WorkerKnobs};

/// One-time metrics registration (so series show up wherever the embedding
/// app exports them).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_cycles_total", "Completed fetch cycles across all segments.");
        describe_counter!("ingest_novel_total", "Novel listings handed to the sink.");
        describe_counter!("ingest_seen_total", "Listings suppressed by the dedup cache.");
        describe_counter!("ingest_fetch_errors_total", "Failed fetch cycles.");
        describe_counter!("ingest_blocked_total", "Fetch failures classified as blocks.");
        describe_counter!("ingest_sink_errors_total", "Records dropped after the sink retry.");
        describe_counter!("ingest_cache_rotations_total", "Dedup cache rotations.");
        describe_counter!("ingest_worker_restarts_total", "Worker restarts by the supervisor.");
        describe_gauge!("ingest_last_cycle_ts", "Unix ts of the most recent completed cycle.");
    });
}

/// Clonable trigger for process-wide shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct Supervisor {
    segments: Vec<Segment>,
    knobs: WorkerKnobs,
    fetchers: Arc<dyn FetcherFactory>,
    sink: Arc<dyn Sink>,
    cache: Arc<DedupCache>,
    pool: Arc<ProxyPool>,
    statuses: Vec<Arc<SegmentStatus>>,
    cache_rotation: Duration,
    status_interval: Duration,
    max_restarts: u32,
    restart_window: Duration,
    restart_delay: Duration,
    shutdown_grace: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Resolve the catalog and wire up the shared resources. Configuration
    /// errors abort here, before anything is spawned.
    pub fn new(
        cfg: &EngineConfig,
        fetchers: Arc<dyn FetcherFactory>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self> {
        ensure_metrics_described();
        let segments = resolve_segments(cfg)?;

        let cache = Arc::new(DedupCache::new(segments.iter().map(|s| s.id)));
        let pool = if cfg.proxy.enabled {
            Arc::new(ProxyPool::new(
                cfg.proxy.list.clone(),
                Duration::from_secs(cfg.proxy.cooldown_secs),
            ))
        } else {
            Arc::new(ProxyPool::disabled())
        };
        let statuses = segments
            .iter()
            .map(|s| Arc::new(SegmentStatus::new(s)))
            .collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            segments,
            knobs: WorkerKnobs::from_config(cfg),
            fetchers,
            sink,
            cache,
            pool,
            statuses,
            cache_rotation: Duration::from_secs(cfg.cache_rotation_minutes * 60),
            status_interval: Duration::from_secs(cfg.supervisor.status_interval_secs),
            max_restarts: cfg.supervisor.max_restarts,
            restart_window: Duration::from_secs(cfg.supervisor.restart_window_secs),
            restart_delay: Duration::from_millis(cfg.supervisor.restart_delay_ms),
            shutdown_grace: Duration::from_secs(cfg.supervisor.shutdown_grace_secs),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Per-segment health report for the operator surface.
    pub fn status(&self) -> Vec<StatusSnapshot> {
        self.statuses.iter().map(|s| s.snapshot()).collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Run until shutdown is triggered. Spawns one supervise task per
    /// segment plus the rotation and status timers, then joins everything.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            target: "supervisor",
            segments = self.segments.len(),
            proxies = !self.pool.is_empty(),
            "starting workers"
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.segments.len());
        for (segment, status) in self.segments.iter().zip(&self.statuses) {
            handles.push(self.spawn_supervised(segment.clone(), Arc::clone(status)));
        }

        let rotation = self.spawn_rotation_timer();
        let status_tick = self.spawn_status_timer();

        // Join all supervise tasks. Once shutdown is triggered, the rest of
        // the join is bounded by the grace period: a worker must observe
        // cancellation within one sleep quantum or request timeout, and we
        // don't wait forever for one that doesn't.
        let join_all = async {
            for h in handles {
                if let Err(e) = h.await {
                    tracing::error!(target: "supervisor", error = %e, "supervise task panicked");
                }
            }
        };
        tokio::pin!(join_all);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            _ = &mut join_all => {}
            _ = shutdown.changed() => {
                if tokio::time::timeout(self.shutdown_grace, &mut join_all)
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        target: "supervisor",
                        grace_secs = self.shutdown_grace.as_secs(),
                        "grace period elapsed before all workers stopped"
                    );
                }
            }
        }

        // workers are gone (or abandoned); stop the timers too
        let _ = self.shutdown_tx.send(true);
        let _ = rotation.await;
        let _ = status_tick.await;

        tracing::info!(target: "supervisor", "all workers stopped");
        Ok(())
    }

    /// Supervise one segment: run the worker, restart on unexpected exit
    /// with a short delay, give up after `max_restarts` inside the rolling
    /// window and mark the segment permanently failed.
    fn spawn_supervised(&self, segment: Segment, status: Arc<SegmentStatus>) -> JoinHandle<()> {
        let knobs = self.knobs.clone();
        let fetchers = Arc::clone(&self.fetchers);
        let sink = Arc::clone(&self.sink);
        let cache = Arc::clone(&self.cache);
        let pool = Arc::clone(&self.pool);
        let shutdown = self.shutdown_rx.clone();
        let max_restarts = self.max_restarts;
        let restart_window = self.restart_window;
        let restart_delay = self.restart_delay;

        tokio::spawn(async move {
            let mut restart_times: VecDeque<Instant> = VecDeque::new();
            loop {
                let worker = Worker::new(
                    segment.clone(),
                    knobs.clone(),
                    Arc::clone(&fetchers),
                    Arc::clone(&sink),
                    Arc::clone(&cache),
                    Arc::clone(&pool),
                    Arc::clone(&status),
                    shutdown.clone(),
                );

                match worker.run().await {
                    // clean exit: cancellation observed
                    Ok(()) => break,
                    Err(err) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        let now = Instant::now();
                        while let Some(&t) = restart_times.front() {
                            if now.duration_since(t) > restart_window {
                                restart_times.pop_front();
                            } else {
                                break;
                            }
                        }
                        if restart_times.len() >= max_restarts as usize {
                            status.mark_permanently_failed();
                            tracing::error!(
                                target: "supervisor",
                                segment = %segment.id,
                                error = %err,
                                restarts = restart_times.len(),
                                "restart budget exhausted, segment permanently failed"
                            );
                            break;
                        }
                        restart_times.push_back(now);
                        status.mark_restarted();
                        counter!("ingest_worker_restarts_total").increment(1);
                        tracing::warn!(
                            target: "supervisor",
                            segment = %segment.id,
                            error = %err,
                            attempt = restart_times.len(),
                            "worker crashed, restarting"
                        );

                        let mut shutdown = shutdown.clone();
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(restart_delay) => {}
                        }
                    }
                }
            }
        })
    }

    /// Global rotation timer; the swap itself runs per segment-bucket inside
    /// `DedupCache::rotate`.
    fn spawn_rotation_timer(&self) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let mut shutdown = self.shutdown_rx.clone();
        let period = self.cache_rotation;
        tokio::spawn(async move {
            if period.is_zero() {
                // rotation disabled; buckets grow until restart
                return;
            }
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick is not a rotation
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => cache.rotate(),
                }
            }
        })
    }

    fn spawn_status_timer(&self) -> JoinHandle<()> {
        let statuses: Vec<Arc<SegmentStatus>> = self.statuses.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let period = self.status_interval;
        tokio::spawn(async move {
            if period.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        for status in &statuses {
                            let snap = status.snapshot();
                            tracing::info!(
                                target: "supervisor",
                                segment = %snap.segment,
                                state = ?snap.state,
                                cycles = snap.cycles,
                                novel = snap.novel,
                                seen = snap.seen,
                                streak = snap.failure_streak,
                                restarts = snap.restarts,
                                proxy = snap.current_proxy.as_deref().unwrap_or("direct"),
                                failed = snap.permanently_failed,
                                "segment status"
                            );
                        }
                    }
                }
            }
        })
    }
}
