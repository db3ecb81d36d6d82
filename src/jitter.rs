// src/jitter.rs
// Randomized per-cycle query parameters: price windows sampled in 1000-unit
// steps from the segment's configured ranges (the remote service expects
// round prices) and jittered inter-cycle sleeps.

use std::time::Duration;

use rand::Rng;

use crate::catalog::{PriceBounds, SleepBounds};

/// Sample a `(priceMin, priceMax)` window. Each side is `low + k * 1000` for
/// a uniform `k`, so a sample never leaves its configured range.
///
/// `priceMin < priceMax` must hold for the request to make sense. Configured
/// ranges are disjoint in practice, so a violation is rare: resample once,
/// then clamp the min side to one step below max, staying at or above the
/// low bound whenever that still leaves min < max.
pub fn sample_price_window_with<R: Rng + ?Sized>(b: &PriceBounds, rng: &mut R) -> (i64, i64) {
    let mut min = sample_step(b.min_low, b.min_high, rng);
    let max = sample_step(b.max_low, b.max_high, rng);
    if min >= max {
        min = sample_step(b.min_low, b.min_high, rng);
    }
    if min >= max {
        min = (max - 1000).max(b.min_low);
        if min >= max {
            min = max - 1000;
        }
    }
    (min, max)
}

fn sample_step<R: Rng + ?Sized>(low: i64, high: i64, rng: &mut R) -> i64 {
    let steps = (high - low) / 1000;
    low + rng.random_range(0..=steps) * 1000
}

/// Sample a sleep duration uniformly from `[min_us, max_us]` inclusive.
pub fn sample_sleep_with<R: Rng + ?Sized>(b: &SleepBounds, rng: &mut R) -> Duration {
    Duration::from_micros(rng.random_range(b.min_us..=b.max_us))
}

/// Thread-rng convenience wrappers. The rng is created and dropped inside
/// the call so workers never hold a `ThreadRng` across an await point.
pub fn sample_price_window(b: &PriceBounds) -> (i64, i64) {
    sample_price_window_with(b, &mut rand::rng())
}

pub fn sample_sleep(b: &SleepBounds) -> Duration {
    sample_sleep_with(b, &mut rand::rng())
}
