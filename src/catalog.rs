// src/catalog.rs
// Segment Catalog: resolves the configuration tree into an ordered list of
// immutable Segment values, one per (location, category) pair. Merging
// happens exactly once here; workers never touch shared config state.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::{ApiParams, CategoryConfig, EngineConfig};
use crate::error::ConfigError;

/// Identity of one unit of work: (location, category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SegmentId {
    pub location_id: u32,
    pub category_id: u32,
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.location_id, self.category_id)
    }
}

/// Two-element sampling ranges for the price window, extracted from the
/// category's `priceMin`/`priceMax` params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceBounds {
    pub min_low: i64,
    pub min_high: i64,
    pub max_low: i64,
    pub max_high: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepBounds {
    pub min_us: u64,
    pub max_us: u64,
}

/// One resolved (location, category) unit of work. Immutable for the
/// lifetime of its worker; a config change requires a restart.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: SegmentId,
    /// Human-readable label for logs and status reports.
    pub name: String,
    pub rgid: u64,
    /// Merged request parameters (base ⊕ category overrides), with the
    /// price ranges extracted and `rgid` injected. Sent as-is each cycle,
    /// plus the sampled price window and page number.
    pub params: ApiParams,
    pub price: PriceBounds,
    pub sleep: SleepBounds,
    pub filter_today_only: bool,
    /// Per-page result count, read from the merged params (default 20).
    pub page_size: u32,
}

/// Resolve the configured locations/categories into segments, ordered by
/// (location_id, category_id). All validation that must abort startup lives
/// here: inverted bounds, malformed keys, empty trees.
pub fn resolve_segments(cfg: &EngineConfig) -> Result<Vec<Segment>, ConfigError> {
    if cfg.locations.is_empty() {
        return Err(ConfigError::NoLocations);
    }
    if cfg.proxy.enabled && cfg.proxy.list.is_empty() {
        return Err(ConfigError::EmptyProxyList);
    }
    if cfg.market_utc_offset_hours.abs() > 23 {
        return Err(ConfigError::BadUtcOffset(cfg.market_utc_offset_hours));
    }

    // BTreeMap<String, _> sorts lexicographically; re-key numerically so
    // "10" does not sort before "2".
    let mut locations: BTreeMap<u32, &crate::config::LocationConfig> = BTreeMap::new();
    for (key, loc) in &cfg.locations {
        let id: u32 = key
            .parse()
            .map_err(|_| ConfigError::BadLocationKey(key.clone()))?;
        locations.insert(id, loc);
    }

    let mut out = Vec::new();
    for (location_id, loc) in locations {
        if loc.categories.is_empty() {
            return Err(ConfigError::EmptyLocation { location_id });
        }
        let mut categories: BTreeMap<u32, &CategoryConfig> = BTreeMap::new();
        for (key, cat) in &loc.categories {
            let id: u32 = key.parse().map_err(|_| ConfigError::BadCategoryKey {
                location_id,
                key: key.clone(),
            })?;
            categories.insert(id, cat);
        }

        for (category_id, cat) in categories {
            let id = SegmentId {
                location_id,
                category_id,
            };
            out.push(resolve_one(cfg, id, &loc.name, loc.rgid, cat)?);
        }
    }
    Ok(out)
}

fn resolve_one(
    cfg: &EngineConfig,
    id: SegmentId,
    location_name: &str,
    rgid: u64,
    cat: &CategoryConfig,
) -> Result<Segment, ConfigError> {
    let mut params = merge_params(&cfg.request, &cat.api_params);

    let (min_low, min_high) = take_range(&mut params, "priceMin", &id)?;
    let (max_low, max_high) = take_range(&mut params, "priceMax", &id)?;
    let price = PriceBounds {
        min_low,
        min_high,
        max_low,
        max_high,
    };

    // Paging is driven by the worker, not the static params.
    params.remove("page");
    params.insert("rgid".to_string(), serde_json::json!(rgid));

    let page_size = params
        .get("pageSize")
        .and_then(|v| v.as_u64())
        .unwrap_or(20) as u32;

    let sleep = SleepBounds {
        min_us: cat.sleep_min_us.unwrap_or(cfg.sleep_min_us),
        max_us: cat.sleep_max_us.unwrap_or(cfg.sleep_max_us),
    };
    if sleep.min_us > sleep.max_us {
        return Err(ConfigError::InvertedSleepBounds {
            segment: id.to_string(),
            min_us: sleep.min_us,
            max_us: sleep.max_us,
        });
    }

    Ok(Segment {
        id,
        name: format!("{} / category {}", location_name, id.category_id),
        rgid,
        params,
        price,
        sleep,
        filter_today_only: cat.filter_today_only,
        page_size,
    })
}

/// Category keys override base keys of the same name. Array values replace
/// wholesale. A boolean `false` removes the inherited key (the upstream
/// config disables `roomsTotal` this way for commercial categories).
fn merge_params(base: &ApiParams, overrides: &ApiParams) -> ApiParams {
    let mut merged = base.clone();
    for (k, v) in overrides {
        if v.as_bool() == Some(false) {
            merged.remove(k);
        } else {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Pull a `[low, high]` range out of the merged params, validating order.
fn take_range(
    params: &mut ApiParams,
    key: &'static str,
    id: &SegmentId,
) -> Result<(i64, i64), ConfigError> {
    let missing = || ConfigError::MissingPriceRange {
        segment: id.to_string(),
        param: key,
    };
    let value = params.remove(key).ok_or_else(missing)?;
    let arr = value.as_array().ok_or_else(missing)?;
    if arr.len() != 2 {
        return Err(missing());
    }
    let low = arr[0].as_i64().ok_or_else(missing)?;
    let high = arr[1].as_i64().ok_or_else(missing)?;
    if low > high {
        return Err(ConfigError::InvertedPriceBounds {
            segment: id.to_string(),
            param: key,
            low,
            high,
        });
    }
    Ok((low, high))
}
