// src/proxy.rs
// Shared pool of upstream proxies. Selection is round-robin over healthy
// entries; a proxy marked blocked cools down for a fixed period and is
// skipped until it expires (checked lazily on the next acquire). With an
// empty or disabled pool, `acquire` returns None and workers go direct.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A checked-out proxy. Plain data; returning one to the pool is implicit
/// (the pool only tracks health, not leases).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHandle {
    pub index: usize,
    pub url: String,
}

#[derive(Debug)]
struct Entry {
    url: String,
    /// None = healthy; Some(t) = cooling down until t.
    cooling_until: Option<Instant>,
    last_used: Option<Instant>,
}

#[derive(Debug)]
struct State {
    entries: Vec<Entry>,
    cursor: usize,
}

#[derive(Debug)]
pub struct ProxyPool {
    state: Mutex<State>,
    cooldown: Duration,
}

impl ProxyPool {
    pub fn new(urls: Vec<String>, cooldown: Duration) -> Self {
        let entries = urls
            .into_iter()
            .map(|url| Entry {
                url,
                cooling_until: None,
                last_used: None,
            })
            .collect();
        Self {
            state: Mutex::new(State { entries, cursor: 0 }),
            cooldown,
        }
    }

    /// An always-empty pool; `acquire` returns None forever.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().expect("proxy pool mutex poisoned").entries.is_empty()
    }

    /// Next healthy proxy in round-robin order, or None when every entry is
    /// cooling down (or the pool is empty).
    pub fn acquire(&self) -> Option<ProxyHandle> {
        self.acquire_at(Instant::now())
    }

    pub fn mark_blocked(&self, handle: &ProxyHandle) {
        self.mark_blocked_at(handle, Instant::now());
    }

    // The *_at variants take an explicit clock so cooldown behavior is
    // testable without sleeping.

    pub fn acquire_at(&self, now: Instant) -> Option<ProxyHandle> {
        let mut state = self.state.lock().expect("proxy pool mutex poisoned");
        let n = state.entries.len();
        if n == 0 {
            return None;
        }
        for step in 0..n {
            let i = (state.cursor + step) % n;
            // lazy cooldown expiry
            if let Some(until) = state.entries[i].cooling_until {
                if now >= until {
                    state.entries[i].cooling_until = None;
                }
            }
            if state.entries[i].cooling_until.is_none() {
                state.cursor = (i + 1) % n;
                state.entries[i].last_used = Some(now);
                return Some(ProxyHandle {
                    index: i,
                    url: state.entries[i].url.clone(),
                });
            }
        }
        None
    }

    /// Return a proxy the worker is done with. The pool does not lease, so
    /// this only stamps last-used; the entry stays selectable throughout.
    pub fn release(&self, handle: &ProxyHandle) {
        let mut state = self.state.lock().expect("proxy pool mutex poisoned");
        if let Some(entry) = state.entries.get_mut(handle.index) {
            entry.last_used = Some(Instant::now());
        }
    }

    pub fn mark_blocked_at(&self, handle: &ProxyHandle, now: Instant) {
        let mut state = self.state.lock().expect("proxy pool mutex poisoned");
        if let Some(entry) = state.entries.get_mut(handle.index) {
            entry.cooling_until = Some(now + self.cooldown);
            tracing::warn!(
                target: "proxy",
                proxy = %entry.url,
                cooldown_secs = self.cooldown.as_secs(),
                "proxy marked blocked"
            );
        }
    }
}
