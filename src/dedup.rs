use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

pub const DEFAULT_TTL_SECS: i64 = 1800;
pub const DEFAULT_STALENESS_SECS: i64 = 600;
pub const DEFAULT_MAX_ENTRIES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Duplicate,
    Stale,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSettings {
    pub ttl_secs: i64,
    pub staleness_secs: i64,
    pub max_entries: usize,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            staleness_secs: DEFAULT_STALENESS_SECS,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Trace-id dedup map plus a staleness gate for platform pushes.
///
/// All timestamps are epoch based: `seen_at` and `now_sec` in seconds,
/// `created_at_ms` in milliseconds.
#[derive(Debug)]
pub struct FreshnessFilter {
    settings: FilterSettings,
    seen: HashMap<String, i64>,
    order: VecDeque<(String, i64)>,
}

impl FreshnessFilter {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            settings,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn admit(&mut self, trace_id: &str, created_at_ms: i64, now_sec: i64) -> bool {
        self.check(trace_id, created_at_ms, now_sec).is_admitted()
    }

    /// Prune, then reject duplicates before stale messages. Only admitted
    /// trace ids are recorded.
    pub fn check(&mut self, trace_id: &str, created_at_ms: i64, now_sec: i64) -> Admission {
        self.prune(now_sec);
        if self.seen.contains_key(trace_id) {
            return Admission::Duplicate;
        }

        let age_ms = now_sec.saturating_mul(1000).saturating_sub(created_at_ms);
        if age_ms > self.settings.staleness_secs.saturating_mul(1000) {
            return Admission::Stale;
        }

        self.seen.insert(trace_id.to_string(), now_sec);
        self.order.push_back((trace_id.to_string(), now_sec));

        while self.seen.len() > self.settings.max_entries {
            if let Some((old_id, _)) = self.order.pop_front() {
                self.seen.remove(&old_id);
            }
        }

        debug_assert_eq!(
            self.seen.len(),
            self.order.len(),
            "FreshnessFilter: HashMap and VecDeque out of sync"
        );
        Admission::Admitted
    }

    /// Drop every entry with `seen_at < now_sec - ttl`. Returns the number removed.
    pub fn prune(&mut self, now_sec: i64) -> usize {
        let cutoff = now_sec.saturating_sub(self.settings.ttl_secs);
        // Insertion order is not time order when the wall clock steps back.
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| *seen_at >= cutoff);
        self.order.retain(|(_, seen_at)| *seen_at >= cutoff);
        before - self.seen.len()
    }

    pub fn contains(&self, trace_id: &str) -> bool {
        self.seen.contains_key(trace_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Lock-guarded filter shared by the push entry point and the sweeper.
#[derive(Clone, Debug)]
pub struct SharedFilter {
    inner: Arc<Mutex<FreshnessFilter>>,
}

impl SharedFilter {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FreshnessFilter::new(settings))),
        }
    }

    pub fn check(&self, trace_id: &str, created_at_ms: i64, now_sec: i64) -> Admission {
        self.inner.lock().check(trace_id, created_at_ms, now_sec)
    }

    pub fn prune(&self, now_sec: i64) -> usize {
        self.inner.lock().prune(now_sec)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Prune on a fixed interval so the map shrinks even when pushes stop.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let filter = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let removed = filter.prune(now_secs());
                if removed > 0 {
                    tracing::debug!(
                        target = "feishu_relay::dedup",
                        removed,
                        remaining = filter.len(),
                        "swept expired trace ids"
                    );
                }
            }
        })
    }
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
