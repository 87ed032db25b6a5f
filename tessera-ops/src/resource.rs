//! Surface proxies and their flush-wide usage intervals.
//!
//! ## Usage
//!
//! Tasks report which proxies each chain touches with
//! [`OpsTask::gather_proxy_intervals`](crate::OpsTask::gather_proxy_intervals);
//! the allocator then instantiates proxies in first-use order and reports
//! whether any of them failed.

use rustc_hash::FxHashMap as HashMap;
use tracing::{debug, warn};

use crate::render_pass::Gpu;

/// Identifies a lazily instantiated GPU surface (texture or render target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId(pub u32);

/// Whether an interval represents a real use of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActualUse {
    /// The proxy is only pinned; nothing reads or writes it in this interval.
    No,
    /// The proxy is read or written.
    Yes,
}

/// Whether the backing surface may be handed to another proxy after the
/// interval ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowRecycling {
    /// The surface may be reused.
    Yes,
    /// The surface must stay with this proxy.
    No,
}

/// The op-index range over which a proxy is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// The proxy.
    pub proxy: ProxyId,
    /// First op index using the proxy.
    pub start: u32,
    /// Last op index using the proxy (inclusive).
    pub end: u32,
    /// Whether any use in the interval was real.
    pub actual_use: ActualUse,
    /// Whether the surface may be recycled afterwards.
    pub allow_recycling: AllowRecycling,
}

/// Records proxy usage intervals for a flush and instantiates the proxies.
///
/// Tasks only write to the allocator; nothing in the recording or scheduling
/// path reads intervals back within the same flush.
#[derive(Debug, Default)]
pub struct ResourceAllocator {
    cur_op: u32,
    intervals: HashMap<ProxyId, Interval>,
    failed: Vec<ProxyId>,
}

impl ResourceAllocator {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// The op index the next recorded use belongs to.
    pub fn cur_op(&self) -> u32 {
        self.cur_op
    }

    /// Advances the op index.
    pub fn inc_ops(&mut self) {
        self.cur_op += 1;
    }

    /// Records that `proxy` is used over `[start, end]`.
    ///
    /// A proxy that already has an interval is extended; a real use anywhere
    /// makes the whole interval a real use, and recycling is only allowed if
    /// every use allows it.
    pub fn add_interval(
        &mut self,
        proxy: ProxyId,
        start: u32,
        end: u32,
        actual_use: ActualUse,
        allow_recycling: AllowRecycling,
    ) {
        debug_assert!(start <= end, "interval for {proxy:?} is inverted");
        self.intervals
            .entry(proxy)
            .and_modify(|interval| {
                interval.start = interval.start.min(start);
                interval.end = interval.end.max(end);
                if actual_use == ActualUse::Yes {
                    interval.actual_use = ActualUse::Yes;
                }
                if allow_recycling == AllowRecycling::No {
                    interval.allow_recycling = AllowRecycling::No;
                }
            })
            .or_insert(Interval {
                proxy,
                start,
                end,
                actual_use,
                allow_recycling,
            });
    }

    /// Returns the interval recorded for `proxy`.
    pub fn interval(&self, proxy: ProxyId) -> Option<&Interval> {
        self.intervals.get(&proxy)
    }

    /// Returns all intervals ordered by first use, ties broken by proxy id.
    pub fn intervals(&self) -> Vec<Interval> {
        let mut intervals: Vec<Interval> = self.intervals.values().copied().collect();
        intervals.sort_by_key(|interval| (interval.start, interval.proxy));
        intervals
    }

    /// Instantiates every recorded proxy in first-use order.
    ///
    /// Returns `true` if all proxies were instantiated. Failures do not stop
    /// the walk: the remaining proxies are still attempted so that unaffected
    /// work can render.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn instantiate(&mut self, gpu: &mut dyn Gpu) -> bool {
        self.failed.clear();
        for interval in self.intervals() {
            if gpu.is_instantiated(interval.proxy) {
                continue;
            }
            if !gpu.instantiate_proxy(interval.proxy) {
                warn!(
                    "Failed to instantiate {:?} (ops {}..={})",
                    interval.proxy, interval.start, interval.end
                );
                self.failed.push(interval.proxy);
            }
        }
        debug!(
            "Instantiated {} proxies, {} failed",
            self.intervals.len(),
            self.failed.len()
        );
        self.failed.is_empty()
    }

    /// Proxies that failed during the last [`ResourceAllocator::instantiate`].
    pub fn failed_proxies(&self) -> &[ProxyId] {
        &self.failed
    }

    /// Clears all intervals and restarts op numbering.
    pub fn reset(&mut self) {
        self.cur_op = 0;
        self.intervals.clear();
        self.failed.clear();
    }
}
