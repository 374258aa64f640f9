use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Metrics collector, if active, it provides Counters and Timers
#[derive(Clone)]
pub struct Metrics {
    metrics: Option<Arc<ActiveMetrics>>,
}

/// Metrics that can be collected during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Counter of nodes split for lack of room
    NodeSplits,
    /// Counter of sibling nodes merged into one
    NodeMerges,
    /// Counter of entry moves between siblings that could not be merged
    Redistributions,
    /// Counter of roots replaced by their only child
    RootCollapses,
    /// Counter of blocks cloned on write
    BlockClones,
    /// Counter of blocks released after their last reference was dropped
    BlocksFreed,
    /// Timer used to record average time of a mutating tree operation
    UpdateTime,
}

struct ActiveMetrics {
    node_splits: AtomicU64,
    node_merges: AtomicU64,
    redistributions: AtomicU64,
    root_collapses: AtomicU64,
    block_clones: AtomicU64,
    blocks_freed: AtomicU64,
    update_time: Timer,
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the specified input
    pub fn new(active: bool) -> Self {
        Self {
            metrics: if active {
                Some(Arc::new(ActiveMetrics {
                    node_splits: AtomicU64::new(0),
                    node_merges: AtomicU64::new(0),
                    redistributions: AtomicU64::new(0),
                    root_collapses: AtomicU64::new(0),
                    block_clones: AtomicU64::new(0),
                    blocks_freed: AtomicU64::new(0),
                    update_time: Timer::new(),
                }))
            } else {
                None
            },
        }
    }

    fn counter(metrics: &ActiveMetrics, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::NodeSplits => &metrics.node_splits,
            Metric::NodeMerges => &metrics.node_merges,
            Metric::Redistributions => &metrics.redistributions,
            Metric::RootCollapses => &metrics.root_collapses,
            Metric::BlockClones => &metrics.block_clones,
            Metric::BlocksFreed => &metrics.blocks_freed,
            _ => panic!("Specified metric is not a Counter"),
        }
    }

    /// Increase the Counter specified by the input
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count(&self, metric: Metric) {
        if let Some(ref metrics) = self.metrics {
            Self::counter(metrics, metric).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current value of a Counter. Always 0 when collection is off.
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn get(&self, metric: Metric) -> u64 {
        match self.metrics {
            Some(ref metrics) => Self::counter(metrics, metric).load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// Returns a guard that, when dropped, will record the time passed since creation
    ///
    /// panics if the specified [`Metric`] is not a Timer
    pub fn record<'a>(&'a self, metric: Metric) -> Option<impl Drop + 'a> {
        self.metrics.as_ref().map(|metrics| {
            let timer = match metric {
                Metric::UpdateTime => &metrics.update_time,
                _ => panic!("Specified metric is not a Timer"),
            };

            timer.record()
        })
    }

    /// Print collected metrics to stdout
    pub fn print(&self) {
        if let Some(ref metrics) = self.metrics {
            println!("metrics");

            let node_splits = metrics.node_splits.load(Ordering::Relaxed);
            println!("  node splits           {}", node_splits);

            let node_merges = metrics.node_merges.load(Ordering::Relaxed);
            println!("  node merges           {}", node_merges);

            let redistributions = metrics.redistributions.load(Ordering::Relaxed);
            println!("  redistributions       {}", redistributions);

            let root_collapses = metrics.root_collapses.load(Ordering::Relaxed);
            println!("  root collapses        {}", root_collapses);

            let block_clones = metrics.block_clones.load(Ordering::Relaxed);
            println!("  block clones          {}", block_clones);

            let blocks_freed = metrics.blocks_freed.load(Ordering::Relaxed);
            println!("  blocks freed          {}", blocks_freed);

            if let Some(mean) = metrics.update_time.mean() {
                println!("  update mean           {}", pretty_display_ns(mean));
            }
        } else {
            println!("Metrics collection was not activated")
        }
    }
}

fn pretty_display_ns(ns: u64) -> String {
    // preserve 3 sig figs at minimum.
    let (val, unit) = if ns > 100 * 1_000_000_000 {
        (ns / 1_000_000_000, "s")
    } else if ns > 100 * 1_000_000 {
        (ns / 1_000_000, "ms")
    } else if ns > 100 * 1_000 {
        (ns / 1_000, "us")
    } else {
        (ns, "ns")
    };

    format!("{val} {unit}")
}

struct Timer {
    number_of_records: AtomicU64,
    sum: AtomicU64,
}

impl Timer {
    fn new() -> Self {
        Timer {
            number_of_records: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    fn mean(&self) -> Option<u64> {
        let n = self.number_of_records.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        sum.checked_div(n)
    }

    fn record<'a>(&'a self) -> impl Drop + 'a {
        struct TimerGuard<'a> {
            start: std::time::Instant,
            n: &'a AtomicU64,
            sum: &'a AtomicU64,
        }

        impl Drop for TimerGuard<'_> {
            fn drop(&mut self) {
                let elapsed = self.start.elapsed().as_nanos() as u64;
                self.n.fetch_add(1, Ordering::Relaxed);
                self.sum.fetch_add(elapsed, Ordering::Relaxed);
            }
        }

        TimerGuard {
            start: std::time::Instant::now(),
            n: &self.number_of_records,
            sum: &self.sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_metrics_count_nothing() {
        let metrics = Metrics::new(false);
        metrics.count(Metric::NodeSplits);
        assert_eq!(metrics.get(Metric::NodeSplits), 0);
        assert!(metrics.record(Metric::UpdateTime).is_none());
    }

    #[test]
    fn clones_share_counters() {
        let metrics = Metrics::new(true);
        let other = metrics.clone();
        metrics.count(Metric::NodeMerges);
        other.count(Metric::NodeMerges);
        assert_eq!(metrics.get(Metric::NodeMerges), 2);
        drop(other.record(Metric::UpdateTime));
    }
}
