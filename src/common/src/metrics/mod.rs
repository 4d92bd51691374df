pub mod metric_def;

use crate::sys_utils::sys::hostname;
use metrics::{
    describe_counter, describe_gauge, describe_histogram, histogram, Histogram, IntoLabels,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::RwLock;

use crate::metrics::metric_def::list_all_metrics;
use std::sync::{Arc, Once};
use std::{fmt, vec};
use tracing::{info, warn};

static DEFAULT_BUCKETS: &[f64; 26] = &[
    1e+2, 2e+2, 4e+2, 6e+2, 8e+2, 1e+3, 2e+3, 4e+3, 6e+3, 8e+3, 1e+4, 2e+4, 4e+4, 6e+4, 8e+4, 1e+5,
    2e+5, 4e+5, 6e+5, 8e+5, 1e+6, 2e+6, 4e+6, 6e+6, 8e+6, 1e+7,
];

const DEFAULT_QUANTILES: &[f64; 9] = &[0.0, 0.5, 0.7, 0.8, 0.9, 0.95, 0.99, 0.999, 1.0];

#[derive(Debug, Clone, Copy)]
pub enum MetricType {
    Gauge,
    Counter,
    Histogram,
}

static PROMETHEUS_HANDLE: std::sync::LazyLock<Arc<RwLock<Option<PrometheusHandle>>>> =
    std::sync::LazyLock::new(|| Arc::new(RwLock::new(None)));

pub fn init_metrics_context() {
    static START: Once = Once::new();
    START.call_once(init_metrics)
}

fn init_metrics() {
    let recorder = PrometheusBuilder::new()
        .set_quantiles(DEFAULT_QUANTILES)
        .expect("can't set quantiles")
        .set_buckets(DEFAULT_BUCKETS)
        .expect("can't set buckets")
        .build_recorder();
    let mut prometheus_handle = PROMETHEUS_HANDLE.as_ref().write();
    *prometheus_handle = Some(recorder.handle());
    match metrics::set_global_recorder(recorder) {
        Ok(_) => {
            describe_all_metrics();
            info!("SqlGate init prometheus metrics context successfully!");
        }
        Err(e) => {
            warn!(
                "SqlGate init prometheus metrics context error.cause by {:?}",
                e.to_string()
            );
        }
    }
}

fn describe_all_metrics() {
    for metric in list_all_metrics().iter() {
        let (name, desc, _, metric_type) = metric.get_metrics_pair();
        match metric_type {
            MetricType::Gauge => describe_gauge!(name, desc),
            MetricType::Counter => describe_counter!(name, desc),
            MetricType::Histogram => describe_histogram!(name, desc),
        }
    }
}

pub fn try_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.as_ref().read().clone()
}

pub struct MetricsTimer {
    start: coarsetime::Instant,
    histogram: Histogram,
    observed: bool,
}

impl From<Histogram> for MetricsTimer {
    fn from(histogram: Histogram) -> MetricsTimer {
        MetricsTimer::from_histogram(histogram)
    }
}

impl fmt::Debug for MetricsTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsTimer")
            .field("start", &self.start)
            .field("observed", &self.observed)
            .finish()
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_millis();
        if !self.observed {
            self.histogram.record(elapsed as f64);
        }
    }
}

impl MetricsTimer {
    pub fn from_histogram(histogram: Histogram) -> Self {
        Self {
            start: coarsetime::Instant::now(),
            histogram,
            observed: false,
        }
    }

    pub fn new(name: &'static str) -> Self {
        Self {
            start: coarsetime::Instant::now(),
            histogram: histogram!(name),
            observed: false,
        }
    }

    pub fn new_with_labels<L: IntoLabels>(name: &'static str, labels: L) -> Self {
        Self {
            start: coarsetime::Instant::now(),
            histogram: histogram!(name, labels),
            observed: false,
        }
    }

    pub fn elapsed(&self) -> u64 {
        self.start.elapsed().as_millis()
    }

    pub fn discard(mut self) {
        self.observed = true;
    }
}

#[inline]
pub fn common_labels() -> &'static Vec<(&'static str, String)> {
    static COMMON_LABELS: std::sync::OnceLock<Vec<(&'static str, String)>> =
        std::sync::OnceLock::new();
    COMMON_LABELS.get_or_init(|| {
        let hostname = hostname();
        vec![("node_name", hostname)]
    })
}

#[inline]
pub fn gauge(name: &'static str, value: f64, labels: Option<&Vec<(&'static str, String)>>) {
    let gauge_obj = if let Some(label) = labels {
        metrics::gauge!(name, label)
    } else {
        metrics::gauge!(name)
    };
    gauge_obj.set(value);
}

#[inline]
pub fn gauge_inc(name: &'static str, value: f64, labels: Option<&Vec<(&'static str, String)>>) {
    let gauge = if let Some(label) = labels {
        metrics::gauge!(name, label)
    } else {
        metrics::gauge!(name)
    };
    gauge.increment(value);
}

#[inline]
pub fn gauge_dec(name: &'static str, value: f64, labels: Option<&Vec<(&'static str, String)>>) {
    let gauge = if let Some(label) = labels {
        metrics::gauge!(name, label)
    } else {
        metrics::gauge!(name)
    };
    gauge.decrement(value)
}

#[inline]
pub fn counter_inc(name: &'static str, value: u64, labels: Option<&Vec<(&'static str, String)>>) {
    let counter = if let Some(label) = labels {
        metrics::counter!(name, label)
    } else {
        metrics::counter!(name)
    };
    counter.increment(value);
}

/// A process-wide counter accumulated in per-thread cells and summed on read.
/// The sum may not correspond to a single globally consistent instant.
pub struct ShardedCounter {
    cells: RwLock<Vec<Arc<std::sync::atomic::AtomicU64>>>,
}

impl Default for ShardedCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedCounter {
    pub fn new() -> Self {
        Self {
            cells: RwLock::new(Vec::new()),
        }
    }

    /// Registers a new accumulator cell. Each worker thread holds its own.
    pub fn register_cell(&self) -> Arc<std::sync::atomic::AtomicU64> {
        let cell = Arc::new(std::sync::atomic::AtomicU64::new(0));
        self.cells.write().push(Arc::clone(&cell));
        cell
    }

    pub fn reduce(&self) -> u64 {
        self.cells
            .read()
            .iter()
            .map(|c| c.load(std::sync::atomic::Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::metrics::{common_labels, gauge, ShardedCounter};
    use std::sync::atomic::Ordering;

    #[test]
    pub fn test_gauge_with_labels() {
        for _idx in 0..10 {
            gauge("test_fast_instant", 1.0, None);
            gauge("test_fast_instant", 1.0, Some(common_labels()));
        }
    }

    #[test]
    pub fn test_sharded_counter_reduce() {
        let counter = ShardedCounter::new();
        let a = counter.register_cell();
        let b = counter.register_cell();
        a.fetch_add(3, Ordering::Relaxed);
        b.fetch_add(4, Ordering::Relaxed);
        assert_eq!(counter.reduce(), 7);
    }
}
