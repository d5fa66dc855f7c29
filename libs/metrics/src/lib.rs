//! Thin wrapper around `prometheus`, giving every crate in the workspace
//! one place that owns metric registration conventions (bucket choices,
//! counter-pair helpers) instead of each call site reinventing them.

pub use prometheus::{
    core, proto, register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Counter, CounterVec, Gauge, GaugeVec, Histogram,
    HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use core::{Collector, Desc};
use prometheus::proto::MetricFamily;

/// Bucket boundaries (seconds) reused by every "how long did a blocking
/// disk/filesystem operation take" histogram in the workspace.
pub const DISK_WRITE_SECONDS_BUCKETS: &[f64] = &[
    0.000_01, 0.000_1, 0.001, 0.01, 0.1, 1.0, 10.0,
];

/// A pair of counters sharing a label set: one incremented when an
/// operation starts, one when it finishes. Exposing both (rather than a
/// single gauge) survives process restarts without losing the "how many
/// are in flight" signal, and is cheap to reconstruct from `started -
/// finished` in a dashboard.
pub struct IntCounterPairVec {
    started: IntCounterVec,
    finished: IntCounterVec,
}

impl IntCounterPairVec {
    pub fn new(started: IntCounterVec, finished: IntCounterVec) -> Self {
        IntCounterPairVec { started, finished }
    }

    pub fn started(&self) -> &IntCounterVec {
        &self.started
    }

    pub fn finished(&self) -> &IntCounterVec {
        &self.finished
    }

    pub fn guard(&self, label_values: &[&str]) -> IntCounterPairGuard {
        self.started.with_label_values(label_values).inc();
        IntCounterPairGuard {
            finished: self.finished.with_label_values(label_values),
        }
    }
}

impl Collector for IntCounterPairVec {
    fn desc(&self) -> Vec<&Desc> {
        let mut d = self.started.desc();
        d.extend(self.finished.desc());
        d
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut m = self.started.collect();
        m.extend(self.finished.collect());
        m
    }
}

/// Increments the paired "finished" counter when dropped, so a task that
/// panics or returns early still accounts for its completion.
pub struct IntCounterPairGuard {
    finished: IntCounter,
}

impl Drop for IntCounterPairGuard {
    fn drop(&mut self) {
        self.finished.inc();
    }
}

#[macro_export]
macro_rules! register_int_counter_pair_vec {
    ($name_started:expr, $help_started:expr, $name_finished:expr, $help_finished:expr, $labels:expr) => {{
        let started = $crate::register_int_counter_vec!($name_started, $help_started, $labels);
        let finished = $crate::register_int_counter_vec!($name_finished, $help_finished, $labels);
        match (started, finished) {
            (Ok(started), Ok(finished)) => Ok($crate::IntCounterPairVec::new(started, finished)),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_pair_tracks_in_flight() {
        let pair = register_int_counter_pair_vec!(
            "test_pair_started_total",
            "started",
            "test_pair_finished_total",
            "finished",
            &["op"]
        )
        .unwrap();
        {
            let _guard = pair.guard(&["claim"]);
            assert_eq!(pair.started().with_label_values(&["claim"]).get(), 1);
            assert_eq!(pair.finished().with_label_values(&["claim"]).get(), 0);
        }
        assert_eq!(pair.finished().with_label_values(&["claim"]).get(), 1);
    }
}
