//! Process-wide metrics for the replication core, registered once via
//! `once_cell::sync::Lazy` in the teacher's convention of one static per
//! instrument, named `<subsystem>_<noun>_<unit>` (§4.11).

use metrics::{
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use once_cell::sync::Lazy;

/// Mirrors `getTotalBufferUsed`.
pub static TOTAL_BUFFER_USED_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "replication_total_buffer_used_bytes",
        "In-flight batched WAL entry bytes across all sources"
    )
    .expect("failed to register replication_total_buffer_used_bytes gauge")
});

/// Count of live sources, labelled by whether they're recovered.
pub static SOURCES_TOTAL: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "replication_sources_total",
        "Number of live replication sources",
        &["recovered"]
    )
    .expect("failed to register replication_sources_total gauge")
});

/// Size of each source's WAL Index entry.
pub static WALS_QUEUED_TOTAL: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "replication_wals_queued_total",
        "WAL names a source still has to ship",
        &["queue_id"]
    )
    .expect("failed to register replication_wals_queued_total gauge")
});

pub static CLAIMS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "replication_claims_total",
        "Failover queue claims attempted"
    )
    .expect("failed to register replication_claims_total counter")
});

pub static CLAIMS_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "replication_claims_failed_total",
        "Failover queue claims that did not result in an installed recovered source"
    )
    .expect("failed to register replication_claims_failed_total counter")
});

pub static REMOTE_WAL_DELETE_RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "replication_remote_wal_delete_retries_total",
        "Retries while deleting a sync-replication peer's remote WAL copies",
        &["peer_id"]
    )
    .expect("failed to register replication_remote_wal_delete_retries_total counter")
});

pub fn set_sources_total(recovered: bool, count: i64) {
    SOURCES_TOTAL
        .with_label_values(&[if recovered { "true" } else { "false" }])
        .set(count);
}

pub fn set_wals_queued(queue_id: &str, count: i64) {
    WALS_QUEUED_TOTAL.with_label_values(&[queue_id]).set(count);
}
