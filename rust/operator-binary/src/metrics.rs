//! Prometheus gauges and counters. The default registry is the only
//! process-wide sink; the reconciler only ever writes to it.

use std::sync::LazyLock;

use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};
use strum::IntoEnumIterator;

use crate::crd::{SkyhookState, Stage};

pub static NODE_TARGET_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "skyhook_node_target_count",
        "Number of nodes matched by a Skyhook's selector",
        &["skyhook"]
    )
    .expect("metric can be registered")
});

pub static NODE_COMPLETE_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "skyhook_node_complete_count",
        "Number of matched nodes complete for a Skyhook",
        &["skyhook"]
    )
    .expect("metric can be registered")
});

pub static NODE_IN_PROGRESS_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "skyhook_node_in_progress_count",
        "Number of matched nodes currently in progress for a Skyhook",
        &["skyhook"]
    )
    .expect("metric can be registered")
});

pub static NODE_ERROR_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "skyhook_node_error_count",
        "Number of matched nodes erroring for a Skyhook",
        &["skyhook"]
    )
    .expect("metric can be registered")
});

pub static SKYHOOK_STATUS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "skyhook_status",
        "One-hot aggregated status per Skyhook",
        &["skyhook", "status"]
    )
    .expect("metric can be registered")
});

pub static PACKAGE_STAGE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "skyhook_package_stage_total",
        "Package pods created, by stage",
        &["skyhook", "package", "stage"]
    )
    .expect("metric can be registered")
});

/// Sets the one-hot status gauge for a Skyhook.
pub fn report_status(skyhook: &str, status: SkyhookState) {
    for state in SkyhookState::iter() {
        SKYHOOK_STATUS
            .with_label_values(&[skyhook, &state.to_string()])
            .set(i64::from(state == status));
    }
}

pub fn report_node_counts(skyhook: &str, target: i64, complete: i64, in_progress: i64, errors: i64) {
    NODE_TARGET_COUNT.with_label_values(&[skyhook]).set(target);
    NODE_COMPLETE_COUNT
        .with_label_values(&[skyhook])
        .set(complete);
    NODE_IN_PROGRESS_COUNT
        .with_label_values(&[skyhook])
        .set(in_progress);
    NODE_ERROR_COUNT.with_label_values(&[skyhook]).set(errors);
}

pub fn count_stage(skyhook: &str, package: &str, stage: Stage) {
    PACKAGE_STAGE_TOTAL
        .with_label_values(&[skyhook, package, &stage.to_string()])
        .inc();
}

/// Drops every gauge series belonging to a deleted Skyhook. Counter series
/// are left behind; they simply stop moving.
pub fn zero_for(skyhook: &str) {
    for gauge in [
        &NODE_TARGET_COUNT,
        &NODE_COMPLETE_COUNT,
        &NODE_IN_PROGRESS_COUNT,
        &NODE_ERROR_COUNT,
    ] {
        let _ = gauge.remove_label_values(&[skyhook]);
    }
    for state in SkyhookState::iter() {
        let _ = SKYHOOK_STATUS.remove_label_values(&[skyhook, &state.to_string()]);
    }
}
