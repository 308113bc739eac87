// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for the Conductor's read-only diagnostic surface (§10).
//!
//! Trimmed to the three things an operator actually watches: how many
//! events the event loop has processed (and how), how much of the GPU pool
//! is occupied, and how cases end up.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Inbound events handled by command and outcome.
    ///
    /// Labels:
    /// - command: the envelope's `command` field
    /// - outcome: "ack" | "nack_requeue" | "dead_letter"
    pub static ref EVENTS_HANDLED_TOTAL: CounterVec = register_counter_vec!(
        "conductor_events_handled_total",
        "Total inbound events handled, by command and outcome",
        &["command", "outcome"]
    )
    .expect("failed to register conductor_events_handled_total");

    /// Handler latency in seconds, from envelope receipt to ack/nack.
    pub static ref EVENT_HANDLE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "conductor_event_handle_duration_seconds",
        "Inbound event handler duration in seconds",
        &["command"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("failed to register conductor_event_handle_duration_seconds");

    /// Number of GPU slots currently in the `Reserved` state.
    pub static ref GPU_SLOTS_RESERVED: Gauge = register_gauge!(
        "conductor_gpu_slots_reserved",
        "Number of GPU slots currently reserved"
    )
    .expect("failed to register conductor_gpu_slots_reserved");

    /// Number of cases currently parked waiting for a GPU.
    pub static ref CASES_PARKED: Gauge = register_gauge!(
        "conductor_cases_parked",
        "Number of cases currently parked waiting for a GPU"
    )
    .expect("failed to register conductor_cases_parked");

    /// Cases reaching a terminal status, by status and (for failures) error kind.
    ///
    /// Labels:
    /// - status: "completed" | "failed"
    /// - error_kind: error kind for failures, "" for completions
    pub static ref CASES_TERMINAL_TOTAL: CounterVec = register_counter_vec!(
        "conductor_cases_terminal_total",
        "Total cases reaching a terminal status",
        &["status", "error_kind"]
    )
    .expect("failed to register conductor_cases_terminal_total");
}

/// Records that an inbound event was handled with the given ack decision.
#[inline]
pub fn record_event_handled(command: &str, outcome: &str, duration_seconds: f64) {
    EVENTS_HANDLED_TOTAL.with_label_values(&[command, outcome]).inc();
    EVENT_HANDLE_DURATION_SECONDS
        .with_label_values(&[command])
        .observe(duration_seconds);
}

/// Updates the GPU occupancy gauge to the current count of reserved slots.
#[inline]
pub fn set_gpu_slots_reserved(count: i64) {
    GPU_SLOTS_RESERVED.set(count as f64);
}

/// Updates the parked-case gauge to the current count of parked cases.
#[inline]
pub fn set_cases_parked(count: i64) {
    CASES_PARKED.set(count as f64);
}

/// Records a case reaching `Completed`.
#[inline]
pub fn record_case_completed() {
    CASES_TERMINAL_TOTAL.with_label_values(&["completed", ""]).inc();
}

/// Records a case reaching `Failed` with the given error kind.
#[inline]
pub fn record_case_failed(error_kind: &str) {
    CASES_TERMINAL_TOTAL
        .with_label_values(&["failed", error_kind])
        .inc();
}

/// Gathers and encodes all metrics in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("failed to encode metrics");

    String::from_utf8(buffer).expect("metrics encoding produced invalid utf-8")
}
