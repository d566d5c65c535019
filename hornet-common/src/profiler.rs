//! Elapsed-time accumulators for per-partition accounting.

use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::warn;

use crate::error::{HornetError, HornetResult};

/// Returns nanoseconds elapsed since the first call in this process.
///
/// All measurements inside one process share this epoch, so timestamps taken
/// by different threads can be used to start one measurement and stop
/// another on the same instant.
#[must_use]
pub fn now_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default)]
struct Marker {
    started_at: Option<u64>,
    pending_reset: bool,
}

/// Thread-safe elapsed-time accumulator with start/stop markers.
///
/// `total_nanos` and `invocations` are plain atomics so concurrent producers
/// can merge samples through [`ProfileMeasurement::append`] without touching
/// the marker lock.
#[derive(Debug)]
pub struct ProfileMeasurement {
    label: &'static str,
    total_nanos: AtomicU64,
    invocations: AtomicU64,
    marker: Mutex<Marker>,
}

impl ProfileMeasurement {
    /// Creates a stopped measurement with zero accumulated time.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            total_nanos: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            marker: Mutex::new(Marker::default()),
        }
    }

    /// Returns the measurement label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Begins a sample at the supplied timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error when a sample is already in flight.
    pub fn start(&self, timestamp: u64) -> HornetResult<()> {
        let mut marker = self.lock_marker();
        if marker.started_at.is_some() {
            return Err(HornetError::InvalidState(
                "profile measurement is already started",
            ));
        }
        marker.started_at = Some(timestamp);
        Ok(())
    }

    /// Begins a sample at the current process time.
    ///
    /// # Errors
    ///
    /// Returns an error when a sample is already in flight.
    pub fn start_now(&self) -> HornetResult<()> {
        self.start(now_nanos())
    }

    /// Begins a sample unless one is already in flight.
    pub fn start_if_stopped(&self, timestamp: u64) {
        let mut marker = self.lock_marker();
        if marker.started_at.is_none() {
            marker.started_at = Some(timestamp);
        }
    }

    /// Ends the in-flight sample at the supplied timestamp.
    ///
    /// A stop timestamp earlier than the start marker is a clock regression:
    /// the sample is dropped and the invocation count stays unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error when no sample is in flight.
    pub fn stop(&self, timestamp: u64) -> HornetResult<()> {
        let mut marker = self.lock_marker();
        if marker.pending_reset {
            // A reset arrived mid-sample; the in-flight sample is dropped.
            marker.pending_reset = false;
            marker.started_at = None;
            return Ok(());
        }
        let Some(started_at) = marker.started_at.take() else {
            return Err(HornetError::InvalidState(
                "profile measurement is not started",
            ));
        };
        if timestamp < started_at {
            warn!(
                label = self.label,
                started_at, timestamp, "dropping profile sample after clock regression"
            );
            return Ok(());
        }
        self.total_nanos
            .fetch_add(timestamp - started_at, Ordering::Relaxed);
        self.invocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Ends the in-flight sample at the current process time.
    ///
    /// # Errors
    ///
    /// Returns an error when no sample is in flight.
    pub fn stop_now(&self) -> HornetResult<()> {
        self.stop(now_nanos())
    }

    /// Ends the in-flight sample if there is one.
    pub fn stop_if_started(&self, timestamp: u64) {
        if self.is_started() {
            let _ = self.stop(timestamp);
        }
    }

    /// Returns whether a sample is currently in flight.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.lock_marker().started_at.is_some()
    }

    /// Merges an externally measured sample without touching the marker.
    ///
    /// Safe to call from concurrent producers.
    pub fn append(&self, start: u64, stop: u64, invocations: u64) {
        self.total_nanos
            .fetch_add(stop.saturating_sub(start), Ordering::Relaxed);
        self.invocations.fetch_add(invocations, Ordering::Relaxed);
    }

    /// Clears accumulated time and invocations.
    ///
    /// When a sample is in flight the reset is deferred: the sample is
    /// dropped at the next `stop` instead of being recorded.
    pub fn reset(&self) {
        let mut marker = self.lock_marker();
        if marker.started_at.is_some() {
            marker.pending_reset = true;
        }
        self.total_nanos.store(0, Ordering::Relaxed);
        self.invocations.store(0, Ordering::Relaxed);
    }

    /// Total accumulated nanoseconds.
    #[must_use]
    pub fn total_nanos(&self) -> u64 {
        self.total_nanos.load(Ordering::Relaxed)
    }

    /// Total accumulated milliseconds.
    #[must_use]
    pub fn total_millis(&self) -> f64 {
        self.total_nanos() as f64 / 1_000_000.0
    }

    /// Number of completed start/stop pairs (plus appended invocations).
    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Average nanoseconds per invocation, zero when never invoked.
    #[must_use]
    pub fn average_nanos(&self) -> f64 {
        let invocations = self.invocations();
        if invocations == 0 {
            return 0.0;
        }
        self.total_nanos() as f64 / invocations as f64
    }

    fn lock_marker(&self) -> std::sync::MutexGuard<'_, Marker> {
        self.marker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Stops `to_stop` and starts `to_start` on the same timestamp.
pub fn swap(timestamp: u64, to_stop: &ProfileMeasurement, to_start: &ProfileMeasurement) {
    to_stop.stop_if_started(timestamp);
    to_start.start_if_stopped(timestamp);
}

#[cfg(test)]
mod tests {
    use super::{ProfileMeasurement, swap};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn invocations_count_completed_pairs() {
        let pm = ProfileMeasurement::new("exec");
        pm.start(100).expect("fresh measurement must start");
        pm.stop(150).expect("started measurement must stop");
        pm.start(200).expect("stopped measurement must restart");
        pm.stop(230).expect("started measurement must stop");

        assert_that!(pm.invocations(), eq(2));
        assert_that!(pm.total_nanos(), eq(80));
    }

    #[rstest]
    fn double_start_is_an_error() {
        let pm = ProfileMeasurement::new("exec");
        pm.start(1).expect("fresh measurement must start");
        assert_that!(pm.start(2).is_err(), eq(true));
    }

    #[rstest]
    fn stop_without_start_is_an_error() {
        let pm = ProfileMeasurement::new("exec");
        assert_that!(pm.stop(1).is_err(), eq(true));
    }

    #[rstest]
    fn clock_regression_drops_sample_and_keeps_invocations() {
        let pm = ProfileMeasurement::new("exec");
        pm.start(500).expect("fresh measurement must start");
        pm.stop(400).expect("regressed stop must not error");

        assert_that!(pm.invocations(), eq(0));
        assert_that!(pm.total_nanos(), eq(0));
        assert_that!(pm.is_started(), eq(false));
    }

    #[rstest]
    fn reset_mid_sample_drops_the_inflight_sample() {
        let pm = ProfileMeasurement::new("exec");
        pm.start(10).expect("fresh measurement must start");
        pm.reset();
        pm.stop(90).expect("deferred reset consumes the stop");

        assert_that!(pm.invocations(), eq(0));
        assert_that!(pm.total_nanos(), eq(0));

        pm.start(100).expect("measurement must restart after reset");
        pm.stop(130).expect("started measurement must stop");
        assert_that!(pm.invocations(), eq(1));
        assert_that!(pm.total_nanos(), eq(30));
    }

    #[rstest]
    fn append_merges_without_marker() {
        let pm = ProfileMeasurement::new("network");
        pm.start(1000).expect("fresh measurement must start");
        pm.append(0, 250, 5);

        assert_that!(pm.total_nanos(), eq(250));
        assert_that!(pm.invocations(), eq(5));
        assert_that!(pm.is_started(), eq(true));
    }

    #[rstest]
    fn swap_moves_the_marker_between_measurements() {
        let idle = ProfileMeasurement::new("idle");
        let exec = ProfileMeasurement::new("exec");
        idle.start(0).expect("fresh measurement must start");

        swap(40, &idle, &exec);
        assert_that!(idle.total_nanos(), eq(40));
        assert_that!(exec.is_started(), eq(true));
    }
}
