//! Rolling metrics and threshold alerts.
//!
//! Alerts are informational only: raising one never changes what any other
//! component does.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::cache::current_timestamp_ms;
use crate::error::{Result, SyncError};

/// Alerts retained for inspection.
const MAX_ALERTS: usize = 100;

// == Sample ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub operation_key: String,
    pub duration_ms: f64,
    pub outcome: Outcome,
    /// Unix milliseconds
    pub timestamp: u64,
}

// == Thresholds ==
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub max_avg_latency_ms: Option<f64>,
    /// Fraction of samples, 0.0..=1.0
    pub max_error_rate: Option<f64>,
    pub min_cache_hit_ratio: Option<f64>,
    pub max_active_operations: Option<usize>,
    /// Samples required before ratios are judged
    pub min_samples: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_avg_latency_ms: Some(1000.0),
            max_error_rate: Some(0.25),
            min_cache_hit_ratio: None,
            max_active_operations: Some(50),
            min_samples: 5,
        }
    }
}

// == Alerts ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    AverageLatency,
    ErrorRate,
    CacheHitRatio,
    ActiveOperations,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub metric: AlertMetric,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

// == Snapshot ==
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub active_operations: usize,
    pub samples: usize,
    pub cache_hit_ratio: f64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub timeouts: usize,
}

#[derive(Default)]
struct MonitorState {
    samples: VecDeque<PerformanceSample>,
    /// (timestamp, hit)
    cache_accesses: VecDeque<(u64, bool)>,
    alerts: VecDeque<Alert>,
    /// Metrics currently past their threshold; alerts fire on the crossing only
    breached: HashSet<AlertMetric>,
}

// == Performance Monitor ==
pub struct PerformanceMonitor {
    window: Duration,
    thresholds: Thresholds,
    active: AtomicUsize,
    state: Mutex<MonitorState>,
}

/// Decrements the active count even if the tracked future is dropped.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Thresholds::default())
    }
}

impl PerformanceMonitor {
    pub fn new(window: Duration, thresholds: Thresholds) -> Self {
        Self {
            window,
            thresholds,
            active: AtomicUsize::new(0),
            state: Mutex::new(MonitorState::default()),
        }
    }

    // == Track ==
    /// Times `operation` and records its outcome under `operation_key`.
    pub async fn track<T, F>(&self, operation_key: &str, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.check_active(active);

        let started = Instant::now();
        let result = operation.await;
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(SyncError::Timeout(_)) => Outcome::Timeout,
            Err(_) => Outcome::Error,
        };
        self.record(PerformanceSample {
            operation_key: operation_key.to_string(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            outcome,
            timestamp: current_timestamp_ms(),
        });
        result
    }

    // == Record ==
    pub fn record(&self, sample: PerformanceSample) {
        let mut state = self.state.lock();
        state.samples.push_back(sample);
        self.prune(&mut state, current_timestamp_ms());
        self.evaluate(&mut state);
    }

    pub fn record_cache_access(&self, hit: bool) {
        let mut state = self.state.lock();
        state.cache_accesses.push_back((current_timestamp_ms(), hit));
        self.prune(&mut state, current_timestamp_ms());
        self.evaluate(&mut state);
    }

    // == Metrics ==
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut state = self.state.lock();
        self.prune(&mut state, current_timestamp_ms());
        self.snapshot(&state)
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.state.lock().alerts.iter().cloned().collect()
    }

    /// Samples for one operation key, oldest first.
    pub fn samples_for(&self, operation_key: &str) -> Vec<PerformanceSample> {
        self.state
            .lock()
            .samples
            .iter()
            .filter(|s| s.operation_key == operation_key)
            .cloned()
            .collect()
    }

    pub fn active_operations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Empties the window, the alert log and the breach state.
    pub fn clear_metrics(&self) {
        *self.state.lock() = MonitorState::default();
    }

    fn snapshot(&self, state: &MonitorState) -> MetricsSnapshot {
        let samples = state.samples.len();
        let (latency_total, errors, timeouts) =
            state
                .samples
                .iter()
                .fold((0.0, 0usize, 0usize), |(total, errors, timeouts), s| {
                    let errors = errors + usize::from(s.outcome != Outcome::Success);
                    let timeouts = timeouts + usize::from(s.outcome == Outcome::Timeout);
                    (total + s.duration_ms, errors, timeouts)
                });
        let hits = state.cache_accesses.iter().filter(|(_, hit)| *hit).count();
        let accesses = state.cache_accesses.len();

        MetricsSnapshot {
            active_operations: self.active.load(Ordering::SeqCst),
            samples,
            cache_hit_ratio: ratio(hits, accesses),
            average_latency_ms: if samples == 0 {
                0.0
            } else {
                latency_total / samples as f64
            },
            error_rate: ratio(errors, samples),
            timeouts,
        }
    }

    fn prune(&self, state: &mut MonitorState, now_ms: u64) {
        let horizon = now_ms.saturating_sub(self.window.as_millis() as u64);
        while state.samples.front().is_some_and(|s| s.timestamp < horizon) {
            state.samples.pop_front();
        }
        while state.cache_accesses.front().is_some_and(|(ts, _)| *ts < horizon) {
            state.cache_accesses.pop_front();
        }
    }

    fn evaluate(&self, state: &mut MonitorState) {
        let snapshot = self.snapshot(state);
        let enough_samples = snapshot.samples >= self.thresholds.min_samples;
        let enough_reads = state.cache_accesses.len() >= self.thresholds.min_samples;

        if let Some(limit) = self.thresholds.max_avg_latency_ms {
            let breached = enough_samples && snapshot.average_latency_ms > limit;
            self.transition(state, AlertMetric::AverageLatency, breached, snapshot.average_latency_ms, limit);
        }
        if let Some(limit) = self.thresholds.max_error_rate {
            let breached = enough_samples && snapshot.error_rate > limit;
            self.transition(state, AlertMetric::ErrorRate, breached, snapshot.error_rate, limit);
        }
        if let Some(limit) = self.thresholds.min_cache_hit_ratio {
            let breached = enough_reads && snapshot.cache_hit_ratio < limit;
            self.transition(state, AlertMetric::CacheHitRatio, breached, snapshot.cache_hit_ratio, limit);
        }
    }

    fn check_active(&self, active: usize) {
        if let Some(limit) = self.thresholds.max_active_operations {
            let mut state = self.state.lock();
            self.transition(
                &mut state,
                AlertMetric::ActiveOperations,
                active > limit,
                active as f64,
                limit as f64,
            );
        }
    }

    fn transition(
        &self,
        state: &mut MonitorState,
        metric: AlertMetric,
        breached: bool,
        value: f64,
        threshold: f64,
    ) {
        if !breached {
            state.breached.remove(&metric);
            return;
        }
        if !state.breached.insert(metric) {
            return;
        }
        warn!(?metric, value, threshold, "performance threshold crossed");
        state.alerts.push_back(Alert {
            metric,
            value,
            threshold,
            raised_at: Utc::now(),
        });
        if state.alerts.len() > MAX_ALERTS {
            state.alerts.pop_front();
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(key: &str, duration_ms: f64, outcome: Outcome) -> PerformanceSample {
        PerformanceSample {
            operation_key: key.to_string(),
            duration_ms,
            outcome,
            timestamp: current_timestamp_ms(),
        }
    }

    fn strict() -> Thresholds {
        Thresholds {
            max_avg_latency_ms: Some(100.0),
            max_error_rate: Some(0.5),
            min_cache_hit_ratio: Some(0.5),
            max_active_operations: Some(1),
            min_samples: 2,
        }
    }

    #[test]
    fn test_metrics_aggregate() {
        let monitor = PerformanceMonitor::default();
        monitor.record(sample("GET /clients", 10.0, Outcome::Success));
        monitor.record(sample("GET /clients", 30.0, Outcome::Error));
        monitor.record(sample("PUT /clients/1", 20.0, Outcome::Timeout));
        monitor.record_cache_access(true);
        monitor.record_cache_access(true);
        monitor.record_cache_access(false);
        monitor.record_cache_access(true);

        let metrics = monitor.metrics();
        assert_eq!(metrics.samples, 3);
        assert_eq!(metrics.average_latency_ms, 20.0);
        assert!((metrics.error_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.cache_hit_ratio, 0.75);
        assert_eq!(monitor.samples_for("GET /clients").len(), 2);
    }

    #[test]
    fn test_latency_alert_fires_once_per_crossing() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(60), strict());
        monitor.record(sample("op", 500.0, Outcome::Success));
        assert!(monitor.alerts().is_empty(), "below min_samples");

        monitor.record(sample("op", 500.0, Outcome::Success));
        monitor.record(sample("op", 500.0, Outcome::Success));
        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, AlertMetric::AverageLatency);
        assert_eq!(alerts[0].threshold, 100.0);
    }

    #[test]
    fn test_error_rate_and_hit_ratio_alerts() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(60), strict());
        monitor.record(sample("op", 1.0, Outcome::Error));
        monitor.record(sample("op", 1.0, Outcome::Error));
        monitor.record_cache_access(false);
        monitor.record_cache_access(false);

        let metrics: Vec<AlertMetric> = monitor.alerts().iter().map(|a| a.metric).collect();
        assert!(metrics.contains(&AlertMetric::ErrorRate));
        assert!(metrics.contains(&AlertMetric::CacheHitRatio));
    }

    #[test]
    fn test_clear_metrics() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(60), strict());
        for _ in 0..3 {
            monitor.record(sample("op", 900.0, Outcome::Success));
        }
        assert!(!monitor.alerts().is_empty());

        monitor.clear_metrics();
        assert_eq!(monitor.metrics(), MetricsSnapshot::default());
        assert!(monitor.alerts().is_empty());
    }

    #[test]
    fn test_window_prunes_old_samples() {
        let monitor = PerformanceMonitor::new(Duration::from_millis(1000), Thresholds::default());
        let mut old = sample("op", 5.0, Outcome::Success);
        old.timestamp = current_timestamp_ms() - 5000;
        monitor.record(old);
        monitor.record(sample("op", 7.0, Outcome::Success));

        let metrics = monitor.metrics();
        assert_eq!(metrics.samples, 1);
        assert_eq!(metrics.average_latency_ms, 7.0);
    }

    #[tokio::test]
    async fn test_track_records_outcome() {
        let monitor = PerformanceMonitor::default();
        let ok: Result<u8> = monitor.track("fetch", async { Ok(1) }).await;
        let timed_out: Result<u8> = monitor
            .track("fetch", async { Err(SyncError::Timeout(10)) })
            .await;

        assert_eq!(ok, Ok(1));
        assert!(timed_out.is_err());
        let samples = monitor.samples_for("fetch");
        assert_eq!(samples[0].outcome, Outcome::Success);
        assert_eq!(samples[1].outcome, Outcome::Timeout);
        assert_eq!(monitor.active_operations(), 0);
    }

    #[tokio::test]
    async fn test_active_operations_alert() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(60), strict());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let inner = async {
            monitor
                .track("slow", async {
                    let _ = rx.await;
                    Ok::<_, SyncError>(())
                })
                .await
        };
        let outer = async {
            tokio::task::yield_now().await;
            let active_during = monitor.active_operations();
            monitor.track("fast", async { Ok::<_, SyncError>(()) }).await.unwrap();
            let _ = tx.send(());
            active_during
        };
        let (slow, active_during) = tokio::join!(inner, outer);
        slow.unwrap();

        assert_eq!(active_during, 1);
        assert!(monitor
            .alerts()
            .iter()
            .any(|a| a.metric == AlertMetric::ActiveOperations));
    }
}
