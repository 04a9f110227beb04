//! Performance Monitoring
//!
//! Rolling-window metrics over cache and network operations.

mod performance;

pub use performance::{
    Alert, AlertMetric, MetricsSnapshot, Outcome, PerformanceMonitor, PerformanceSample,
    Thresholds,
};
