//! Strategy module
//!
//! Performance-decay monitoring for live strategies.

pub mod degradation;

pub use degradation::{
    DegradationAction, DegradationConfig, DegradationEvent, DegradationEventType, Metric,
    StrategyDegradationMonitor, WindowMetrics,
};
