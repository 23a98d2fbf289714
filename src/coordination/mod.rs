//! Coordination Layer for Order Admission and System Risk
//!
//! This module provides the escalation axes consulted before any order leaves:
//! - Per-strategy order admission guard with five anomaly rules
//! - Black-swan circuit breaker driving the system-wide risk mode
//! - Safety gate combining every axis into one posture

pub mod black_swan;
pub mod gate;
pub mod order_guard;

pub use black_swan::{
    BlackSwanConfig, BlackSwanEvent, CatastrophicRiskManager, DisconnectionTrigger,
    DrawdownTrigger, DriftTrigger, ReconciliationTrigger, RiskStats, TriggerType,
};
pub use gate::{Assessment, Posture, SafetyGate};
pub use order_guard::{
    CancelFrequencyRule, ConsecutiveFailureRule, Decision, DecisionAction, DuplicateOrderRule,
    GuardEvent, GuardEventKind, GuardRuleKind, NotionalRule, OrderAdmissionGuard,
    OrderGuardConfig, PriceDeviationRule, RuleViolation,
};
