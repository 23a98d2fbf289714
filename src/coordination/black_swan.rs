//! Catastrophic Risk Manager
//!
//! System-wide circuit breaker over four trigger classes (drawdown, drift,
//! reconciliation, disconnection) plus operator-issued triggers. At most one
//! [`BlackSwanEvent`] is active at a time and the system mode is derived from
//! it. Recovery is always explicit; nothing re-arms automatically.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{DriftStatus, RiskAction, SystemRiskMode};
use crate::error::{GuardrailError, Result};
use crate::persistence::{timestamp, EvidenceStore, LedgerRecord};

/// Drawdown trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownTrigger {
    /// Fires when the current drawdown reaches this ratio (e.g. 0.2)
    pub threshold: Decimal,
    pub action: RiskAction,
}

/// Strategy drift trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftTrigger {
    pub action: RiskAction,
}

/// Position/asset reconciliation trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationTrigger {
    pub max_consecutive_failures: u32,
    /// A successful reconciliation with a larger asset diff still counts as failed
    #[serde(default)]
    pub max_asset_diff_ratio: Option<Decimal>,
    pub action: RiskAction,
}

/// Broker disconnection frequency trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectionTrigger {
    pub max_disconnections: usize,
    pub time_window_secs: i64,
    pub action: RiskAction,
}

/// Black-swan thresholds. No defaults: every value must be configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackSwanConfig {
    pub drawdown: DrawdownTrigger,
    pub drift: DriftTrigger,
    pub reconciliation: ReconciliationTrigger,
    pub disconnection: DisconnectionTrigger,
}

impl BlackSwanConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.drawdown.threshold <= Decimal::ZERO || self.drawdown.threshold > Decimal::ONE {
            errors.push("black_swan.drawdown.threshold must be in (0, 1]".to_string());
        }
        if self.reconciliation.max_consecutive_failures == 0 {
            errors.push(
                "black_swan.reconciliation.max_consecutive_failures must be positive".to_string(),
            );
        }
        if let Some(ratio) = self.reconciliation.max_asset_diff_ratio {
            if ratio < Decimal::ZERO {
                errors.push(
                    "black_swan.reconciliation.max_asset_diff_ratio must not be negative"
                        .to_string(),
                );
            }
        }
        if self.disconnection.max_disconnections == 0 {
            errors.push("black_swan.disconnection.max_disconnections must be positive".to_string());
        }
        if self.disconnection.time_window_secs <= 0 {
            errors.push("black_swan.disconnection.time_window_secs must be positive".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Drawdown,
    Drift,
    Reconciliation,
    Disconnection,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Drawdown => "drawdown",
            TriggerType::Drift => "drift",
            TriggerType::Reconciliation => "reconciliation",
            TriggerType::Disconnection => "disconnection",
            TriggerType::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted record of a catastrophic-risk trigger and its recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackSwanEvent {
    pub event_id: String,
    pub trigger_type: TriggerType,
    pub resulting_mode: RiskAction,
    /// Observed metric; `None` for drift and manual triggers
    pub trigger_value: Option<Decimal>,
    pub threshold: Option<Decimal>,
    pub details: String,
    #[serde(with = "timestamp")]
    pub triggered_at: DateTime<Utc>,
    #[serde(with = "timestamp::option")]
    pub recovered_at: Option<DateTime<Utc>>,
    pub recovery_reason: Option<String>,
    pub event_hash: String,
}

impl BlackSwanEvent {
    pub fn is_active(&self) -> bool {
        self.recovered_at.is_none()
    }
}

impl LedgerRecord for BlackSwanEvent {
    const FAMILY: &'static str = "black_swan_event";

    fn record_id(&self) -> &str {
        &self.event_id
    }

    fn event_hash(&self) -> &str {
        &self.event_hash
    }

    fn set_event_hash(&mut self, hash: String) {
        self.event_hash = hash;
    }

    fn is_open(&self) -> bool {
        self.is_active()
    }
}

/// Counters exposed for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskStats {
    pub mode: SystemRiskMode,
    pub active_event_id: Option<String>,
    pub reconciliation_failures: u32,
    pub recent_disconnections: usize,
    pub total_triggers: u64,
    pub ledger_fault: bool,
}

/// A trigger that fired, before it becomes an event
struct Violation {
    trigger_type: TriggerType,
    action: RiskAction,
    value: Option<Decimal>,
    threshold: Option<Decimal>,
    details: String,
}

#[derive(Default)]
struct RiskState {
    active: Option<BlackSwanEvent>,
    reconciliation_failures: u32,
    disconnections: VecDeque<DateTime<Utc>>,
}

impl RiskState {
    fn mode(&self) -> SystemRiskMode {
        self.active
            .as_ref()
            .map(|e| SystemRiskMode::from(e.resulting_mode))
            .unwrap_or(SystemRiskMode::Normal)
    }
}

/// Global black-swan circuit breaker
pub struct CatastrophicRiskManager {
    config: BlackSwanConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn EvidenceStore<BlackSwanEvent>>,
    state: Mutex<RiskState>,
    /// Set while an escalation could not be persisted
    ledger_fault: AtomicBool,
    total_triggers: AtomicU64,
}

impl CatastrophicRiskManager {
    /// Create a manager, resuming the mode of the latest unclosed event.
    pub fn open(
        config: BlackSwanConfig,
        ledger: Arc<dyn EvidenceStore<BlackSwanEvent>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let events = ledger.load_all()?;
        let open: Vec<&BlackSwanEvent> = events.iter().filter(|e| e.is_active()).collect();
        // max_by_key keeps the last of equal keys, i.e. the latest event
        let active = open.iter().copied().max_by_key(|e| e.resulting_mode).cloned();

        if let Some(event) = &active {
            if open.len() > 1 {
                warn!(
                    "{} unclosed black-swan events in ledger, keeping {} and closing the rest",
                    open.len(),
                    event.event_id
                );
                let now = clock.stamp();
                let mut superseded = Vec::with_capacity(open.len() - 1);
                for stale in open.iter().filter(|e| e.event_id != event.event_id) {
                    let mut closed = (*stale).clone();
                    closed.recovered_at = Some(now);
                    closed.recovery_reason = Some(format!("superseded by {}", event.event_id));
                    closed.seal()?;
                    superseded.push(closed);
                }
                ledger.append_batch(&superseded)?;
            }
            warn!(
                event_id = %event.event_id,
                trigger = %event.trigger_type,
                "Resuming {} from unrecovered black-swan event: {}",
                event.resulting_mode, event.details
            );
        }

        Ok(Self {
            config,
            clock,
            ledger,
            state: Mutex::new(RiskState {
                active,
                ..Default::default()
            }),
            ledger_fault: AtomicBool::new(false),
            total_triggers: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &BlackSwanConfig {
        &self.config
    }

    /// Current system mode. While an escalation failed to persist the answer
    /// is at least REDUCE_ONLY.
    pub async fn get_current_status(&self) -> SystemRiskMode {
        let mode = self.state.lock().await.mode();
        if self.has_ledger_fault() {
            mode.max(SystemRiskMode::ReduceOnly)
        } else {
            mode
        }
    }

    pub fn has_ledger_fault(&self) -> bool {
        self.ledger_fault.load(Ordering::SeqCst)
    }

    pub async fn active_event(&self) -> Option<BlackSwanEvent> {
        self.state.lock().await.active.clone()
    }

    /// Every recorded event, latest version of each.
    pub fn history(&self) -> Result<Vec<BlackSwanEvent>> {
        Ok(self.ledger.load_all()?)
    }

    pub async fn stats(&self) -> RiskStats {
        let now = self.clock.now();
        let window = Duration::seconds(self.config.disconnection.time_window_secs);
        let state = self.state.lock().await;
        RiskStats {
            mode: state.mode(),
            active_event_id: state.active.as_ref().map(|e| e.event_id.clone()),
            reconciliation_failures: state.reconciliation_failures,
            recent_disconnections: state
                .disconnections
                .iter()
                .filter(|t| now.signed_duration_since(**t) < window)
                .count(),
            total_triggers: self.total_triggers.load(Ordering::Relaxed),
            ledger_fault: self.has_ledger_fault(),
        }
    }

    /// Evaluate the account drawdown (0.15 = 15%).
    pub async fn check_drawdown(&self, current_drawdown: Decimal) -> Result<SystemRiskMode> {
        let mut state = self.state.lock().await;
        let cfg = &self.config.drawdown;
        if current_drawdown < cfg.threshold {
            return Ok(state.mode());
        }
        let violation = Violation {
            trigger_type: TriggerType::Drawdown,
            action: cfg.action,
            value: Some(current_drawdown),
            threshold: Some(cfg.threshold),
            details: format!(
                "drawdown {} reached threshold {}",
                current_drawdown, cfg.threshold
            ),
        };
        self.escalate(&mut state, violation)
    }

    /// Evaluate the drift monitor's status.
    pub async fn check_drift(&self, drift_status: DriftStatus) -> Result<SystemRiskMode> {
        let mut state = self.state.lock().await;
        if !drift_status.is_unhealthy() {
            return Ok(state.mode());
        }
        let violation = Violation {
            trigger_type: TriggerType::Drift,
            action: self.config.drift.action,
            value: None,
            threshold: None,
            details: format!("strategy drift status {}", drift_status),
        };
        self.escalate(&mut state, violation)
    }

    /// Evaluate one reconciliation round.
    pub async fn check_reconciliation(
        &self,
        asset_diff_ratio: Decimal,
        success: bool,
    ) -> Result<SystemRiskMode> {
        let mut state = self.state.lock().await;
        let cfg = &self.config.reconciliation;

        let diff_exceeded = cfg
            .max_asset_diff_ratio
            .is_some_and(|max| asset_diff_ratio > max);
        if success && !diff_exceeded {
            if state.reconciliation_failures > 0 {
                debug!(
                    "Reconciliation succeeded, resetting {} failures",
                    state.reconciliation_failures
                );
            }
            state.reconciliation_failures = 0;
            return Ok(state.mode());
        }

        state.reconciliation_failures = state.reconciliation_failures.saturating_add(1);
        debug!(
            failures = state.reconciliation_failures,
            diff = %asset_diff_ratio,
            "Reconciliation failed"
        );
        if state.reconciliation_failures < cfg.max_consecutive_failures {
            return Ok(state.mode());
        }

        let violation = Violation {
            trigger_type: TriggerType::Reconciliation,
            action: cfg.action,
            value: Some(Decimal::from(state.reconciliation_failures)),
            threshold: Some(Decimal::from(cfg.max_consecutive_failures)),
            details: format!(
                "{} consecutive reconciliation failures (last asset diff ratio {})",
                state.reconciliation_failures, asset_diff_ratio
            ),
        };
        self.escalate(&mut state, violation)
    }

    /// Record a broker disconnection.
    pub async fn check_disconnection(&self) -> Result<SystemRiskMode> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let cfg = &self.config.disconnection;
        let window = Duration::seconds(cfg.time_window_secs);

        state.disconnections.push_back(now);
        while state
            .disconnections
            .front()
            .is_some_and(|t| now.signed_duration_since(*t) >= window)
        {
            state.disconnections.pop_front();
        }

        let count = state.disconnections.len();
        if count < cfg.max_disconnections {
            return Ok(state.mode());
        }

        let violation = Violation {
            trigger_type: TriggerType::Disconnection,
            action: cfg.action,
            value: Some(Decimal::from(count as u64)),
            threshold: Some(Decimal::from(cfg.max_disconnections as u64)),
            details: format!(
                "{} disconnections within {}s",
                count, cfg.time_window_secs
            ),
        };
        self.escalate(&mut state, violation)
    }

    /// Operator-issued trigger.
    pub async fn manual_trigger(&self, mode: RiskAction, reason: &str) -> Result<SystemRiskMode> {
        if reason.trim().is_empty() {
            return Err(GuardrailError::Validation(
                "manual trigger requires a reason".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        let violation = Violation {
            trigger_type: TriggerType::Manual,
            action: mode,
            value: None,
            threshold: None,
            details: format!("manual: {}", reason.trim()),
        };
        self.escalate(&mut state, violation)
    }

    fn escalate(&self, state: &mut RiskState, violation: Violation) -> Result<SystemRiskMode> {
        self.total_triggers.fetch_add(1, Ordering::Relaxed);

        if let Some(active) = &state.active {
            if violation.action <= active.resulting_mode {
                info!(
                    active = %active.event_id,
                    trigger = %violation.trigger_type,
                    "Black-swan trigger ignored, {} already active: {}",
                    active.resulting_mode, violation.details
                );
                return Ok(state.mode());
            }
        }

        let now = self.clock.stamp();
        let mut event = BlackSwanEvent {
            event_id: format!("bs-{}", Uuid::new_v4()),
            trigger_type: violation.trigger_type,
            resulting_mode: violation.action,
            trigger_value: violation.value,
            threshold: violation.threshold,
            details: violation.details,
            triggered_at: now,
            recovered_at: None,
            recovery_reason: None,
            event_hash: String::new(),
        };
        event.seal()?;

        let mut batch = Vec::with_capacity(2);
        if let Some(active) = &state.active {
            let mut superseded = active.clone();
            superseded.recovered_at = Some(now);
            superseded.recovery_reason = Some(format!("superseded by {}", event.event_id));
            superseded.seal()?;
            batch.push(superseded);
        }
        batch.push(event.clone());

        if let Err(e) = self.ledger.append_batch(&batch) {
            self.ledger_fault.store(true, Ordering::SeqCst);
            error!(
                trigger = %event.trigger_type,
                "Failed to persist black-swan event, failing closed: {}", e
            );
            return Err(e.into());
        }
        self.ledger_fault.store(false, Ordering::SeqCst);

        if let Some(previous) = &state.active {
            warn!(
                "Black-swan event {} superseded by {}",
                previous.event_id, event.event_id
            );
        }
        error!(
            event_id = %event.event_id,
            trigger = %event.trigger_type,
            "BLACK SWAN: entering {}: {}", event.resulting_mode, event.details
        );
        state.active = Some(event);
        Ok(state.mode())
    }

    /// Close the active event and return to NORMAL.
    ///
    /// Returns the closed event, or `None` when nothing was active. With no
    /// active event but a failed escalation pending, an already recovered
    /// manual record is written and returned instead.
    pub async fn recover(&self, reason: &str) -> Result<Option<BlackSwanEvent>> {
        let mut state = self.state.lock().await;
        let Some(active) = &state.active else {
            if self.has_ledger_fault() {
                return self.clear_ledger_fault(reason).map(Some);
            }
            info!("Recover requested with no active black-swan event");
            return Ok(None);
        };

        let mut closed = active.clone();
        closed.recovered_at = Some(self.clock.stamp());
        closed.recovery_reason = Some(reason.to_string());
        closed.seal()?;

        if let Err(e) = self.ledger.append(&closed) {
            error!(
                event_id = %closed.event_id,
                "Failed to persist recovery, staying in {}: {}", closed.resulting_mode, e
            );
            return Err(e.into());
        }
        self.ledger_fault.store(false, Ordering::SeqCst);

        state.active = None;
        state.reconciliation_failures = 0;
        state.disconnections.clear();
        info!(
            event_id = %closed.event_id,
            "Black-swan event recovered: {}", reason
        );
        Ok(Some(closed))
    }

    /// Record the operator all-clear for an escalation that never reached
    /// the ledger. The record is written already recovered so it never
    /// becomes the active event.
    fn clear_ledger_fault(&self, reason: &str) -> Result<BlackSwanEvent> {
        let now = self.clock.stamp();
        let mut record = BlackSwanEvent {
            event_id: format!("bs-{}", Uuid::new_v4()),
            trigger_type: TriggerType::Manual,
            resulting_mode: RiskAction::ReduceOnly,
            trigger_value: None,
            threshold: None,
            details: "fail-closed after an unpersisted black-swan escalation".to_string(),
            triggered_at: now,
            recovered_at: Some(now),
            recovery_reason: Some(reason.to_string()),
            event_hash: String::new(),
        };
        record.seal()?;

        if let Err(e) = self.ledger.append(&record) {
            error!("Failed to persist fail-closed recovery, staying REDUCE_ONLY: {}", e);
            return Err(e.into());
        }
        self.ledger_fault.store(false, Ordering::SeqCst);
        info!(
            event_id = %record.event_id,
            "Fail-closed REDUCE_ONLY cleared: {}", reason
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryLedger;
    use rust_decimal_macros::dec;

    fn test_config() -> BlackSwanConfig {
        BlackSwanConfig {
            drawdown: DrawdownTrigger {
                threshold: dec!(0.2),
                action: RiskAction::Liquidate,
            },
            drift: DriftTrigger {
                action: RiskAction::ReduceOnly,
            },
            reconciliation: ReconciliationTrigger {
                max_consecutive_failures: 3,
                max_asset_diff_ratio: Some(dec!(0.01)),
                action: RiskAction::ReduceOnly,
            },
            disconnection: DisconnectionTrigger {
                max_disconnections: 3,
                time_window_secs: 300,
                action: RiskAction::ReduceOnly,
            },
        }
    }

    fn manager() -> (
        CatastrophicRiskManager,
        Arc<MemoryLedger<BlackSwanEvent>>,
        Arc<ManualClock>,
    ) {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::at_epoch());
        let manager =
            CatastrophicRiskManager::open(test_config(), ledger.clone(), clock.clone()).unwrap();
        (manager, ledger, clock)
    }

    #[tokio::test]
    async fn test_drawdown_threshold_is_inclusive() {
        let (manager, ledger, _) = manager();
        assert_eq!(
            manager.check_drawdown(dec!(0.19)).await.unwrap(),
            SystemRiskMode::Normal
        );
        assert!(ledger.is_empty());

        assert_eq!(
            manager.check_drawdown(dec!(0.2)).await.unwrap(),
            SystemRiskMode::Liquidate
        );
        let event = manager.active_event().await.unwrap();
        assert_eq!(event.trigger_type, TriggerType::Drawdown);
        assert_eq!(event.trigger_value, Some(dec!(0.2)));
        assert_eq!(event.threshold, Some(dec!(0.2)));
        assert!(event.verify());
    }

    #[tokio::test]
    async fn test_drift_trigger() {
        let (manager, _, _) = manager();
        assert_eq!(
            manager.check_drift(DriftStatus::Normal).await.unwrap(),
            SystemRiskMode::Normal
        );
        assert_eq!(
            manager.check_drift(DriftStatus::Blocked).await.unwrap(),
            SystemRiskMode::ReduceOnly
        );
    }

    #[tokio::test]
    async fn test_reconciliation_failures_reset_on_success() {
        let (manager, _, _) = manager();
        manager.check_reconciliation(dec!(0), false).await.unwrap();
        manager.check_reconciliation(dec!(0), false).await.unwrap();
        manager.check_reconciliation(dec!(0.001), true).await.unwrap();
        assert_eq!(manager.stats().await.reconciliation_failures, 0);

        manager.check_reconciliation(dec!(0), false).await.unwrap();
        manager.check_reconciliation(dec!(0), false).await.unwrap();
        // Successful but with too large an asset diff
        let mode = manager.check_reconciliation(dec!(0.05), true).await.unwrap();
        assert_eq!(mode, SystemRiskMode::ReduceOnly);

        let event = manager.active_event().await.unwrap();
        assert_eq!(event.trigger_type, TriggerType::Reconciliation);
        assert_eq!(event.trigger_value, Some(dec!(3)));
    }

    #[tokio::test]
    async fn test_disconnections_slide_out_of_window() {
        let (manager, _, clock) = manager();
        manager.check_disconnection().await.unwrap();
        manager.check_disconnection().await.unwrap();
        clock.advance_secs(300);
        assert_eq!(
            manager.check_disconnection().await.unwrap(),
            SystemRiskMode::Normal
        );
        assert_eq!(manager.stats().await.recent_disconnections, 1);

        manager.check_disconnection().await.unwrap();
        assert_eq!(
            manager.check_disconnection().await.unwrap(),
            SystemRiskMode::ReduceOnly
        );
    }

    #[tokio::test]
    async fn test_single_active_event_and_supersede() {
        let (manager, ledger, _) = manager();
        manager.check_drift(DriftStatus::ReduceOnly).await.unwrap();
        let first = manager.active_event().await.unwrap();

        // Equal severity records nothing
        manager
            .manual_trigger(RiskAction::ReduceOnly, "ops drill")
            .await
            .unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(manager.active_event().await.unwrap().event_id, first.event_id);

        // Strictly more severe closes the old event in the same batch
        let mode = manager.check_drawdown(dec!(0.3)).await.unwrap();
        assert_eq!(mode, SystemRiskMode::Liquidate);
        assert_eq!(ledger.len(), 3);

        let history = manager.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|e| e.is_active()).count(), 1);
        let superseded = history.iter().find(|e| e.event_id == first.event_id).unwrap();
        let active = manager.active_event().await.unwrap();
        assert_eq!(
            superseded.recovery_reason.as_deref(),
            Some(format!("superseded by {}", active.event_id).as_str())
        );

        // Less severe while liquidating records nothing
        manager.check_drift(DriftStatus::Blocked).await.unwrap();
        assert_eq!(ledger.len(), 3);
    }

    #[tokio::test]
    async fn test_recover_closes_same_record_and_resets_counters() {
        let (manager, ledger, _) = manager();
        manager.check_reconciliation(dec!(0), false).await.unwrap();
        manager
            .manual_trigger(RiskAction::Liquidate, "exchange halted")
            .await
            .unwrap();
        let active = manager.active_event().await.unwrap();

        let closed = manager.recover("exchange resumed").await.unwrap().unwrap();
        assert_eq!(closed.event_id, active.event_id);
        assert_eq!(closed.recovery_reason.as_deref(), Some("exchange resumed"));
        assert!(closed.verify());
        assert_eq!(manager.get_current_status().await, SystemRiskMode::Normal);
        assert_eq!(manager.stats().await.reconciliation_failures, 0);

        let history = manager.history().unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_active());
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_idle_recover_is_noop() {
        let (manager, ledger, _) = manager();
        assert!(manager.recover("nothing to do").await.unwrap().is_none());
        assert!(ledger.is_empty());
        assert_eq!(manager.get_current_status().await, SystemRiskMode::Normal);
    }

    #[tokio::test]
    async fn test_manual_trigger_requires_reason() {
        let (manager, _, _) = manager();
        assert!(matches!(
            manager.manual_trigger(RiskAction::Liquidate, "  ").await,
            Err(GuardrailError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ledger_failure_fails_closed() {
        let (manager, ledger, _) = manager();
        ledger.set_fail_writes(true);

        assert!(manager.check_drawdown(dec!(0.5)).await.is_err());
        assert!(manager.active_event().await.is_none());
        assert!(manager.has_ledger_fault());
        assert_eq!(manager.get_current_status().await, SystemRiskMode::ReduceOnly);

        ledger.set_fail_writes(false);
        assert_eq!(
            manager.check_drawdown(dec!(0.5)).await.unwrap(),
            SystemRiskMode::Liquidate
        );
        assert!(!manager.has_ledger_fault());

        // A failed recovery keeps the mode
        ledger.set_fail_writes(true);
        assert!(manager.recover("too early").await.is_err());
        assert_eq!(manager.get_current_status().await, SystemRiskMode::Liquidate);
    }

    #[tokio::test]
    async fn test_recover_clears_fault_without_active_event() {
        let (manager, ledger, _) = manager();
        ledger.set_fail_writes(true);
        assert!(manager.check_drift(DriftStatus::Blocked).await.is_err());
        assert_eq!(manager.get_current_status().await, SystemRiskMode::ReduceOnly);

        // Still unwritable: the all-clear is refused as well
        assert!(manager.recover("ledger back").await.is_err());
        assert_eq!(manager.get_current_status().await, SystemRiskMode::ReduceOnly);

        ledger.set_fail_writes(false);
        let record = manager.recover("ledger back").await.unwrap().unwrap();
        assert!(!record.is_active());
        assert_eq!(record.trigger_type, TriggerType::Manual);
        assert_eq!(record.recovery_reason.as_deref(), Some("ledger back"));
        assert!(!manager.has_ledger_fault());
        assert_eq!(manager.get_current_status().await, SystemRiskMode::Normal);
        assert!(manager.active_event().await.is_none());
        assert_eq!(ledger.len(), 1);
    }

    fn unclosed(mode: RiskAction, trigger_type: TriggerType, clock: &ManualClock) -> BlackSwanEvent {
        let mut event = BlackSwanEvent {
            event_id: format!("bs-{}", Uuid::new_v4()),
            trigger_type,
            resulting_mode: mode,
            trigger_value: None,
            threshold: None,
            details: format!("{} left open", trigger_type),
            triggered_at: clock.stamp(),
            recovered_at: None,
            recovery_reason: None,
            event_hash: String::new(),
        };
        event.seal().unwrap();
        event
    }

    #[tokio::test]
    async fn test_open_closes_extra_unclosed_events() {
        let ledger = Arc::new(MemoryLedger::<BlackSwanEvent>::new());
        let clock = Arc::new(ManualClock::at_epoch());
        let drift = unclosed(RiskAction::ReduceOnly, TriggerType::Drift, &clock);
        clock.advance_secs(5);
        let drawdown = unclosed(RiskAction::Liquidate, TriggerType::Drawdown, &clock);
        ledger.append_batch(&[drift.clone(), drawdown.clone()]).unwrap();

        let manager =
            CatastrophicRiskManager::open(test_config(), ledger.clone(), clock.clone()).unwrap();
        assert_eq!(manager.get_current_status().await, SystemRiskMode::Liquidate);

        let history = manager.history().unwrap();
        assert_eq!(history.iter().filter(|e| e.is_active()).count(), 1);
        let closed = history.iter().find(|e| e.event_id == drift.event_id).unwrap();
        assert_eq!(
            closed.recovery_reason.as_deref(),
            Some(format!("superseded by {}", drawdown.event_id).as_str())
        );

        manager.recover("flattened").await.unwrap().unwrap();
        drop(manager);

        let manager = CatastrophicRiskManager::open(test_config(), ledger, clock).unwrap();
        assert_eq!(manager.get_current_status().await, SystemRiskMode::Normal);
        assert!(manager.history().unwrap().iter().all(|e| !e.is_active()));
    }

    #[tokio::test]
    async fn test_restart_resumes_unrecovered_mode() {
        let ledger = Arc::new(MemoryLedger::<BlackSwanEvent>::new());
        let clock = Arc::new(ManualClock::at_epoch());
        {
            let manager =
                CatastrophicRiskManager::open(test_config(), ledger.clone(), clock.clone())
                    .unwrap();
            manager.check_drift(DriftStatus::Blocked).await.unwrap();
            manager.recover("drift resolved").await.unwrap();
            manager.check_drawdown(dec!(0.25)).await.unwrap();
        }

        let manager = CatastrophicRiskManager::open(test_config(), ledger.clone(), clock).unwrap();
        assert_eq!(manager.get_current_status().await, SystemRiskMode::Liquidate);
        assert_eq!(
            manager.active_event().await.unwrap().trigger_type,
            TriggerType::Drawdown
        );
    }

    #[tokio::test]
    async fn test_event_round_trip_is_byte_identical() {
        let (manager, _, _) = manager();
        manager.check_drawdown(dec!(0.2500)).await.unwrap();
        let event = manager.active_event().await.unwrap();

        let json = serde_json::to_string(&event).unwrap();
        let mut reloaded: BlackSwanEvent = serde_json::from_str(&json).unwrap();
        reloaded.seal().unwrap();
        assert_eq!(serde_json::to_string(&reloaded).unwrap(), json);
    }
}
