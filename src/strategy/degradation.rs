//! Strategy Degradation Monitor
//!
//! Tracks the most recent N closed trades of one strategy and downgrades it
//! (to paper trading or blocked) when the rolling window breaches its
//! performance thresholds. The monitor only decides and records; switching
//! the strategy off is the caller's job.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{ClosedTrade, StrategyStatus};
use crate::error::{GuardrailError, Result};
use crate::persistence::{content_hash, timestamp, EvidenceStore, LedgerRecord};

/// Downgrade applied when thresholds are breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationAction {
    PaperDowngrade,
    Blocked,
}

impl DegradationAction {
    pub fn event_type(&self) -> DegradationEventType {
        match self {
            DegradationAction::PaperDowngrade => DegradationEventType::PaperDowngrade,
            DegradationAction::Blocked => DegradationEventType::Blocked,
        }
    }
}

fn default_severe_drawdown_multiplier() -> Decimal {
    Decimal::new(15, 1)
}

fn default_single_violation_action() -> DegradationAction {
    DegradationAction::Blocked
}

fn default_multi_violation_action() -> DegradationAction {
    DegradationAction::PaperDowngrade
}

/// Degradation thresholds. Window, capital and at least one threshold must be
/// configured; only the escalation policy has defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    /// Number of most recent trades in the window
    pub window_size: usize,
    /// Capital the window's return and turnover are measured against
    pub initial_capital: Decimal,
    #[serde(default)]
    pub min_return: Option<Decimal>,
    #[serde(default)]
    pub max_drawdown: Option<Decimal>,
    #[serde(default)]
    pub min_winrate: Option<Decimal>,
    #[serde(default)]
    pub max_turnover: Option<Decimal>,
    /// Drawdown at this multiple of `max_drawdown` blocks outright
    #[serde(default = "default_severe_drawdown_multiplier")]
    pub severe_drawdown_multiplier: Decimal,
    #[serde(default = "default_single_violation_action")]
    pub single_violation_action: DegradationAction,
    #[serde(default = "default_multi_violation_action")]
    pub multi_violation_action: DegradationAction,
}

impl DegradationConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.window_size == 0 {
            errors.push("degradation.window_size must be positive".to_string());
        }
        if self.initial_capital <= Decimal::ZERO {
            errors.push("degradation.initial_capital must be positive".to_string());
        }
        if self.min_return.is_none()
            && self.max_drawdown.is_none()
            && self.min_winrate.is_none()
            && self.max_turnover.is_none()
        {
            errors.push("degradation requires at least one threshold".to_string());
        }
        if let Some(dd) = self.max_drawdown {
            if dd <= Decimal::ZERO {
                errors.push("degradation.max_drawdown must be positive".to_string());
            }
        }
        if let Some(wr) = self.min_winrate {
            if wr < Decimal::ZERO || wr > Decimal::ONE {
                errors.push("degradation.min_winrate must be in [0, 1]".to_string());
            }
        }
        if let Some(turnover) = self.max_turnover {
            if turnover <= Decimal::ZERO {
                errors.push("degradation.max_turnover must be positive".to_string());
            }
        }
        if self.severe_drawdown_multiplier < Decimal::ONE {
            errors.push("degradation.severe_drawdown_multiplier must be at least 1".to_string());
        }
        errors
    }
}

/// Window metrics, in tie-break order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalReturn,
    MaxDrawdown,
    WinRate,
    Turnover,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::TotalReturn => "total_return",
            Metric::MaxDrawdown => "max_drawdown",
            Metric::WinRate => "win_rate",
            Metric::Turnover => "turnover",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Performance over the most recent N trades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    #[serde(with = "timestamp")]
    pub window_start: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub window_end: DateTime<Utc>,
    pub trade_count: usize,
    pub total_return: Decimal,
    pub max_drawdown: Decimal,
    pub win_rate: Decimal,
    pub turnover: Decimal,
    pub content_hash: String,
}

impl WindowMetrics {
    /// Compute metrics over `trades` against `capital`.
    ///
    /// Drawdown follows the equity path `capital + cumulative pnl`.
    pub fn compute(trades: &[ClosedTrade], capital: Decimal) -> Result<Option<Self>> {
        let (Some(first), Some(last)) = (trades.first(), trades.last()) else {
            return Ok(None);
        };
        if capital <= Decimal::ZERO {
            return Err(GuardrailError::Evaluation(format!(
                "capital {} is not positive",
                capital
            )));
        }
        let overflow = || GuardrailError::Evaluation("window metric overflow".to_string());

        let mut pnl = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        let mut wins = 0usize;
        let mut equity = capital;
        let mut peak = capital;
        let mut max_drawdown = Decimal::ZERO;

        for trade in trades {
            pnl = pnl.checked_add(trade.pnl).ok_or_else(overflow)?;
            notional = notional.checked_add(trade.notional.abs()).ok_or_else(overflow)?;
            if trade.is_win() {
                wins += 1;
            }
            equity = equity.checked_add(trade.pnl).ok_or_else(overflow)?;
            peak = peak.max(equity);
            let drawdown = peak
                .checked_sub(equity)
                .and_then(|fall| fall.checked_div(peak))
                .ok_or_else(overflow)?;
            max_drawdown = max_drawdown.max(drawdown);
        }

        let count = Decimal::from(trades.len() as u64);
        let mut metrics = Self {
            window_start: first.closed_at,
            window_end: last.closed_at,
            trade_count: trades.len(),
            total_return: pnl.checked_div(capital).ok_or_else(overflow)?,
            max_drawdown,
            win_rate: Decimal::from(wins as u64)
                .checked_div(count)
                .ok_or_else(overflow)?,
            turnover: notional.checked_div(capital).ok_or_else(overflow)?,
            content_hash: String::new(),
        };
        metrics.content_hash = metrics.compute_hash()?;
        Ok(Some(metrics))
    }

    fn compute_hash(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.content_hash = String::new();
        Ok(content_hash(&unsealed)?)
    }

    pub fn verify(&self) -> bool {
        self.compute_hash()
            .map(|hash| hash == self.content_hash)
            .unwrap_or(false)
    }

    pub fn value(&self, metric: Metric) -> Decimal {
        match metric {
            Metric::TotalReturn => self.total_return,
            Metric::MaxDrawdown => self.max_drawdown,
            Metric::WinRate => self.win_rate,
            Metric::Turnover => self.turnover,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationEventType {
    Blocked,
    PaperDowngrade,
    /// Operator returned the strategy to live trading
    Reactivated,
}

impl DegradationEventType {
    pub fn resulting_status(&self) -> StrategyStatus {
        match self {
            DegradationEventType::Blocked => StrategyStatus::Blocked,
            DegradationEventType::PaperDowngrade => StrategyStatus::Paper,
            DegradationEventType::Reactivated => StrategyStatus::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationEventType::Blocked => "blocked",
            DegradationEventType::PaperDowngrade => "paper_downgrade",
            DegradationEventType::Reactivated => "reactivated",
        }
    }
}

impl std::fmt::Display for DegradationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted status change of a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationEvent {
    pub event_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub strategy_code: String,
    pub event_type: DegradationEventType,
    pub trigger_metric: Option<Metric>,
    pub trigger_value: Option<Decimal>,
    pub threshold_value: Option<Decimal>,
    pub violated_metrics: Vec<Metric>,
    pub window_metrics: Option<WindowMetrics>,
    pub reason: String,
    pub event_hash: String,
}

impl LedgerRecord for DegradationEvent {
    const FAMILY: &'static str = "degradation_event";

    fn record_id(&self) -> &str {
        &self.event_id
    }

    fn event_hash(&self) -> &str {
        &self.event_hash
    }

    fn set_event_hash(&mut self, hash: String) {
        self.event_hash = hash;
    }
}

struct Breach {
    metric: Metric,
    value: Decimal,
    threshold: Decimal,
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let relation = match self.metric {
            Metric::TotalReturn | Metric::WinRate => "below",
            Metric::MaxDrawdown | Metric::Turnover => "above",
        };
        write!(
            f,
            "{} {} {} {}",
            self.metric,
            self.value.round_dp(6),
            relation,
            self.threshold
        )
    }
}

struct MonitorState {
    status: StrategyStatus,
    trades: VecDeque<ClosedTrade>,
    metrics: Option<WindowMetrics>,
}

/// Rolling-window degradation monitor for one strategy
pub struct StrategyDegradationMonitor {
    strategy_code: String,
    config: DegradationConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn EvidenceStore<DegradationEvent>>,
    state: Mutex<MonitorState>,
    ledger_fault: AtomicBool,
}

impl StrategyDegradationMonitor {
    /// Create a monitor for `strategy_code`, restoring its status from the
    /// latest recorded event.
    pub fn open(
        strategy_code: impl Into<String>,
        config: DegradationConfig,
        ledger: Arc<dyn EvidenceStore<DegradationEvent>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let strategy_code = strategy_code.into();
        let status = ledger
            .load_all()?
            .into_iter()
            .filter(|e| e.strategy_code == strategy_code)
            .last()
            .map(|e| e.event_type.resulting_status())
            .unwrap_or(StrategyStatus::Active);
        if status != StrategyStatus::Active {
            warn!(strategy = %strategy_code, "Restored degraded status {}", status);
        }

        Ok(Self {
            strategy_code,
            config: config.clone(),
            clock,
            ledger,
            state: Mutex::new(MonitorState {
                status,
                trades: VecDeque::with_capacity(config.window_size),
                metrics: None,
            }),
            ledger_fault: AtomicBool::new(false),
        })
    }

    pub fn strategy_code(&self) -> &str {
        &self.strategy_code
    }

    fn lock(&self) -> Result<MutexGuard<'_, MonitorState>> {
        self.state
            .lock()
            .map_err(|_| GuardrailError::Poisoned("degradation monitor"))
    }

    /// Append a closed trade and recompute the window once it is full.
    pub fn add_trade(&self, trade: ClosedTrade) -> Result<Option<WindowMetrics>> {
        let mut state = self.lock()?;
        state.trades.push_back(trade);
        while state.trades.len() > self.config.window_size {
            state.trades.pop_front();
        }

        if state.trades.len() < self.config.window_size {
            debug!(
                strategy = %self.strategy_code,
                "{}/{} trades in window", state.trades.len(), self.config.window_size
            );
            return Ok(None);
        }

        let trades: Vec<ClosedTrade> = state.trades.iter().cloned().collect();
        match WindowMetrics::compute(&trades, self.config.initial_capital) {
            Ok(metrics) => {
                state.metrics = metrics.clone();
                Ok(metrics)
            }
            Err(e) => {
                // The window no longer matches the last metrics
                state.metrics = None;
                error!(strategy = %self.strategy_code, "Window metrics failed: {}", e);
                Err(e)
            }
        }
    }

    /// Evaluate the current window and record a downgrade if one is due.
    ///
    /// Returns `None` until the window is full and whenever the status would
    /// not get stricter.
    pub fn check_degradation(&self) -> Result<Option<DegradationEvent>> {
        let mut state = self.lock()?;
        let Some(metrics) = state.metrics.clone() else {
            return Ok(None);
        };

        let breaches = self.breaches(&metrics);
        if breaches.is_empty() {
            return Ok(None);
        }

        let severe = self.config.max_drawdown.and_then(|threshold| {
            let severe_threshold = threshold.checked_mul(self.config.severe_drawdown_multiplier)?;
            (metrics.max_drawdown >= severe_threshold).then_some(Breach {
                metric: Metric::MaxDrawdown,
                value: metrics.max_drawdown,
                threshold: severe_threshold,
            })
        });

        let (action, trigger) = match severe {
            Some(breach) => (DegradationAction::Blocked, breach),
            None => {
                let action = if breaches.len() >= 2 {
                    self.config.multi_violation_action
                } else {
                    self.config.single_violation_action
                };
                let first = &breaches[0];
                (
                    action,
                    Breach {
                        metric: first.metric,
                        value: first.value,
                        threshold: first.threshold,
                    },
                )
            }
        };

        let event_type = action.event_type();
        let resulting = event_type.resulting_status();
        if resulting <= state.status {
            debug!(
                strategy = %self.strategy_code,
                "Degradation {} does not raise status {}", event_type, state.status
            );
            return Ok(None);
        }

        let reason = breaches
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        let mut event = DegradationEvent {
            event_id: format!("deg-{}", Uuid::new_v4()),
            timestamp: self.clock.stamp(),
            strategy_code: self.strategy_code.clone(),
            event_type,
            trigger_metric: Some(trigger.metric),
            trigger_value: Some(trigger.value),
            threshold_value: Some(trigger.threshold),
            violated_metrics: breaches.iter().map(|b| b.metric).collect(),
            window_metrics: Some(metrics),
            reason,
            event_hash: String::new(),
        };
        event.seal()?;

        if let Err(e) = self.ledger.append(&event) {
            self.ledger_fault.store(true, Ordering::SeqCst);
            error!(
                strategy = %self.strategy_code,
                "Failed to persist degradation event, failing closed: {}", e
            );
            return Err(e.into());
        }
        self.ledger_fault.store(false, Ordering::SeqCst);

        state.status = resulting;
        warn!(
            strategy = %self.strategy_code,
            event_type = %event.event_type,
            trigger = %trigger.metric,
            "Strategy degraded to {}: {}", resulting, event.reason
        );
        Ok(Some(event))
    }

    fn breaches(&self, metrics: &WindowMetrics) -> Vec<Breach> {
        let cfg = &self.config;
        let mut breaches = Vec::new();
        if let Some(min) = cfg.min_return {
            if metrics.total_return < min {
                breaches.push(Breach {
                    metric: Metric::TotalReturn,
                    value: metrics.total_return,
                    threshold: min,
                });
            }
        }
        if let Some(max) = cfg.max_drawdown {
            if metrics.max_drawdown > max {
                breaches.push(Breach {
                    metric: Metric::MaxDrawdown,
                    value: metrics.max_drawdown,
                    threshold: max,
                });
            }
        }
        if let Some(min) = cfg.min_winrate {
            if metrics.win_rate < min {
                breaches.push(Breach {
                    metric: Metric::WinRate,
                    value: metrics.win_rate,
                    threshold: min,
                });
            }
        }
        if let Some(max) = cfg.max_turnover {
            if metrics.turnover > max {
                breaches.push(Breach {
                    metric: Metric::Turnover,
                    value: metrics.turnover,
                    threshold: max,
                });
            }
        }
        breaches
    }

    /// `add_trade` followed by `check_degradation`.
    pub fn record_trade(&self, trade: ClosedTrade) -> Result<Option<DegradationEvent>> {
        self.add_trade(trade)?;
        self.check_degradation()
    }

    /// Operator-issued return to ACTIVE. The trade window restarts empty.
    pub fn reactivate(&self, reason: &str) -> Result<Option<DegradationEvent>> {
        let mut state = self.lock()?;
        let fault = self.has_ledger_fault();
        if state.status == StrategyStatus::Active && !fault {
            info!(strategy = %self.strategy_code, "Reactivate requested but strategy is active");
            return Ok(None);
        }
        // A fault reports PAPER even though the downgrade never landed
        let reported = if fault {
            state.status.max(StrategyStatus::Paper)
        } else {
            state.status
        };

        let mut event = DegradationEvent {
            event_id: format!("deg-{}", Uuid::new_v4()),
            timestamp: self.clock.stamp(),
            strategy_code: self.strategy_code.clone(),
            event_type: DegradationEventType::Reactivated,
            trigger_metric: None,
            trigger_value: None,
            threshold_value: None,
            violated_metrics: Vec::new(),
            window_metrics: state.metrics.clone(),
            reason: format!("reactivated from {}: {}", reported, reason),
            event_hash: String::new(),
        };
        event.seal()?;

        if let Err(e) = self.ledger.append(&event) {
            error!(
                strategy = %self.strategy_code,
                "Failed to persist reactivation, staying {}: {}", reported, e
            );
            return Err(e.into());
        }
        self.ledger_fault.store(false, Ordering::SeqCst);

        state.status = StrategyStatus::Active;
        state.trades.clear();
        state.metrics = None;
        info!(strategy = %self.strategy_code, "Strategy reactivated: {}", reason);
        Ok(Some(event))
    }

    /// Current status; at least PAPER while a downgrade failed to persist.
    pub fn get_status(&self) -> Result<StrategyStatus> {
        let status = self.lock()?.status;
        if self.has_ledger_fault() {
            Ok(status.max(StrategyStatus::Paper))
        } else {
            Ok(status)
        }
    }

    pub fn has_ledger_fault(&self) -> bool {
        self.ledger_fault.load(Ordering::SeqCst)
    }

    pub fn window_metrics(&self) -> Result<Option<WindowMetrics>> {
        Ok(self.lock()?.metrics.clone())
    }

    /// Recorded events for this strategy.
    pub fn history(&self) -> Result<Vec<DegradationEvent>> {
        Ok(self
            .ledger
            .load_all()?
            .into_iter()
            .filter(|e| e.strategy_code == self.strategy_code)
            .collect())
    }
}
