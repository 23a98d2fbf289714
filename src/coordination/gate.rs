//! Combined admission posture across the guardrail axes.
//!
//! Any axis may force a stricter posture; the most severe one wins.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::black_swan::CatastrophicRiskManager;
use super::order_guard::OrderAdmissionGuard;
use crate::domain::{GuardMode, StrategyStatus, SystemRiskMode};
use crate::supervisor::ConnectivitySupervisor;

/// What the execution layer may do, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    Normal,
    /// Closing and reducing orders only
    ReduceOnly,
    /// No live orders for the strategy
    Blocked,
    /// Flatten positions
    Liquidate,
}

impl Posture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Posture::Normal => "normal",
            Posture::ReduceOnly => "reduce_only",
            Posture::Blocked => "blocked",
            Posture::Liquidate => "liquidate",
        }
    }

    pub fn allows_opening(&self) -> bool {
        matches!(self, Posture::Normal)
    }
}

impl std::fmt::Display for Posture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Posture plus the axes that imposed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub posture: Posture,
    pub reasons: Vec<String>,
}

impl Assessment {
    fn new() -> Self {
        Self {
            posture: Posture::Normal,
            reasons: Vec::new(),
        }
    }

    fn raise(&mut self, posture: Posture, reason: String) {
        self.posture = self.posture.max(posture);
        self.reasons.push(reason);
    }
}

pub struct SafetyGate {
    connectivity: Arc<ConnectivitySupervisor>,
    guard: Arc<OrderAdmissionGuard>,
    risk: Arc<CatastrophicRiskManager>,
}

impl SafetyGate {
    pub fn new(
        connectivity: Arc<ConnectivitySupervisor>,
        guard: Arc<OrderAdmissionGuard>,
        risk: Arc<CatastrophicRiskManager>,
    ) -> Self {
        Self {
            connectivity,
            guard,
            risk,
        }
    }

    pub async fn posture(&self, strategy_id: &str, strategy_status: StrategyStatus) -> Posture {
        self.assess(strategy_id, strategy_status).await.posture
    }

    /// Combine every axis for `strategy_id`. `strategy_status` comes from
    /// the strategy's degradation monitor.
    pub async fn assess(&self, strategy_id: &str, strategy_status: StrategyStatus) -> Assessment {
        let mut assessment = Assessment::new();

        if self.connectivity.has_ledger_fault() {
            assessment.raise(
                Posture::ReduceOnly,
                "connectivity ledger fault".to_string(),
            );
        } else if self.connectivity.is_safe_stop() {
            let reason = self
                .connectivity
                .state()
                .reason
                .unwrap_or_else(|| "SAFE_STOP".to_string());
            assessment.raise(Posture::ReduceOnly, format!("SAFE_STOP: {}", reason));
        }

        match self.guard.status(strategy_id) {
            Ok(GuardMode::Normal) => {}
            Ok(GuardMode::ReduceOnly) => {
                assessment.raise(Posture::ReduceOnly, "order guard reduce_only".to_string())
            }
            Ok(GuardMode::Blocked) => {
                assessment.raise(Posture::Blocked, "order guard blocked".to_string())
            }
            Err(e) => {
                warn!(strategy = %strategy_id, "Order guard unavailable: {}", e);
                assessment.raise(Posture::Blocked, format!("order guard unavailable: {}", e));
            }
        }

        if !strategy_status.trades_live() {
            assessment.raise(
                Posture::Blocked,
                format!("strategy status {}", strategy_status),
            );
        }

        if self.risk.has_ledger_fault() {
            assessment.raise(Posture::ReduceOnly, "risk ledger fault".to_string());
        }
        match self.risk.get_current_status().await {
            SystemRiskMode::Normal => {}
            SystemRiskMode::ReduceOnly => {
                assessment.raise(Posture::ReduceOnly, "black-swan reduce_only".to_string())
            }
            SystemRiskMode::Liquidate => {
                assessment.raise(Posture::Liquidate, "black-swan liquidate".to_string())
            }
        }

        debug!(
            strategy = %strategy_id,
            posture = %assessment.posture,
            "Safety posture assessed"
        );
        assessment
    }
}
