use serde::{Deserialize, Serialize};
use std::fmt;

/// Connectivity axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityMode {
    /// Every channel is reporting
    Normal,
    /// A channel timed out: no new opening orders
    SafeStop,
}

impl ConnectivityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityMode::Normal => "NORMAL",
            ConnectivityMode::SafeStop => "SAFE_STOP",
        }
    }
}

impl fmt::Display for ConnectivityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-strategy order admission mode, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    Normal,
    /// Only sell orders are admitted
    ReduceOnly,
    /// No orders are admitted
    Blocked,
}

impl GuardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardMode::Normal => "normal",
            GuardMode::ReduceOnly => "reduce_only",
            GuardMode::Blocked => "blocked",
        }
    }
}

impl fmt::Display for GuardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Escalation configured on a guard rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardAction {
    ReduceOnly,
    Block,
}

impl GuardAction {
    pub fn resulting_mode(&self) -> GuardMode {
        match self {
            GuardAction::ReduceOnly => GuardMode::ReduceOnly,
            GuardAction::Block => GuardMode::Blocked,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuardAction::ReduceOnly => "reduce_only",
            GuardAction::Block => "block",
        }
    }
}

impl fmt::Display for GuardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mode a black-swan trigger forces on the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    ReduceOnly,
    Liquidate,
}

impl RiskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskAction::ReduceOnly => "reduce_only",
            RiskAction::Liquidate => "liquidate",
        }
    }
}

impl fmt::Display for RiskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for RiskAction {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "reduce_only" => Ok(RiskAction::ReduceOnly),
            "liquidate" => Ok(RiskAction::Liquidate),
            _ => Err(format!("unknown risk action: {}", s)),
        }
    }
}

impl std::str::FromStr for RiskAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RiskAction::try_from(s)
    }
}

/// System-wide trading mode, derived from the active black-swan event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemRiskMode {
    Normal,
    ReduceOnly,
    Liquidate,
}

impl SystemRiskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemRiskMode::Normal => "NORMAL",
            SystemRiskMode::ReduceOnly => "REDUCE_ONLY",
            SystemRiskMode::Liquidate => "LIQUIDATE",
        }
    }

    pub fn can_open_positions(&self) -> bool {
        matches!(self, SystemRiskMode::Normal)
    }
}

impl From<RiskAction> for SystemRiskMode {
    fn from(action: RiskAction) -> Self {
        match action {
            RiskAction::ReduceOnly => SystemRiskMode::ReduceOnly,
            RiskAction::Liquidate => SystemRiskMode::Liquidate,
        }
    }
}

impl fmt::Display for SystemRiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health signal produced by the external drift computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Normal,
    ReduceOnly,
    Blocked,
}

impl DriftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftStatus::Normal => "normal",
            DriftStatus::ReduceOnly => "reduce_only",
            DriftStatus::Blocked => "blocked",
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, DriftStatus::ReduceOnly | DriftStatus::Blocked)
    }
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deployment status of a strategy, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    Active,
    /// Trading on paper only
    Paper,
    Blocked,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Paper => "PAPER",
            StrategyStatus::Blocked => "BLOCKED",
        }
    }

    pub fn trades_live(&self) -> bool {
        matches!(self, StrategyStatus::Active)
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
