pub mod cli;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod strategy;
pub mod supervisor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuardrailConfig;
pub use coordination::{
    BlackSwanConfig, BlackSwanEvent, CatastrophicRiskManager, Decision, DecisionAction,
    GuardEvent, OrderAdmissionGuard, OrderGuardConfig, Posture, SafetyGate,
};
pub use domain::{
    AccountSnapshot, ClosedTrade, ConnectivityMode, DriftStatus, GuardAction, GuardMode,
    MarketSnapshot, Order, OrderSide, OrderType, RiskAction, StrategyStatus, SystemRiskMode,
};
pub use error::{GuardrailError, Result, StorageError};
pub use persistence::{EvidenceLedger, EvidenceStore, IntegrityReport, LedgerRecord, MemoryLedger};
pub use strategy::{DegradationConfig, DegradationEvent, StrategyDegradationMonitor, WindowMetrics};
pub use supervisor::{BlockingIssue, Channel, ConnectivityConfig, ConnectivitySupervisor};
