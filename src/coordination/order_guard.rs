//! Order Admission Guard
//!
//! Synchronous per-order rule engine called on the order-submission path
//! before an order reaches a broker adapter. Five independent anomaly rules
//! escalate a per-strategy mode (normal → reduce_only → blocked). Every
//! violation is persisted as a [`GuardEvent`] before the escalation takes
//! effect; the next successful order outcome clears the strategy again.
//!
//! Missing market data or equity skips the affected rule (fail-open); a
//! detected violation, an unevaluable rule, a poisoned lock or a ledger
//! failure rejects the order (fail-closed).

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{AccountSnapshot, GuardAction, GuardMode, MarketSnapshot, Order, OrderSide};
use crate::error::{GuardrailError, Result};
use crate::persistence::{timestamp, EvidenceStore, LedgerRecord};

/// Duplicate-order burst rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateOrderRule {
    pub enabled: bool,
    /// Same (strategy, symbol, side) orders allowed inside the window
    pub max_orders: usize,
    pub time_window_secs: i64,
    pub action: GuardAction,
}

/// Limit price vs. market price rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceDeviationRule {
    pub enabled: bool,
    /// e.g. 0.05 = 5% away from the last price
    pub max_deviation: Decimal,
    pub action: GuardAction,
}

/// Order notional vs. account equity rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotionalRule {
    pub enabled: bool,
    /// e.g. 0.2 = one order may not exceed 20% of equity
    pub max_ratio: Decimal,
    pub action: GuardAction,
}

/// Cancellation frequency rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelFrequencyRule {
    pub enabled: bool,
    pub max_cancels: usize,
    pub time_window_secs: i64,
    pub action: GuardAction,
}

/// Consecutive order failure rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsecutiveFailureRule {
    pub enabled: bool,
    pub max_failures: u32,
    pub action: GuardAction,
}

/// Configuration for the order admission guard
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderGuardConfig {
    pub duplicate_order: DuplicateOrderRule,
    pub price_deviation: PriceDeviationRule,
    pub excessive_notional: NotionalRule,
    pub frequent_cancel: CancelFrequencyRule,
    pub consecutive_failures: ConsecutiveFailureRule,
    /// Rolling retention of order and cancel history (default: 1 hour)
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: i64,
}

fn default_history_retention_secs() -> i64 {
    3600
}

impl Default for OrderGuardConfig {
    fn default() -> Self {
        Self {
            duplicate_order: DuplicateOrderRule {
                enabled: true,
                max_orders: 3,
                time_window_secs: 10,
                action: GuardAction::Block,
            },
            price_deviation: PriceDeviationRule {
                enabled: true,
                max_deviation: Decimal::new(5, 2),
                action: GuardAction::Block,
            },
            excessive_notional: NotionalRule {
                enabled: true,
                max_ratio: Decimal::new(2, 1),
                action: GuardAction::ReduceOnly,
            },
            frequent_cancel: CancelFrequencyRule {
                enabled: true,
                max_cancels: 20,
                time_window_secs: 60,
                action: GuardAction::ReduceOnly,
            },
            consecutive_failures: ConsecutiveFailureRule {
                enabled: true,
                max_failures: 5,
                action: GuardAction::Block,
            },
            history_retention_secs: default_history_retention_secs(),
        }
    }
}

impl OrderGuardConfig {
    pub fn action_for(&self, rule: GuardRuleKind) -> GuardAction {
        match rule {
            GuardRuleKind::DuplicateOrder => self.duplicate_order.action,
            GuardRuleKind::PriceDeviation => self.price_deviation.action,
            GuardRuleKind::ExcessiveNotional => self.excessive_notional.action,
            GuardRuleKind::FrequentCancel => self.frequent_cancel.action,
            GuardRuleKind::ConsecutiveFailures => self.consecutive_failures.action,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let retention = self.history_retention_secs;

        if self.duplicate_order.max_orders == 0 {
            errors.push("order_guard.duplicate_order.max_orders must be positive".to_string());
        }
        if self.duplicate_order.time_window_secs <= 0
            || self.duplicate_order.time_window_secs > retention
        {
            errors.push(format!(
                "order_guard.duplicate_order.time_window_secs must be in (0, {}]",
                retention
            ));
        }
        if self.price_deviation.max_deviation <= Decimal::ZERO {
            errors.push("order_guard.price_deviation.max_deviation must be positive".to_string());
        }
        if self.excessive_notional.max_ratio <= Decimal::ZERO {
            errors.push("order_guard.excessive_notional.max_ratio must be positive".to_string());
        }
        if self.frequent_cancel.max_cancels == 0 {
            errors.push("order_guard.frequent_cancel.max_cancels must be positive".to_string());
        }
        if self.frequent_cancel.time_window_secs <= 0
            || self.frequent_cancel.time_window_secs > retention
        {
            errors.push(format!(
                "order_guard.frequent_cancel.time_window_secs must be in (0, {}]",
                retention
            ));
        }
        if self.consecutive_failures.max_failures == 0 {
            errors.push("order_guard.consecutive_failures.max_failures must be positive".to_string());
        }
        errors
    }
}

/// The five anomaly rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardRuleKind {
    DuplicateOrder,
    PriceDeviation,
    ExcessiveNotional,
    FrequentCancel,
    ConsecutiveFailures,
}

impl GuardRuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardRuleKind::DuplicateOrder => "duplicate_order",
            GuardRuleKind::PriceDeviation => "price_deviation",
            GuardRuleKind::ExcessiveNotional => "excessive_notional",
            GuardRuleKind::FrequentCancel => "frequent_cancel",
            GuardRuleKind::ConsecutiveFailures => "consecutive_failures",
        }
    }
}

impl std::fmt::Display for GuardRuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A violated rule with the values that violated it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleViolation {
    DuplicateOrder {
        count: usize,
        max_orders: usize,
        window_secs: i64,
    },
    PriceDeviation {
        order_price: Decimal,
        market_price: Decimal,
        deviation: Decimal,
        max_deviation: Decimal,
    },
    ExcessiveNotional {
        notional: Decimal,
        equity: Decimal,
        ratio: Decimal,
        max_ratio: Decimal,
    },
    FrequentCancel {
        count: usize,
        max_cancels: usize,
        window_secs: i64,
    },
    ConsecutiveFailures {
        failures: u32,
        max_failures: u32,
    },
    /// The rule's inputs were present but could not be evaluated
    Unevaluable { kind: GuardRuleKind, detail: String },
}

impl RuleViolation {
    pub fn kind(&self) -> GuardRuleKind {
        match self {
            RuleViolation::DuplicateOrder { .. } => GuardRuleKind::DuplicateOrder,
            RuleViolation::PriceDeviation { .. } => GuardRuleKind::PriceDeviation,
            RuleViolation::ExcessiveNotional { .. } => GuardRuleKind::ExcessiveNotional,
            RuleViolation::FrequentCancel { .. } => GuardRuleKind::FrequentCancel,
            RuleViolation::ConsecutiveFailures { .. } => GuardRuleKind::ConsecutiveFailures,
            RuleViolation::Unevaluable { kind, .. } => *kind,
        }
    }
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleViolation::DuplicateOrder {
                count,
                max_orders,
                window_secs,
            } => write!(
                f,
                "duplicate order burst: {} matching orders in {}s (max {})",
                count, window_secs, max_orders
            ),
            RuleViolation::PriceDeviation {
                order_price,
                market_price,
                deviation,
                max_deviation,
            } => write!(
                f,
                "price {} deviates {} from market {} (max {})",
                order_price,
                deviation.round_dp(6),
                market_price,
                max_deviation
            ),
            RuleViolation::ExcessiveNotional {
                notional,
                equity,
                ratio,
                max_ratio,
            } => write!(
                f,
                "notional {} is {} of equity {} (max {})",
                notional,
                ratio.round_dp(6),
                equity,
                max_ratio
            ),
            RuleViolation::FrequentCancel {
                count,
                max_cancels,
                window_secs,
            } => write!(
                f,
                "{} cancellations in {}s (max {})",
                count, window_secs, max_cancels
            ),
            RuleViolation::ConsecutiveFailures {
                failures,
                max_failures,
            } => write!(f, "{} consecutive order failures (max {})", failures, max_failures),
            RuleViolation::Unevaluable { kind, detail } => {
                write!(f, "{} could not be evaluated: {}", kind, detail)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardEventKind {
    /// Rules were violated and the strategy escalated
    Violation,
    /// A successful order outcome cleared the strategy
    Cleared,
}

/// Persisted record of a guard transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardEvent {
    pub event_id: String,
    pub kind: GuardEventKind,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub strategy_id: String,
    pub order_snapshot: Option<Order>,
    pub violated_rules: Vec<RuleViolation>,
    pub resulting_action: Option<GuardAction>,
    pub resulting_status: GuardMode,
    pub reason: String,
    pub event_hash: String,
}

impl LedgerRecord for GuardEvent {
    const FAMILY: &'static str = "guard_event";

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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Pass,
    ReduceOnly,
    Block,
}

impl From<GuardAction> for DecisionAction {
    fn from(action: GuardAction) -> Self {
        match action {
            GuardAction::ReduceOnly => DecisionAction::ReduceOnly,
            GuardAction::Block => DecisionAction::Block,
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub passed: bool,
    pub reason: String,
    pub action: DecisionAction,
    pub resulting_status: GuardMode,
    pub violated_rules: Vec<GuardRuleKind>,
}

impl Decision {
    fn pass(status: GuardMode) -> Self {
        Self {
            passed: true,
            reason: "all checks passed".to_string(),
            action: DecisionAction::Pass,
            resulting_status: status,
            violated_rules: Vec::new(),
        }
    }

    fn rejected(
        action: DecisionAction,
        status: GuardMode,
        reason: String,
        violated_rules: Vec<GuardRuleKind>,
    ) -> Self {
        Self {
            passed: false,
            reason,
            action,
            resulting_status: status,
            violated_rules,
        }
    }
}

#[derive(Debug, Clone)]
struct OrderHistoryEntry {
    symbol: String,
    side: OrderSide,
    at: DateTime<Utc>,
}

/// Rule inputs kept per strategy
#[derive(Debug, Default)]
struct StrategyBook {
    orders: VecDeque<OrderHistoryEntry>,
    cancels: VecDeque<DateTime<Utc>>,
    failures: u32,
}

impl StrategyBook {
    fn prune(&mut self, now: DateTime<Utc>, retention: Duration) {
        while self
            .orders
            .front()
            .is_some_and(|e| now.signed_duration_since(e.at) >= retention)
        {
            self.orders.pop_front();
        }
        while self
            .cancels
            .front()
            .is_some_and(|t| now.signed_duration_since(*t) >= retention)
        {
            self.cancels.pop_front();
        }
    }
}

#[derive(Default)]
struct GuardState {
    /// Only escalated strategies have an entry
    statuses: HashMap<String, GuardMode>,
    books: HashMap<String, StrategyBook>,
}

/// Per-strategy order admission guard
pub struct OrderAdmissionGuard {
    config: OrderGuardConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn EvidenceStore<GuardEvent>>,
    state: Mutex<GuardState>,
}

impl OrderAdmissionGuard {
    /// Create a guard, restoring escalated statuses from the ledger.
    pub fn open(
        config: OrderGuardConfig,
        ledger: Arc<dyn EvidenceStore<GuardEvent>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut state = GuardState::default();
        for event in ledger.load_all()? {
            match event.resulting_status {
                GuardMode::Normal => state.statuses.remove(&event.strategy_id),
                status => state.statuses.insert(event.strategy_id.clone(), status),
            };
        }
        for (strategy, status) in &state.statuses {
            warn!("Restored guard status {} for strategy {}", status, strategy);
        }

        Ok(Self {
            config,
            clock,
            ledger,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &OrderGuardConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, GuardState>> {
        self.state
            .lock()
            .map_err(|_| GuardrailError::Poisoned("order guard"))
    }

    fn retention(&self) -> Duration {
        Duration::seconds(self.config.history_retention_secs)
    }

    /// Decide whether `order` may be submitted.
    ///
    /// An `Err` (poisoned state, ledger failure) must be treated as a
    /// rejection by the caller.
    pub fn check_order(
        &self,
        order: &Order,
        market: &MarketSnapshot,
        account: &AccountSnapshot,
    ) -> Result<Decision> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let current = state
            .statuses
            .get(&order.strategy_id)
            .copied()
            .unwrap_or(GuardMode::Normal);
        match current {
            GuardMode::Blocked => {
                debug!(strategy = %order.strategy_id, "Order rejected: strategy blocked");
                return Ok(Decision::rejected(
                    DecisionAction::Block,
                    current,
                    format!("strategy {} is blocked", order.strategy_id),
                    Vec::new(),
                ));
            }
            GuardMode::ReduceOnly if !order.is_reducing() => {
                debug!(strategy = %order.strategy_id, "Order rejected: strategy reduce-only");
                return Ok(Decision::rejected(
                    DecisionAction::ReduceOnly,
                    current,
                    format!(
                        "strategy {} is reduce-only; {} orders are not admitted",
                        order.strategy_id, order.side
                    ),
                    Vec::new(),
                ));
            }
            GuardMode::ReduceOnly | GuardMode::Normal => {}
        }

        let book = state.books.entry(order.strategy_id.clone()).or_default();
        book.prune(now, self.retention());
        let violations = self.evaluate(order, market, account, book, now);

        if violations.is_empty() {
            book.orders.push_back(OrderHistoryEntry {
                symbol: order.symbol.clone(),
                side: order.side,
                at: now,
            });
            return Ok(Decision::pass(current));
        }

        let action = violations
            .iter()
            .map(|v| self.config.action_for(v.kind()))
            .max()
            .unwrap_or(GuardAction::Block);
        let resulting = current.max(action.resulting_mode());
        let kinds: Vec<GuardRuleKind> = violations.iter().map(|v| v.kind()).collect();
        let reason = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");

        let mut event = GuardEvent {
            event_id: format!("guard-{}", Uuid::new_v4()),
            kind: GuardEventKind::Violation,
            timestamp: self.clock.stamp(),
            strategy_id: order.strategy_id.clone(),
            order_snapshot: Some(order.clone()),
            violated_rules: violations,
            resulting_action: Some(action),
            resulting_status: resulting,
            reason: reason.clone(),
            event_hash: String::new(),
        };
        event.seal()?;

        if let Err(e) = self.ledger.append(&event) {
            error!(
                strategy = %order.strategy_id,
                "Failed to persist guard event, rejecting order: {}", e
            );
            return Err(e.into());
        }

        state.statuses.insert(order.strategy_id.clone(), resulting);
        warn!(
            strategy = %order.strategy_id,
            order_id = %order.order_id,
            status = %resulting,
            "Order rejected: {}", reason
        );

        Ok(Decision::rejected(action.into(), resulting, reason, kinds))
    }

    fn evaluate(
        &self,
        order: &Order,
        market: &MarketSnapshot,
        account: &AccountSnapshot,
        book: &StrategyBook,
        now: DateTime<Utc>,
    ) -> Vec<RuleViolation> {
        let mut violations = Vec::new();
        let cfg = &self.config;

        if cfg.duplicate_order.enabled {
            let window = Duration::seconds(cfg.duplicate_order.time_window_secs);
            let count = book
                .orders
                .iter()
                .filter(|e| e.symbol == order.symbol && e.side == order.side)
                .filter(|e| now.signed_duration_since(e.at) < window)
                .count();
            if count >= cfg.duplicate_order.max_orders {
                violations.push(RuleViolation::DuplicateOrder {
                    count,
                    max_orders: cfg.duplicate_order.max_orders,
                    window_secs: cfg.duplicate_order.time_window_secs,
                });
            }
        }

        if cfg.price_deviation.enabled && order.is_limit() {
            match (order.price, market.price(&order.symbol)) {
                (Some(price), Some(market_price)) => {
                    let deviation = price
                        .checked_sub(market_price)
                        .and_then(|diff| diff.abs().checked_div(market_price));
                    match deviation {
                        Some(deviation) if deviation > cfg.price_deviation.max_deviation => {
                            violations.push(RuleViolation::PriceDeviation {
                                order_price: price,
                                market_price,
                                deviation,
                                max_deviation: cfg.price_deviation.max_deviation,
                            });
                        }
                        Some(_) => {}
                        None => violations.push(RuleViolation::Unevaluable {
                            kind: GuardRuleKind::PriceDeviation,
                            detail: format!("deviation of {} from {} overflowed", price, market_price),
                        }),
                    }
                }
                (None, _) => violations.push(RuleViolation::Unevaluable {
                    kind: GuardRuleKind::PriceDeviation,
                    detail: "limit order without a price".to_string(),
                }),
                (Some(_), None) => {
                    info!(
                        symbol = %order.symbol,
                        "No market price, skipping price deviation check"
                    );
                }
            }
        }

        if cfg.excessive_notional.enabled {
            let reference = if order.is_limit() {
                order.price
            } else {
                market.price(&order.symbol)
            };
            match (reference, account.usable_equity()) {
                (Some(price), Some(equity)) => {
                    let notional = order.amount.checked_mul(price);
                    match notional.and_then(|n| n.checked_div(equity).map(|r| (n, r))) {
                        Some((notional, ratio)) if ratio > cfg.excessive_notional.max_ratio => {
                            violations.push(RuleViolation::ExcessiveNotional {
                                notional,
                                equity,
                                ratio,
                                max_ratio: cfg.excessive_notional.max_ratio,
                            });
                        }
                        Some(_) => {}
                        None => violations.push(RuleViolation::Unevaluable {
                            kind: GuardRuleKind::ExcessiveNotional,
                            detail: format!(
                                "{} x {} against equity {} overflowed",
                                order.amount, price, equity
                            ),
                        }),
                    }
                }
                (price, equity) => {
                    info!(
                        symbol = %order.symbol,
                        has_price = price.is_some(),
                        has_equity = equity.is_some(),
                        "Missing input, skipping notional check"
                    );
                }
            }
        }

        if cfg.frequent_cancel.enabled {
            let window = Duration::seconds(cfg.frequent_cancel.time_window_secs);
            let count = book
                .cancels
                .iter()
                .filter(|t| now.signed_duration_since(**t) < window)
                .count();
            if count >= cfg.frequent_cancel.max_cancels {
                violations.push(RuleViolation::FrequentCancel {
                    count,
                    max_cancels: cfg.frequent_cancel.max_cancels,
                    window_secs: cfg.frequent_cancel.time_window_secs,
                });
            }
        }

        if cfg.consecutive_failures.enabled
            && book.failures >= cfg.consecutive_failures.max_failures
        {
            violations.push(RuleViolation::ConsecutiveFailures {
                failures: book.failures,
                max_failures: cfg.consecutive_failures.max_failures,
            });
        }

        violations
    }

    /// Report the broker outcome of a submitted order.
    ///
    /// Success clears an escalated status (persisted first) and resets the
    /// failure counter; failure feeds the consecutive-failure rule.
    pub fn record_order_result(&self, strategy_id: &str, success: bool) -> Result<()> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let book = state.books.entry(strategy_id.to_string()).or_default();
        book.prune(now, self.retention());

        if !success {
            book.failures = book.failures.saturating_add(1);
            debug!(strategy = %strategy_id, failures = book.failures, "Order failure recorded");
            return Ok(());
        }

        if let Some(previous) = state.statuses.get(strategy_id).copied() {
            let mut event = GuardEvent {
                event_id: format!("guard-{}", Uuid::new_v4()),
                kind: GuardEventKind::Cleared,
                timestamp: self.clock.stamp(),
                strategy_id: strategy_id.to_string(),
                order_snapshot: None,
                violated_rules: Vec::new(),
                resulting_action: None,
                resulting_status: GuardMode::Normal,
                reason: format!("successful order outcome cleared {} status", previous),
                event_hash: String::new(),
            };
            event.seal()?;
            if let Err(e) = self.ledger.append(&event) {
                error!(
                    strategy = %strategy_id,
                    "Failed to persist guard recovery, keeping {} status: {}", previous, e
                );
                return Err(e.into());
            }
            state.statuses.remove(strategy_id);
            info!(strategy = %strategy_id, "Guard status {} cleared after successful order", previous);
        }

        book.failures = 0;
        Ok(())
    }

    /// Record an order cancellation for `strategy_id`.
    pub fn record_cancel(&self, strategy_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let book = guard.books.entry(strategy_id.to_string()).or_default();
        book.prune(now, self.retention());
        book.cancels.push_back(now);
        Ok(())
    }

    pub fn status(&self, strategy_id: &str) -> Result<GuardMode> {
        Ok(self
            .lock()?
            .statuses
            .get(strategy_id)
            .copied()
            .unwrap_or(GuardMode::Normal))
    }

    /// Every escalated strategy
    pub fn statuses(&self) -> Result<HashMap<String, GuardMode>> {
        Ok(self.lock()?.statuses.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::OrderSide;
    use crate::persistence::MemoryLedger;
    use rust_decimal_macros::dec;

    fn test_config() -> OrderGuardConfig {
        OrderGuardConfig {
            duplicate_order: DuplicateOrderRule {
                enabled: true,
                max_orders: 2,
                time_window_secs: 10,
                action: GuardAction::Block,
            },
            price_deviation: PriceDeviationRule {
                enabled: true,
                max_deviation: dec!(0.05),
                action: GuardAction::Block,
            },
            excessive_notional: NotionalRule {
                enabled: true,
                max_ratio: dec!(0.2),
                action: GuardAction::ReduceOnly,
            },
            frequent_cancel: CancelFrequencyRule {
                enabled: true,
                max_cancels: 3,
                time_window_secs: 60,
                action: GuardAction::ReduceOnly,
            },
            consecutive_failures: ConsecutiveFailureRule {
                enabled: true,
                max_failures: 3,
                action: GuardAction::Block,
            },
            history_retention_secs: 3600,
        }
    }

    struct Fixture {
        guard: OrderAdmissionGuard,
        clock: Arc<ManualClock>,
        ledger: Arc<MemoryLedger<GuardEvent>>,
    }

    fn fixture(config: OrderGuardConfig) -> Fixture {
        let clock = Arc::new(ManualClock::at_epoch());
        let ledger = Arc::new(MemoryLedger::new());
        let guard = OrderAdmissionGuard::open(config, ledger.clone(), clock.clone()).unwrap();
        Fixture {
            guard,
            clock,
            ledger,
        }
    }

    fn market() -> MarketSnapshot {
        MarketSnapshot::new().with_price("BTC-USDT", dec!(100))
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot::with_equity(dec!(10000))
    }

    fn buy(price: rust_decimal::Decimal) -> Order {
        Order::limit("alpha", "BTC-USDT", OrderSide::Buy, dec!(1), price)
    }

    fn sell(price: rust_decimal::Decimal) -> Order {
        Order::limit("alpha", "BTC-USDT", OrderSide::Sell, dec!(1), price)
    }

    #[test]
    fn test_clean_order_passes() {
        let f = fixture(test_config());
        let decision = f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap();
        assert!(decision.passed);
        assert_eq!(decision.action, DecisionAction::Pass);
        assert_eq!(decision.resulting_status, GuardMode::Normal);
        assert!(f.ledger.is_empty());
    }

    #[test]
    fn test_duplicate_burst_rejects_third_order_in_window() {
        let f = fixture(test_config());
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);

        f.clock.advance_secs(5);
        let decision = f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap();
        assert!(!decision.passed);
        assert_eq!(decision.violated_rules, vec![GuardRuleKind::DuplicateOrder]);
        assert_eq!(decision.action, DecisionAction::Block);
        assert!(decision.reason.contains("duplicate order burst"));
    }

    #[test]
    fn test_duplicate_window_is_boundary_exclusive() {
        let f = fixture(test_config());
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);

        // Entries exactly one window old no longer count
        f.clock.advance_secs(10);
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);

        f.clock.advance_secs(1);
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);
    }

    #[test]
    fn test_duplicate_rule_keys_on_symbol_and_side() {
        let f = fixture(test_config());
        f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap();
        f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap();

        assert!(f.guard.check_order(&sell(dec!(100)), &market(), &account()).unwrap().passed);
        let other = Order::limit("alpha", "ETH-USDT", OrderSide::Buy, dec!(1), dec!(10));
        let mkt = market().with_price("ETH-USDT", dec!(10));
        assert!(f.guard.check_order(&other, &mkt, &account()).unwrap().passed);
    }

    #[test]
    fn test_block_persists_until_successful_result() {
        let f = fixture(test_config());
        let decision = f.guard.check_order(&buy(dec!(120)), &market(), &account()).unwrap();
        assert!(!decision.passed);
        assert_eq!(decision.resulting_status, GuardMode::Blocked);

        // Even clean sells are refused now
        for _ in 0..3 {
            let d = f.guard.check_order(&sell(dec!(100)), &market(), &account()).unwrap();
            assert!(!d.passed);
            assert_eq!(d.action, DecisionAction::Block);
        }

        f.guard.record_order_result("alpha", true).unwrap();
        assert_eq!(f.guard.status("alpha").unwrap(), GuardMode::Normal);
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);

        let events = f.ledger.load_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, GuardEventKind::Violation);
        assert_eq!(events[1].kind, GuardEventKind::Cleared);
    }

    #[test]
    fn test_price_deviation_skipped_without_market_price() {
        let f = fixture(test_config());
        let decision = f
            .guard
            .check_order(&buy(dec!(500)), &MarketSnapshot::new(), &account())
            .unwrap();
        assert!(decision.passed);
    }

    #[test]
    fn test_price_deviation_boundary() {
        let f = fixture(test_config());
        // Exactly 5% is allowed
        assert!(f.guard.check_order(&buy(dec!(105)), &market(), &account()).unwrap().passed);

        let decision = f.guard.check_order(&sell(dec!(94)), &market(), &account()).unwrap();
        assert!(!decision.passed);
        assert_eq!(decision.violated_rules, vec![GuardRuleKind::PriceDeviation]);
    }

    #[test]
    fn test_market_orders_skip_price_deviation() {
        let f = fixture(test_config());
        let order = Order::market("alpha", "BTC-USDT", OrderSide::Buy, dec!(1));
        assert!(f.guard.check_order(&order, &market(), &account()).unwrap().passed);
    }

    #[test]
    fn test_price_deviation_overflow_fails_closed() {
        let mut config = test_config();
        config.excessive_notional.enabled = false;
        let f = fixture(config);
        let mkt = MarketSnapshot::new().with_price("BTC-USDT", dec!(-1));

        let decision = f
            .guard
            .check_order(&buy(rust_decimal::Decimal::MAX), &mkt, &account())
            .unwrap();
        assert!(!decision.passed);
        assert_eq!(decision.violated_rules, vec![GuardRuleKind::PriceDeviation]);
        assert!(decision.reason.contains("could not be evaluated"));
    }

    #[test]
    fn test_excessive_notional_escalates_reduce_only() {
        let f = fixture(test_config());
        let big = Order::limit("alpha", "BTC-USDT", OrderSide::Buy, dec!(30), dec!(100));
        let decision = f.guard.check_order(&big, &market(), &account()).unwrap();
        assert!(!decision.passed);
        assert_eq!(decision.action, DecisionAction::ReduceOnly);
        assert_eq!(decision.resulting_status, GuardMode::ReduceOnly);

        // Reduce-only admits sells, refuses buys without evaluating rules
        assert!(f.guard.check_order(&sell(dec!(100)), &market(), &account()).unwrap().passed);
        let d = f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap();
        assert!(!d.passed);
        assert!(d.violated_rules.is_empty());
        assert_eq!(f.ledger.len(), 1);
    }

    #[test]
    fn test_notional_skipped_without_equity() {
        let f = fixture(test_config());
        let big = Order::limit("alpha", "BTC-USDT", OrderSide::Buy, dec!(30), dec!(100));
        let decision = f
            .guard
            .check_order(&big, &market(), &AccountSnapshot::default())
            .unwrap();
        assert!(decision.passed);
    }

    #[test]
    fn test_most_severe_action_wins() {
        let f = fixture(test_config());
        // Notional (reduce_only) and price deviation (block) both violated
        let order = Order::limit("alpha", "BTC-USDT", OrderSide::Buy, dec!(30), dec!(150));
        let decision = f.guard.check_order(&order, &market(), &account()).unwrap();
        assert_eq!(decision.action, DecisionAction::Block);
        assert_eq!(decision.resulting_status, GuardMode::Blocked);
        assert_eq!(decision.violated_rules.len(), 2);
        assert!(decision.reason.contains("deviates"));
        assert!(decision.reason.contains("notional"));
    }

    #[test]
    fn test_frequent_cancellations() {
        let f = fixture(test_config());
        for _ in 0..3 {
            f.guard.record_cancel("alpha").unwrap();
        }
        let decision = f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap();
        assert_eq!(decision.violated_rules, vec![GuardRuleKind::FrequentCancel]);

        // Other strategies are unaffected
        let other = Order::limit("beta", "BTC-USDT", OrderSide::Buy, dec!(1), dec!(100));
        assert!(f.guard.check_order(&other, &market(), &account()).unwrap().passed);
    }

    #[test]
    fn test_cancellations_age_out() {
        let f = fixture(test_config());
        for _ in 0..3 {
            f.guard.record_cancel("alpha").unwrap();
        }
        f.clock.advance_secs(61);
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);
    }

    #[test]
    fn test_consecutive_failures_and_reset() {
        let f = fixture(test_config());
        for _ in 0..2 {
            f.guard.record_order_result("alpha", false).unwrap();
        }
        assert!(f.guard.check_order(&buy(dec!(100)), &market(), &account()).unwrap().passed);

        f.guard.record_order_result("alpha", false).unwrap();
        let decision = f.guard.check_order(&sell(dec!(100)), &market(), &account()).unwrap();
        assert_eq!(decision.violated_rules, vec![GuardRuleKind::ConsecutiveFailures]);

        f.guard.record_order_result("alpha", true).unwrap();
        assert!(f.guard.check_order(&sell(dec!(100)), &market(), &account()).unwrap().passed);
    }

    #[test]
    fn test_disabled_rule_is_ignored() {
        let mut config = test_config();
        config.price_deviation.enabled = false;
        let f = fixture(config);
        assert!(f.guard.check_order(&buy(dec!(150)), &market(), &account()).unwrap().passed);
    }

    #[test]
    fn test_ledger_failure_rejects_without_escalating() {
        let f = fixture(test_config());
        f.ledger.set_fail_writes(true);

        let result = f.guard.check_order(&buy(dec!(150)), &market(), &account());
        assert!(matches!(result, Err(GuardrailError::Storage(_))));
        assert_eq!(f.guard.status("alpha").unwrap(), GuardMode::Normal);

        f.ledger.set_fail_writes(false);
        let decision = f.guard.check_order(&buy(dec!(150)), &market(), &account()).unwrap();
        assert_eq!(decision.resulting_status, GuardMode::Blocked);

        // A failed clear keeps the strategy blocked
        f.ledger.set_fail_writes(true);
        assert!(f.guard.record_order_result("alpha", true).is_err());
        assert_eq!(f.guard.status("alpha").unwrap(), GuardMode::Blocked);
    }

    #[test]
    fn test_guard_event_is_sealed_and_stable() {
        let f = fixture(test_config());
        f.guard.check_order(&buy(dec!(150)), &market(), &account()).unwrap();

        let event = f.ledger.load_all().unwrap().remove(0);
        assert!(event.verify());
        assert_eq!(event.resulting_action, Some(GuardAction::Block));
        assert!(event.order_snapshot.is_some());

        let json = serde_json::to_string(&event).unwrap();
        let mut reloaded: GuardEvent = serde_json::from_str(&json).unwrap();
        reloaded.seal().unwrap();
        assert_eq!(serde_json::to_string(&reloaded).unwrap(), json);
    }

    #[test]
    fn test_restart_restores_escalated_status() {
        let clock = Arc::new(ManualClock::at_epoch());
        let ledger = Arc::new(MemoryLedger::<GuardEvent>::new());
        {
            let guard =
                OrderAdmissionGuard::open(test_config(), ledger.clone(), clock.clone()).unwrap();
            guard.check_order(&buy(dec!(150)), &market(), &account()).unwrap();
            let beta = Order::limit("beta", "BTC-USDT", OrderSide::Buy, dec!(1), dec!(150));
            guard.check_order(&beta, &market(), &account()).unwrap();
            guard.record_order_result("beta", true).unwrap();
        }

        let guard = OrderAdmissionGuard::open(test_config(), ledger, clock).unwrap();
        assert_eq!(guard.status("alpha").unwrap(), GuardMode::Blocked);
        assert_eq!(guard.status("beta").unwrap(), GuardMode::Normal);
        assert_eq!(guard.statuses().unwrap().len(), 1);
    }
}
