//! Connectivity Supervisor (SAFE_STOP protocol)
//!
//! Tracks heartbeats from the market-data, account and order channels. A
//! single poll loop checks them on a fixed interval: any stale channel moves
//! the system into SAFE_STOP, and only a poll that finds every channel healthy
//! brings it back to NORMAL. Each SAFE_STOP episode is persisted as a
//! [`BlockingIssue`] that is closed (not replaced) when the episode ends.
//!
//! While in SAFE_STOP the execution layer must refuse new opening orders and
//! may only reduce positions or run reconciliation reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::ConnectivityMode;
use crate::error::{Result, StorageError};
use crate::persistence::{timestamp, EvidenceStore, LedgerRecord};

/// Configuration for the connectivity supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// Interval between heartbeat polls (default: 1000ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Market data heartbeat timeout (default: 10s)
    #[serde(default = "default_market_data_timeout_secs")]
    pub market_data_timeout_secs: u64,
    /// Account feed heartbeat timeout (default: 30s)
    #[serde(default = "default_account_timeout_secs")]
    pub account_timeout_secs: u64,
    /// Order channel heartbeat timeout (default: 30s)
    #[serde(default = "default_orders_timeout_secs")]
    pub orders_timeout_secs: u64,
    /// First reconnect delay (default: 500ms)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Reconnect delay cap (default: 60s)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_market_data_timeout_secs() -> u64 {
    10
}

fn default_account_timeout_secs() -> u64 {
    30
}

fn default_orders_timeout_secs() -> u64 {
    30
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            market_data_timeout_secs: default_market_data_timeout_secs(),
            account_timeout_secs: default_account_timeout_secs(),
            orders_timeout_secs: default_orders_timeout_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ConnectivityConfig {
    pub fn timeout(&self, channel: Channel) -> chrono::Duration {
        let secs = match channel {
            Channel::MarketData => self.market_data_timeout_secs,
            Channel::Account => self.account_timeout_secs,
            Channel::Orders => self.orders_timeout_secs,
        };
        chrono::Duration::seconds(secs as i64)
    }

    /// `initial_backoff * 2^min(retry_count, 10)`, capped at `max_backoff`.
    pub fn reconnect_delay(&self, retry_count: u32) -> Duration {
        let delay = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry_count.min(10)));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.poll_interval_ms == 0 {
            errors.push("connectivity.poll_interval_ms must be positive".to_string());
        }
        for channel in Channel::ALL {
            if self.timeout(channel) <= chrono::Duration::zero() {
                errors.push(format!("connectivity timeout for {} must be positive", channel));
            }
        }
        if self.initial_backoff_ms == 0 {
            errors.push("connectivity.initial_backoff_ms must be positive".to_string());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            errors.push(
                "connectivity.max_backoff_ms must not be below initial_backoff_ms".to_string(),
            );
        }
        errors
    }
}

/// Monitored heartbeat channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    MarketData,
    Account,
    Orders,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::MarketData, Channel::Account, Channel::Orders];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::MarketData => "market_data",
            Channel::Account => "account",
            Channel::Orders => "orders",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Heartbeat bookkeeping for one channel
#[derive(Debug, Clone)]
struct HeartbeatChannel {
    /// `None` until the first heartbeat after resuming SAFE_STOP
    last_seen_at: Option<DateTime<Utc>>,
    timed_out: bool,
    consecutive_timeouts: u32,
    retry_count: u32,
}

/// Current connectivity state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub mode: ConnectivityMode,
    pub reason: Option<String>,
    #[serde(with = "timestamp")]
    pub changed_at: DateTime<Utc>,
}

/// Persisted record of one SAFE_STOP episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingIssue {
    pub issue_id: String,
    pub reason: String,
    pub channels: Vec<Channel>,
    #[serde(with = "timestamp")]
    pub opened_at: DateTime<Utc>,
    #[serde(with = "timestamp::option")]
    pub cleared_at: Option<DateTime<Utc>>,
    pub event_hash: String,
}

impl LedgerRecord for BlockingIssue {
    const FAMILY: &'static str = "blocking_issue";

    fn record_id(&self) -> &str {
        &self.issue_id
    }

    fn event_hash(&self) -> &str {
        &self.event_hash
    }

    fn set_event_hash(&mut self, hash: String) {
        self.event_hash = hash;
    }

    fn is_open(&self) -> bool {
        self.cleared_at.is_none()
    }
}

/// Per-channel view for ops tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: Channel,
    #[serde(with = "timestamp::option")]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_seen_age_ms: Option<i64>,
    pub timed_out: bool,
    pub consecutive_timeouts: u32,
    pub retry_count: u32,
    pub timeout_secs: i64,
}

/// Status snapshot written after every poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub state: ConnectivityState,
    pub ledger_fault: bool,
    pub channels: Vec<ChannelStatus>,
}

struct SupervisorState {
    channels: BTreeMap<Channel, HeartbeatChannel>,
    state: ConnectivityState,
    open_issue: Option<BlockingIssue>,
}

/// Heartbeat supervisor driving the SAFE_STOP state machine
pub struct ConnectivitySupervisor {
    config: ConnectivityConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn EvidenceStore<BlockingIssue>>,
    inner: Mutex<SupervisorState>,
    /// Mirrors `state.mode` for lock-free readers
    safe_stop: AtomicBool,
    /// Set while an escalation could not be persisted
    ledger_fault: AtomicBool,
    running: Arc<AtomicBool>,
}

impl ConnectivitySupervisor {
    /// Create a supervisor, resuming SAFE_STOP if the ledger holds an
    /// uncleared blocking issue.
    pub fn open(
        config: ConnectivityConfig,
        ledger: Arc<dyn EvidenceStore<BlockingIssue>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let now = clock.stamp();
        let open_issue = ledger.load_all()?.into_iter().filter(|i| i.is_open()).last();

        let state = match &open_issue {
            Some(issue) => {
                warn!(
                    issue_id = %issue.issue_id,
                    "Resuming SAFE_STOP from previous session: {}", issue.reason
                );
                ConnectivityState {
                    mode: ConnectivityMode::SafeStop,
                    reason: Some(issue.reason.clone()),
                    changed_at: issue.opened_at,
                }
            }
            None => ConnectivityState {
                mode: ConnectivityMode::Normal,
                reason: None,
                changed_at: now,
            },
        };

        // A resumed SAFE_STOP must see a real heartbeat on every channel
        // before it can clear; a fresh start gets one timeout of grace.
        let last_seen_at = match state.mode {
            ConnectivityMode::SafeStop => None,
            ConnectivityMode::Normal => Some(now),
        };
        let channels = Channel::ALL
            .into_iter()
            .map(|channel| {
                (
                    channel,
                    HeartbeatChannel {
                        last_seen_at,
                        timed_out: false,
                        consecutive_timeouts: 0,
                        retry_count: 0,
                    },
                )
            })
            .collect();

        let safe_stop = state.mode == ConnectivityMode::SafeStop;
        Ok(Self {
            config,
            clock,
            ledger,
            inner: Mutex::new(SupervisorState {
                channels,
                state,
                open_issue,
            }),
            safe_stop: AtomicBool::new(safe_stop),
            ledger_fault: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    // Heartbeat timestamps stay consistent even if a holder panicked, so a
    // poisoned lock is recovered rather than propagated.
    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a heartbeat from `channel`.
    pub fn update_heartbeat(&self, channel: Channel) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if let Some(hb) = inner.channels.get_mut(&channel) {
            if hb.timed_out {
                info!("Channel {} heartbeat resumed", channel);
            }
            hb.last_seen_at = Some(now);
            hb.timed_out = false;
            hb.consecutive_timeouts = 0;
            hb.retry_count = 0;
        }
    }

    /// True while SAFE_STOP is active, or while an escalation failed to persist.
    pub fn is_safe_stop(&self) -> bool {
        self.safe_stop.load(Ordering::SeqCst) || self.ledger_fault.load(Ordering::SeqCst)
    }

    pub fn has_ledger_fault(&self) -> bool {
        self.ledger_fault.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectivityState {
        self.lock().state.clone()
    }

    /// Delay before reconnect attempt number `retry_count`.
    pub fn reconnect_delay(&self, retry_count: u32) -> Duration {
        self.config.reconnect_delay(retry_count)
    }

    /// Count a reconnect attempt on `channel` and return how long to wait
    /// before making it.
    pub fn record_reconnect_attempt(&self, channel: Channel) -> Duration {
        let mut inner = self.lock();
        let Some(hb) = inner.channels.get_mut(&channel) else {
            return self.config.reconnect_delay(0);
        };
        let delay = self.config.reconnect_delay(hb.retry_count);
        hb.retry_count = hb.retry_count.saturating_add(1);
        debug!(
            "Reconnect attempt #{} for {} in {:?}",
            hb.retry_count, channel, delay
        );
        delay
    }

    /// Run one heartbeat check and drive the state machine.
    ///
    /// Returns the mode after the poll. A ledger failure leaves the mode
    /// unchanged and is returned as an error.
    pub fn poll(&self) -> Result<ConnectivityMode> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let mut stale = Vec::new();
        for (channel, hb) in inner.channels.iter_mut() {
            let age = hb.last_seen_at.map(|seen| now.signed_duration_since(seen));
            let timeout = self.config.timeout(*channel);
            if age.map_or(true, |age| age > timeout) {
                hb.timed_out = true;
                hb.consecutive_timeouts = hb.consecutive_timeouts.saturating_add(1);
                stale.push((*channel, age.map(|a| a.num_seconds()), timeout.num_seconds()));
            } else {
                hb.timed_out = false;
            }
        }

        let outcome = match (inner.state.mode, stale.is_empty()) {
            (ConnectivityMode::Normal, false) => self.enter_safe_stop(&mut inner, &stale),
            (ConnectivityMode::SafeStop, true) => self.leave_safe_stop(&mut inner),
            (mode, _) => Ok(mode),
        };

        // Healthy and NORMAL with an unpersisted SAFE_STOP behind us: there is
        // nothing left to record, so a successful status write lifts the fault.
        let lift_fault = matches!(outcome, Ok(ConnectivityMode::Normal))
            && stale.is_empty()
            && self.has_ledger_fault();
        if lift_fault {
            self.ledger_fault.store(false, Ordering::SeqCst);
        }
        match self.write_status(&inner, now) {
            Ok(()) if lift_fault => {
                info!("Ledger writable and all channels healthy, fail-closed SAFE_STOP lifted");
            }
            Ok(()) => {}
            Err(e) => {
                if lift_fault {
                    self.ledger_fault.store(true, Ordering::SeqCst);
                }
                warn!("Failed to write connectivity status snapshot: {}", e);
            }
        }
        outcome
    }

    fn enter_safe_stop(
        &self,
        inner: &mut SupervisorState,
        stale: &[(Channel, Option<i64>, i64)],
    ) -> Result<ConnectivityMode> {
        let reason = format!(
            "heartbeat timeout: {}",
            stale
                .iter()
                .map(|(channel, age, timeout)| match age {
                    Some(age) => format!(
                        "{} (last seen {}s ago, timeout {}s)",
                        channel, age, timeout
                    ),
                    None => format!("{} (no heartbeat since restart)", channel),
                })
                .collect::<Vec<_>>()
                .join(", ")
        );

        let now = self.clock.stamp();
        let mut issue = BlockingIssue {
            issue_id: format!("conn-{}", Uuid::new_v4()),
            reason: reason.clone(),
            channels: stale.iter().map(|(channel, _, _)| *channel).collect(),
            opened_at: now,
            cleared_at: None,
            event_hash: String::new(),
        };
        issue.seal()?;

        if let Err(e) = self.ledger.append(&issue) {
            self.ledger_fault.store(true, Ordering::SeqCst);
            error!("Failed to persist SAFE_STOP blocking issue, failing closed: {}", e);
            return Err(e.into());
        }
        self.ledger_fault.store(false, Ordering::SeqCst);

        inner.state = ConnectivityState {
            mode: ConnectivityMode::SafeStop,
            reason: Some(reason.clone()),
            changed_at: now,
        };
        inner.open_issue = Some(issue);
        self.safe_stop.store(true, Ordering::SeqCst);

        warn!("SAFE_STOP entered: {}", reason);
        Ok(ConnectivityMode::SafeStop)
    }

    fn leave_safe_stop(&self, inner: &mut SupervisorState) -> Result<ConnectivityMode> {
        let now = self.clock.stamp();
        if let Some(issue) = &inner.open_issue {
            let mut closed = issue.clone();
            closed.cleared_at = Some(now);
            closed.seal()?;
            if let Err(e) = self.ledger.append(&closed) {
                error!(
                    issue_id = %closed.issue_id,
                    "Failed to clear blocking issue, staying in SAFE_STOP: {}", e
                );
                return Err(e.into());
            }
        }
        self.ledger_fault.store(false, Ordering::SeqCst);

        inner.state = ConnectivityState {
            mode: ConnectivityMode::Normal,
            reason: None,
            changed_at: now,
        };
        inner.open_issue = None;
        self.safe_stop.store(false, Ordering::SeqCst);

        info!("All channels healthy, SAFE_STOP cleared");
        Ok(ConnectivityMode::Normal)
    }

    fn build_status(&self, inner: &SupervisorState, now: DateTime<Utc>) -> ConnectivityStatus {
        ConnectivityStatus {
            state: inner.state.clone(),
            ledger_fault: self.has_ledger_fault(),
            channels: inner
                .channels
                .iter()
                .map(|(channel, hb)| ChannelStatus {
                    channel: *channel,
                    last_seen_at: hb.last_seen_at,
                    last_seen_age_ms: hb
                        .last_seen_at
                        .map(|seen| now.signed_duration_since(seen).num_milliseconds()),
                    timed_out: hb.timed_out,
                    consecutive_timeouts: hb.consecutive_timeouts,
                    retry_count: hb.retry_count,
                    timeout_secs: self.config.timeout(*channel).num_seconds(),
                })
                .collect(),
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        let now = self.clock.now();
        let inner = self.lock();
        self.build_status(&inner, now)
    }

    fn write_status(
        &self,
        inner: &SupervisorState,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), StorageError> {
        let status = self.build_status(inner, now);
        let value = serde_json::to_value(&status)?;
        self.ledger.snapshot(&value)
    }

    /// Start the background poll loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        info!("Connectivity supervisor started (poll every {:?})", interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            while self.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(e) = self.poll() {
                    error!("Connectivity poll failed: {}", e);
                }
            }

            info!("Connectivity supervisor stopped");
        })
    }

    /// Stop the background poll loop after its current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
