//! Supervisor Layer for Connectivity Monitoring
//!
//! This module provides the connectivity axis of the guardrails:
//! - Heartbeat tracking for market data, account and order channels
//! - SAFE_STOP state machine with persisted blocking issues
//! - Reconnect backoff for the connection-management code

pub mod connectivity;

pub use connectivity::{
    BlockingIssue, Channel, ChannelStatus, ConnectivityConfig, ConnectivityState,
    ConnectivityStatus, ConnectivitySupervisor,
};
