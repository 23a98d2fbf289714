//! Restart behaviour against file-backed ledgers: every monitor must resume
//! the conservative state it had before the process went away.

use bulwark::coordination::{
    BlackSwanConfig, DisconnectionTrigger, DrawdownTrigger, DriftTrigger, ReconciliationTrigger,
};
use bulwark::persistence::EvidenceStore;
use bulwark::strategy::{DegradationAction, DegradationConfig};
use bulwark::supervisor::ConnectivityStatus;
use bulwark::*;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn black_swan_config() -> BlackSwanConfig {
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
            max_asset_diff_ratio: None,
            action: RiskAction::ReduceOnly,
        },
        disconnection: DisconnectionTrigger {
            max_disconnections: 3,
            time_window_secs: 300,
            action: RiskAction::ReduceOnly,
        },
    }
}

fn degradation_config() -> DegradationConfig {
    DegradationConfig {
        window_size: 20,
        initial_capital: dec!(5000),
        min_return: Some(dec!(-0.05)),
        max_drawdown: Some(dec!(0.15)),
        min_winrate: None,
        max_turnover: None,
        severe_drawdown_multiplier: dec!(1.5),
        single_violation_action: DegradationAction::Blocked,
        multi_violation_action: DegradationAction::PaperDowngrade,
    }
}

fn risk_manager(dir: &std::path::Path, clock: Arc<ManualClock>) -> CatastrophicRiskManager {
    let ledger = EvidenceLedger::<BlackSwanEvent>::open(dir).unwrap();
    CatastrophicRiskManager::open(black_swan_config(), Arc::new(ledger), clock).unwrap()
}

#[tokio::test]
async fn black_swan_mode_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_epoch());

    {
        let manager = risk_manager(dir.path(), clock.clone());
        manager.check_drift(DriftStatus::ReduceOnly).await.unwrap();
        clock.advance_secs(30);
        manager.check_drawdown(dec!(0.25)).await.unwrap();
        assert_eq!(manager.get_current_status().await, SystemRiskMode::Liquidate);
    }

    let manager = risk_manager(dir.path(), clock.clone());
    assert_eq!(manager.get_current_status().await, SystemRiskMode::Liquidate);

    let history = manager.history().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|e| e.is_active()).count(), 1);

    manager.recover("positions flattened").await.unwrap().unwrap();
    drop(manager);

    let manager = risk_manager(dir.path(), clock);
    assert_eq!(manager.get_current_status().await, SystemRiskMode::Normal);
    assert!(manager.active_event().await.is_none());
}

#[test]
fn safe_stop_survives_restart_and_clears_same_issue() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_epoch());
    let open = |clock: Arc<ManualClock>| {
        let ledger = EvidenceLedger::<BlockingIssue>::open(dir.path()).unwrap();
        ConnectivitySupervisor::open(ConnectivityConfig::default(), Arc::new(ledger), clock)
            .unwrap()
    };

    {
        let supervisor = open(clock.clone());
        clock.advance_secs(31);
        supervisor.update_heartbeat(Channel::MarketData);
        assert_eq!(supervisor.poll().unwrap(), ConnectivityMode::SafeStop);
    }

    let supervisor = open(clock.clone());
    assert!(supervisor.is_safe_stop());
    for channel in Channel::ALL {
        supervisor.update_heartbeat(channel);
    }
    assert_eq!(supervisor.poll().unwrap(), ConnectivityMode::Normal);

    let ledger = EvidenceLedger::<BlockingIssue>::open(dir.path()).unwrap();
    let issues = ledger.load_all().unwrap();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].cleared_at.is_some());
    assert_eq!(
        issues[0].channels,
        vec![Channel::Account, Channel::Orders]
    );

    // Ops tooling reads the latest status snapshot
    let snapshot = ledger.read_snapshot().unwrap().unwrap();
    let status: ConnectivityStatus = serde_json::from_value(snapshot).unwrap();
    assert_eq!(status.state.mode, ConnectivityMode::Normal);
    assert_eq!(status.channels.len(), 3);
}

/// A restart must not count as a heartbeat: the resumed SAFE_STOP holds until
/// every channel reports again.
#[test]
fn resumed_safe_stop_holds_without_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_epoch());
    let open = |clock: Arc<ManualClock>| {
        let ledger = EvidenceLedger::<BlockingIssue>::open(dir.path()).unwrap();
        ConnectivitySupervisor::open(ConnectivityConfig::default(), Arc::new(ledger), clock)
            .unwrap()
    };

    {
        let supervisor = open(clock.clone());
        clock.advance_secs(31);
        assert_eq!(supervisor.poll().unwrap(), ConnectivityMode::SafeStop);
    }

    let supervisor = open(clock.clone());
    for _ in 0..3 {
        clock.advance_secs(1);
        assert_eq!(supervisor.poll().unwrap(), ConnectivityMode::SafeStop);
    }
    let ledger = EvidenceLedger::<BlockingIssue>::open(dir.path()).unwrap();
    assert!(ledger.load_all().unwrap()[0].is_open());
}

#[test]
fn guard_and_degradation_status_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_epoch());
    let market = MarketSnapshot::new().with_price("600519.SH", dec!(1500));
    let account = AccountSnapshot::with_equity(dec!(1000000));

    {
        let guard = OrderAdmissionGuard::open(
            OrderGuardConfig::default(),
            Arc::new(EvidenceLedger::<GuardEvent>::open(dir.path()).unwrap()),
            clock.clone(),
        )
        .unwrap();
        let order = Order::limit("mom-01", "600519.SH", OrderSide::Buy, dec!(100), dec!(1700));
        let decision = guard.check_order(&order, &market, &account).unwrap();
        assert!(!decision.passed);

        let monitor = StrategyDegradationMonitor::open(
            "mom-01",
            degradation_config(),
            Arc::new(EvidenceLedger::<DegradationEvent>::open(dir.path()).unwrap()),
            clock.clone(),
        )
        .unwrap();
        for n in 0..25 {
            clock.advance_secs(60);
            let pnl = if n < 15 { dec!(50) } else { dec!(-100) };
            let trade = ClosedTrade::new(format!("t{n}"), "600519.SH", pnl, dec!(1000), clock.stamp());
            monitor.record_trade(trade).unwrap();
        }
        assert_eq!(monitor.get_status().unwrap(), StrategyStatus::Paper);
    }

    let guard = OrderAdmissionGuard::open(
        OrderGuardConfig::default(),
        Arc::new(EvidenceLedger::<GuardEvent>::open(dir.path()).unwrap()),
        clock.clone(),
    )
    .unwrap();
    assert_eq!(guard.status("mom-01").unwrap(), GuardMode::Blocked);

    let monitor = StrategyDegradationMonitor::open(
        "mom-01",
        degradation_config(),
        Arc::new(EvidenceLedger::<DegradationEvent>::open(dir.path()).unwrap()),
        clock,
    )
    .unwrap();
    assert_eq!(monitor.get_status().unwrap(), StrategyStatus::Paper);
}

#[tokio::test]
async fn tampered_record_is_detected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_epoch());
    {
        let manager = risk_manager(dir.path(), clock.clone());
        manager
            .manual_trigger(RiskAction::Liquidate, "exchange halted")
            .await
            .unwrap();
    }

    let ledger = EvidenceLedger::<BlackSwanEvent>::open(dir.path()).unwrap();
    let path = ledger.log_path().to_path_buf();
    let body = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, body.replace("\"liquidate\"", "\"reduce_only\"")).unwrap();

    let ledger = EvidenceLedger::<BlackSwanEvent>::open(dir.path()).unwrap();
    let report = ledger.verify().unwrap();
    assert!(!report.healthy());
    assert_eq!(report.problems.len(), 1);

    let reopened = CatastrophicRiskManager::open(black_swan_config(), Arc::new(ledger), clock);
    assert!(matches!(
        reopened,
        Err(GuardrailError::Storage(StorageError::Tampered { .. }))
    ));
}

#[tokio::test]
async fn compaction_keeps_current_view() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_epoch());
    {
        let manager = risk_manager(dir.path(), clock.clone());
        manager.check_drift(DriftStatus::Blocked).await.unwrap();
        manager.check_drawdown(dec!(0.3)).await.unwrap();
        manager.recover("all clear").await.unwrap();
    }

    let ledger = EvidenceLedger::<BlackSwanEvent>::open(dir.path()).unwrap();
    let before = ledger.load_all().unwrap();
    // drift open, drift superseded + drawdown open, drawdown recovered
    assert_eq!(ledger.history().unwrap().len(), 4);
    assert_eq!(ledger.compact().unwrap(), 2);
    assert_eq!(ledger.load_all().unwrap(), before);
    assert!(ledger.verify().unwrap().healthy());

    let manager = risk_manager(dir.path(), clock);
    assert_eq!(manager.get_current_status().await, SystemRiskMode::Normal);
}
