//! Bulwark operator CLI
//!
//! Commands:
//! - `bulwark verify` - Integrity report for every evidence ledger
//! - `bulwark trigger` - Manually trip the black-swan circuit breaker
//! - `bulwark recover` - Close the active black-swan event
//! - `bulwark compact` - Drop superseded record versions

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::clock::SystemClock;
use crate::config::GuardrailConfig;
use crate::coordination::{BlackSwanEvent, CatastrophicRiskManager, GuardEvent};
use crate::domain::RiskAction;
use crate::persistence::{EvidenceLedger, IntegrityReport, LedgerRecord};
use crate::strategy::DegradationEvent;
use crate::supervisor::BlockingIssue;

/// Trading guardrail control plane
#[derive(Parser, Debug)]
#[command(name = "bulwark")]
#[command(author, version, about = "Trading guardrail control plane")]
pub struct Cli {
    /// Configuration directory
    #[arg(short, long, default_value = "config", env = "BULWARK_CONFIG_DIR")]
    pub config_dir: PathBuf,

    /// Override the ledger directory from the configuration
    #[arg(long, env = "BULWARK_LEDGER_DIR")]
    pub ledger_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify the hash chain of every evidence ledger
    Verify,

    /// Manually trip the black-swan circuit breaker
    Trigger {
        /// Resulting mode (reduce-only or liquidate)
        #[arg(short, long)]
        mode: RiskAction,
        /// Why the operator is tripping the breaker
        #[arg(short, long)]
        reason: String,
    },

    /// Close the active black-swan event and return to NORMAL
    Recover {
        #[arg(short, long)]
        reason: String,
    },

    /// Rewrite every ledger keeping only the latest version of each record
    Compact,
}

impl Cli {
    pub fn ledger_dir(&self, config: &GuardrailConfig) -> PathBuf {
        self.ledger_dir
            .clone()
            .unwrap_or_else(|| config.ledger.dir.clone())
    }
}

/// Run a parsed command against a loaded configuration.
pub async fn run(cli: &Cli, config: &GuardrailConfig) -> Result<()> {
    let ledger_dir = cli.ledger_dir(config);
    match &cli.command {
        Commands::Verify => verify_all(&ledger_dir),
        Commands::Trigger { mode, reason } => trigger(config, &ledger_dir, *mode, reason).await,
        Commands::Recover { reason } => recover(config, &ledger_dir, reason).await,
        Commands::Compact => compact_all(&ledger_dir),
    }
}

fn verify_family<R: LedgerRecord>(dir: &Path) -> Result<IntegrityReport> {
    let ledger = EvidenceLedger::<R>::open(dir)
        .with_context(|| format!("opening {} ledger", R::FAMILY))?;
    Ok(ledger.verify()?)
}

pub fn verify_all(dir: &Path) -> Result<()> {
    let reports = vec![
        verify_family::<BlockingIssue>(dir)?,
        verify_family::<GuardEvent>(dir)?,
        verify_family::<BlackSwanEvent>(dir)?,
        verify_family::<DegradationEvent>(dir)?,
    ];

    let mut unhealthy = 0;
    for report in &reports {
        println!("{}", report);
        if !report.healthy() {
            unhealthy += 1;
        }
    }
    if unhealthy > 0 {
        bail!("{} ledger(s) failed verification", unhealthy);
    }
    println!("All ledgers verified.");
    Ok(())
}

fn open_risk_manager(config: &GuardrailConfig, dir: &Path) -> Result<CatastrophicRiskManager> {
    let ledger = EvidenceLedger::<BlackSwanEvent>::open(dir)?;
    Ok(CatastrophicRiskManager::open(
        config.black_swan.clone(),
        Arc::new(ledger),
        Arc::new(SystemClock),
    )?)
}

async fn trigger(
    config: &GuardrailConfig,
    dir: &Path,
    mode: RiskAction,
    reason: &str,
) -> Result<()> {
    let manager = open_risk_manager(config, dir)?;
    let before = manager.get_current_status().await;
    let after = manager.manual_trigger(mode, reason).await?;
    if after == before {
        println!("System already in {}; nothing recorded.", after);
    } else {
        info!(%before, %after, "Manual black-swan trigger recorded");
        println!("System mode: {} -> {}", before, after);
    }
    Ok(())
}

async fn recover(config: &GuardrailConfig, dir: &Path, reason: &str) -> Result<()> {
    let manager = open_risk_manager(config, dir)?;
    match manager.recover(reason).await? {
        Some(event) => println!(
            "Recovered {} ({} via {}); system mode NORMAL.",
            event.event_id, event.resulting_mode, event.trigger_type
        ),
        None => println!("No active black-swan event."),
    }
    Ok(())
}

fn compact_family<R: LedgerRecord>(dir: &Path) -> Result<usize> {
    let ledger = EvidenceLedger::<R>::open(dir)
        .with_context(|| format!("opening {} ledger", R::FAMILY))?;
    let dropped = ledger.compact()?;
    println!("{}: dropped {} superseded versions", R::FAMILY, dropped);
    Ok(dropped)
}

pub fn compact_all(dir: &Path) -> Result<()> {
    let dropped = compact_family::<BlockingIssue>(dir)?
        + compact_family::<GuardEvent>(dir)?
        + compact_family::<BlackSwanEvent>(dir)?
        + compact_family::<DegradationEvent>(dir)?;
    info!("Compaction dropped {} versions in total", dropped);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger() {
        let cli = Cli::try_parse_from([
            "bulwark",
            "trigger",
            "--mode",
            "reduce-only",
            "--reason",
            "exchange maintenance",
        ])
        .unwrap();
        match cli.command {
            Commands::Trigger { mode, reason } => {
                assert_eq!(mode, RiskAction::ReduceOnly);
                assert_eq!(reason, "exchange maintenance");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["bulwark", "trigger", "-m", "panic", "-r", "x"]).is_err());
    }

    #[test]
    fn test_verify_and_compact_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        verify_all(dir.path()).unwrap();
        compact_all(dir.path()).unwrap();
    }
}
