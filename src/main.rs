use anyhow::Context;
use bulwark::cli::{self, Cli};
use bulwark::config::GuardrailConfig;
use clap::Parser;

mod main_runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GuardrailConfig::load_validated(&cli.config_dir).with_context(|| {
        format!("loading configuration from {}", cli.config_dir.display())
    })?;
    let _log_guard = main_runtime::init_logging(&config.logging);

    cli::run(&cli, &config).await
}
