use bulwark::config::LoggingConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Console logging plus a daily-rolling file when `config.dir` is writable.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},bulwark=debug", config.level)));

    // `tracing_appender::rolling::daily` panics if it can't create the
    // initial log file, so check writability first.
    let (file_writer, guard) = match writable_dir(&config.dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(&config.dir, "bulwark.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(non_blocking), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                config.dir.display(),
                e
            );
            (None, None)
        }
    };

    let (json_console, plain_console) = if config.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let (json_file, plain_file) = match (file_writer, config.json) {
        (Some(writer), true) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false),
            ),
            None,
        ),
        (Some(writer), false) => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            ),
        ),
        (None, _) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_console)
        .with(plain_console)
        .with(json_file)
        .with(plain_file)
        .init();

    guard
}

fn writable_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".bulwark_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
