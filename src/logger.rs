use anyhow::{Result, anyhow};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber: stderr via `fmt`, plus a daily
/// rolling file when `log_dir` is set. `RUST_LOG` overrides `log_level`.
/// The returned guard must be held for the process lifetime so the file
/// writer flushes on shutdown.
pub fn init_tracing(log_level: &str, log_dir: Option<PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{log_level},hyper=off,reqwest=warn,tower_http=info"))
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "botflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            registry
                .try_init()
                .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;
            Ok(None)
        }
    }
}
