use std::{future::Future, path::Path, time::Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Target of the one-line JSON report emitted per request.
pub const REQUEST_TARGET: &str = "request";

fn appender(file: &Path) -> Result<RollingFileAppender> {
    let dir = file
        .parent()
        .ok_or_else(|| anyhow!("log file {} has no parent directory", file.display()))?;
    let name = file
        .file_name()
        .ok_or_else(|| anyhow!("log file {} has no file name", file.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, name))
}

/// Installs the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
/// - `log_file` receives the plain-text log, rolled daily.
/// - `event_file` receives newline-delimited JSON request reports.
///
/// Without files, logs go to stderr and request reports are dropped.
pub fn init_tracing(
    log_level: &str,
    log_file: Option<&Path>,
    event_file: Option<&Path>,
) -> Result<()> {
    let env_filter = EnvFilter::new(log_level);

    match (log_file, event_file) {
        (Some(log_file), Some(event_file)) => {
            let txt_layer = fmt::layer()
                .with_writer(appender(log_file)?)
                .with_ansi(false);
            let json_layer = fmt::layer()
                .json()
                .with_writer(appender(event_file)?)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{REQUEST_TARGET}=info")));
            Registry::default()
                .with(env_filter)
                .with(txt_layer)
                .with(json_layer)
                .try_init()?;
        }
        _ => {
            let stderr_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true);
            Registry::default()
                .with(env_filter)
                .with(stderr_layer)
                .try_init()?;
        }
    }
    Ok(())
}

/// Runs `handler` and reports it as one request: a log line with the outcome
/// and a JSON event (target `request`) with name, latency and status.
pub async fn instrument_request<F, Fut, T, E>(name: &str, handler: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let result = handler().await;
    let elapsed = start.elapsed().as_secs_f64() * 1_000.0;

    match &result {
        Ok(_) => info!("request `{}` succeeded in {:.2} ms", name, elapsed),
        Err(err) => error!(error = %err, "request `{}` failed in {:.2} ms", name, elapsed),
    }

    tracing::event!(
        target: REQUEST_TARGET,
        tracing::Level::INFO,
        request = name,
        latency_ms = elapsed,
        status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        },
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_results_through() {
        let ok: Result<u8, String> = instrument_request("ok", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u8, String> =
            instrument_request("err", || async { Err("boom".to_string()) }).await;
        assert_eq!(err, Err("boom".to_string()));
    }
}
