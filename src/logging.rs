//! Tracing subscriber setup.
//!
//! `WEAVE_LOG` takes an `EnvFilter` directive (default `info`, `debug` with
//! `--verbose`). `WEAVE_LOG_FORMAT=json` switches stderr to JSON lines. When a
//! log directory is given, a daily rolling file is written there as well; the
//! returned guard flushes it on drop and must live as long as `main`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_FILE_PREFIX: &str = "weave.log";

pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("WEAVE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("weave={}", default_level)));

    let json = std::env::var("WEAVE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let (file_writer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        _ => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| {
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr)
        }))
        .with(file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer)))
        .try_init();

    guard
}
