//! Tracing setup
//!
//! One rolling file per process. A process hosting a single service writes
//! `{service}-{log_file}` so co-located deployments do not interleave logs.

use crate::config::{AppConfig, ServiceKind};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Crates that are chatty at debug level
const QUIET_TARGETS: [&str; 4] = ["hyper", "hyper_util", "redis", "reqwest"];

fn file_name(config: &AppConfig, single: Option<ServiceKind>) -> String {
    match single {
        Some(service) => format!("{}-{}", service.as_str(), config.log_file),
        None => config.log_file.clone(),
    }
}

fn appender(config: &AppConfig, file: &str) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, file),
        _ => tracing_appender::rolling::never(&config.log_dir, file),
    }
}

/// Default filter directives when `RUST_LOG` is unset
fn directives(level: &str) -> String {
    let mut out = level.to_string();
    for target in QUIET_TARGETS {
        out.push_str(&format!(",{}=warn", target));
    }
    out
}

/// Install the global subscriber. Keep the guard alive for the whole run;
/// dropping it stops the background writer.
pub fn init_logging(config: &AppConfig, single: Option<ServiceKind>) -> WorkerGuard {
    let file = file_name(config, single);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender(config, &file));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(&config.log_level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // request_id lives on the request span
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}
