//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging for the gateway runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "UGATE_LOG";
const RUST_LOG_ENV: &str = "RUST_LOG";

/// Gateway crates logged at debug by default; dependencies stay at info.
const GATEWAY_TARGETS: [&str; 6] = [
    "ugate_common",
    "ugate_protocol",
    "ugate_security",
    "ugate_mail",
    "ugate_core",
    "ugated",
];

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Available log formats for the gateway daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Where the active filter directive came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterSource {
    GatewayEnv,
    RustLog,
    Config,
    Default,
}

fn default_directive() -> String {
    GATEWAY_TARGETS
        .iter()
        .fold(String::from("info"), |mut directive, target| {
            directive.push(',');
            directive.push_str(target);
            directive.push_str("=debug");
            directive
        })
}

/// Pick the first directive that parses: `UGATE_LOG`, `RUST_LOG`, then the
/// configured filter. Invalid directives are reported and skipped.
fn resolve_filter(
    gateway_env: Option<String>,
    rust_log: Option<String>,
    configured: Option<&str>,
) -> (EnvFilter, FilterSource) {
    let candidates = [
        (gateway_env, FilterSource::GatewayEnv),
        (rust_log, FilterSource::RustLog),
        (configured.map(str::to_owned), FilterSource::Config),
    ];
    for (directive, source) in candidates {
        let Some(directive) = directive.filter(|d| !d.trim().is_empty()) else {
            continue;
        };
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return (filter, source),
            Err(err) => eprintln!("ignoring invalid log directive {directive:?} ({source:?}): {err}"),
        }
    }
    (EnvFilter::new(default_directive()), FilterSource::Default)
}

/// Initialize the tracing subscriber from configuration and environment.
///
/// Stdout receives the configured format while a daily rolling JSON file named
/// after the service (or `file_prefix`) collects everything, so lost image
/// transfers can be traced per node after the fact.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let stem = config.file_prefix.as_deref().unwrap_or(service_name);
    let file_appender = daily(&config.directory, format!("{stem}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let (filter, filter_source) = resolve_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var(RUST_LOG_ENV).ok(),
        config.filter.as_deref(),
    );

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        log_file = %format!("{stem}.log"),
        format = ?config.format,
        filter_source = ?filter_source,
        "tracing initialised"
    );
    Ok(())
}
