//! Tracing setup for the device agent.
//!
//! On a bench the agent prints human-readable traces with span timings. In
//! a vehicle it writes one JSON record per line under `{data_dir}/logs`,
//! in files named after the device role, and mirrors a plain single-line
//! form to stdout for the unit's journal. Both devices of a convoy can run
//! on one host without sharing a log file.
//!
//! `RUST_LOG` wins over `CONVOY_LOG_LEVEL`, which defaults to `info`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use convoy_core::Role;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fallback filter when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "CONVOY_LOG_LEVEL";

/// Flush handles for the background writers. Dropping one loses buffered lines.
static GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

/// Where traces go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    /// Pretty stdout only.
    Console,
    /// JSON files in `dir` plus plain stdout.
    Device {
        /// Directory for the rolling files.
        dir: PathBuf,
        /// Prefixes the file names.
        role: Role,
    },
}

impl LogOutput {
    /// Device output under `{data_dir}/logs`.
    #[must_use]
    pub fn device(data_dir: &Path, role: Role) -> Self {
        Self::Device {
            dir: data_dir.join("logs"),
            role,
        }
    }
}

/// File name prefix for `role`, e.g. `convoy-driver`.
fn file_prefix(role: Role) -> String {
    format!("convoy-{role}")
}

fn filter() -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    Ok(EnvFilter::try_new(level)?)
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails on an unparsable filter, an unwritable log directory, or when a
/// subscriber is already installed.
pub fn init(output: &LogOutput) -> anyhow::Result<()> {
    let filter = filter()?;

    match output {
        LogOutput::Console => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_file(true)
                        .with_line_number(true)
                        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
                )
                .try_init()?;
        }
        LogOutput::Device { dir, role } => {
            std::fs::create_dir_all(dir)?;
            let files = RollingFileAppender::new(Rotation::DAILY, dir, file_prefix(*role));
            let (files, files_guard) = tracing_appender::non_blocking(files);
            let (journal, journal_guard) = tracing_appender::non_blocking(std::io::stdout());

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(files)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(journal)
                        .with_ansi(false),
                )
                .try_init()?;

            let _ = GUARDS.set(vec![files_guard, journal_guard]);
        }
    }
    Ok(())
}
