//! Shared building blocks of the rgrid tools.
//!
//! This crate holds everything that is independent of the wire protocol:
//!
//! - [`error`] - the error taxonomy used by all rgrid crates
//! - [`control`] - the [`TransferControlBlock`] used to pause, cancel and observe a transfer
//! - [`status`] - [`TransferStatus`] snapshots and the [`TransferStatusCallback`] interface
//! - [`config`] - connection, transfer and output settings
//! - [`summary`] - per-operation [`Summary`] counters
//! - [`localfs`] - local filesystem walking helpers
//!
//! Binaries use [`run`] to set up logging and the tokio runtime around their async main.

pub mod config;
pub mod control;
pub mod error;
pub mod localfs;
pub mod status;
pub mod summary;

pub use config::{ConnectionConfig, OutputConfig, TransferConfig};
pub use control::TransferControlBlock;
pub use error::{Error, Result};
pub use status::{TransferState, TransferStatus, TransferStatusCallback, TransferType};
pub use summary::Summary;

fn level_filter(output: &OutputConfig) -> tracing_subscriber::filter::LevelFilter {
    use tracing_subscriber::filter::LevelFilter;
    if output.quiet {
        return LevelFilter::OFF;
    }
    match output.verbose {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence over the verbosity level.
pub fn init_logging(output: &OutputConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level_filter(output).into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))
}

/// Runs `func` on a fresh multi-threaded runtime with logging configured from `output`.
///
/// Prints the summary when requested and the error unless quiet. Returns `None` on failure so
/// that the caller can pick the exit code.
pub fn run<Fut, S, E>(output: OutputConfig, func: impl FnOnce() -> Fut) -> Option<S>
where
    Fut: std::future::Future<Output = Result<S, E>>,
    S: std::fmt::Display,
    E: std::fmt::Debug,
{
    if let Err(error) = output.validate() {
        eprintln!("{error}");
        return None;
    }
    if let Err(error) = init_logging(&output) {
        eprintln!("{error:#}");
        return None;
    }
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {error}");
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:?}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        use tracing_subscriber::filter::LevelFilter;
        let output = |quiet, verbose| OutputConfig {
            quiet,
            verbose,
            print_summary: false,
        };
        assert_eq!(level_filter(&output(false, 0)), LevelFilter::ERROR);
        assert_eq!(level_filter(&output(false, 1)), LevelFilter::INFO);
        assert_eq!(level_filter(&output(false, 2)), LevelFilter::DEBUG);
        assert_eq!(level_filter(&output(false, 7)), LevelFilter::TRACE);
        assert_eq!(level_filter(&output(true, 0)), LevelFilter::OFF);
    }
}
