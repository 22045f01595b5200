//! Status callback used by the `rgrid` binary: prints one line per status event, as text or
//! JSON, or drives a progress bar.

use std::sync::atomic::{AtomicUsize, Ordering};

use common::error::{Error, Result};
use common::status::{TransferState, TransferStatus, TransferStatusCallback};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StatusFormat {
    /// human readable lines
    #[default]
    Text,
    /// one JSON object per line
    Json,
}

pub struct StatusPrinter {
    format: StatusFormat,
    bar: Option<indicatif::ProgressBar>,
    failures: AtomicUsize,
}

impl std::fmt::Debug for StatusPrinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPrinter")
            .field("format", &self.format)
            .field("progress_bar", &self.bar.is_some())
            .field("failures", &self.failures())
            .finish()
    }
}

fn bar_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files {msg}",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
    .progress_chars("=>-")
}

impl StatusPrinter {
    /// With `progress` a bar on stderr replaces the per-file lines; failures are still printed.
    pub fn new(format: StatusFormat, progress: bool) -> Self {
        let bar = progress.then(|| {
            let bar = indicatif::ProgressBar::new(0);
            bar.set_style(bar_style());
            bar
        });
        Self {
            format,
            bar,
            failures: AtomicUsize::new(0),
        }
    }

    /// Number of failure events seen so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    fn render(&self, status: &TransferStatus) -> Result<String> {
        match self.format {
            StatusFormat::Text => Ok(render_text(status)),
            StatusFormat::Json => serde_json::to_string(status)
                .map_err(|error| Error::transfer(format!("cannot encode status event: {error}"))),
        }
    }
}

pub fn render_text(status: &TransferStatus) -> String {
    let (done, total) = (status.files_transferred_so_far, status.total_files);
    let progress = match status.files_fraction() {
        Some(fraction) => format!("[{done}/{total} {:.0}%]", fraction * 100.0),
        None => format!("[{done}/{total}]"),
    };
    match status.state {
        TransferState::Success => format!(
            "{progress} {} {} -> {} ({})",
            status.transfer_type,
            status.source_path,
            status.target_path,
            bytesize::ByteSize(status.bytes_transferred_so_far)
        ),
        TransferState::Failure => {
            let reason = status
                .error
                .as_ref()
                .map(|error| error.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            format!(
                "{progress} {} {} -> {} FAILED: {reason}",
                status.transfer_type, status.source_path, status.target_path
            )
        }
        TransferState::Cancelled => format!(
            "{progress} {} {} -> {} cancelled",
            status.transfer_type, status.source_path, status.target_path
        ),
        TransferState::OverallCompletion => format!(
            "{progress} {} {} -> {} complete",
            status.transfer_type, status.source_path, status.target_path
        ),
    }
}

impl TransferStatusCallback for StatusPrinter {
    fn status_callback(&self, status: TransferStatus) -> Result<()> {
        if status.is_failure() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let Some(bar) = &self.bar else {
            println!("{}", self.render(&status)?);
            return Ok(());
        };
        bar.set_length(status.total_files as u64);
        bar.set_position(status.files_transferred_so_far as u64);
        match status.state {
            TransferState::Success => bar.set_message(status.target_path),
            TransferState::Failure => bar.println(self.render(&status)?),
            TransferState::Cancelled | TransferState::OverallCompletion => bar.finish_and_clear(),
        }
        Ok(())
    }
}
