use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::config::{ConnectionConfig, DEFAULT_PORT, OutputConfig, TransferConfig};
use common::control::{DEFAULT_MAX_ERRORS_BEFORE_CANCEL, TransferControlBlock};
use common::summary::Summary;
use remote::{Account, AuthScheme, Session};
use rgrid::{DataTransferOperations, StatusFormat, StatusPrinter};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rgrid",
    version,
    about = "Move files and directory trees to and from an iRODS data grid",
    long_about = "`rgrid` talks to an iRODS server directly: large files are moved over several parallel
streams, directory trees are walked depth-first, and a restart path lets an interrupted transfer
resume after the last file known to be complete.

EXAMPLES:
    # Upload a directory into the home collection
    rgrid --host grid.example.org --user alice --zone tempZone put ./data /tempZone/home/alice

    # Resume a download after the last file that completed
    rgrid ... get /tempZone/home/alice/data ./data --restart-from /tempZone/home/alice/data/0042.bin

The password is read from RGRID_PASSWORD when --password is not given."
)]
struct Args {
    // Connection
    /// Grid server host name
    #[arg(long, env = "RGRID_HOST", help_heading = "Connection")]
    host: String,

    /// Grid server port
    #[arg(long, env = "RGRID_PORT", default_value_t = DEFAULT_PORT, help_heading = "Connection")]
    port: u16,

    /// User name
    #[arg(long, env = "RGRID_USER", help_heading = "Connection")]
    user: String,

    /// Zone of the user
    #[arg(long, env = "RGRID_ZONE", help_heading = "Connection")]
    zone: String,

    /// Password (grid password for native authentication, PAM password for pam)
    #[arg(long, env = "RGRID_PASSWORD", hide_env_values = true, help_heading = "Connection")]
    password: String,

    /// Authentication scheme: native or pam
    #[arg(long, default_value = "native", value_name = "SCHEME", help_heading = "Connection")]
    auth_scheme: AuthScheme,

    /// Storage resource for new data objects (server default when empty)
    #[arg(long, env = "RGRID_RESOURCE", default_value = "", help_heading = "Connection")]
    resource: String,

    /// Time allowed for connecting to the server, e.g. "10s" or "2min"
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration, value_name = "DELAY", help_heading = "Connection")]
    connect_timeout: Duration,

    // Progress & output
    /// Show a progress bar instead of one line per file
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Format of the per-file status lines
    #[arg(long, value_enum, default_value_t, value_name = "FORMAT", help_heading = "Progress & output")]
    status_format: StatusFormat,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct TransferArgs {
    /// Maximum number of parallel streams per large file, 0 disables parallel transfers
    #[arg(long, default_value_t = 4, value_name = "N", help_heading = "Transfer options")]
    threads: usize,

    /// Files of at least this size use parallel streams, e.g. "32MiB"
    #[arg(long, default_value = "32MiB", value_parser = parse_size, value_name = "SIZE", help_heading = "Transfer options")]
    parallel_threshold: u64,

    /// Skip every file up to and including this path (last file known to be complete)
    #[arg(long, value_name = "PATH", help_heading = "Transfer options")]
    restart_from: Option<String>,

    /// Cancel the transfer after this many failed files, 0 or -1 never cancels
    #[arg(long, default_value_t = DEFAULT_MAX_ERRORS_BEFORE_CANCEL, allow_negative_numbers = true, value_name = "N", help_heading = "Transfer options")]
    max_errors: i32,

    /// Overwrite existing data objects
    #[arg(long, help_heading = "Transfer options")]
    force: bool,
}

impl TransferArgs {
    fn settings(&self) -> TransferConfig {
        TransferConfig {
            parallel_threshold: self.parallel_threshold,
            max_parallel_threads: self.threads,
            max_errors_before_cancel: self.max_errors,
            force_overwrite: self.force,
            ..Default::default()
        }
    }

    fn control_block(&self) -> Result<Arc<TransferControlBlock>> {
        let control =
            TransferControlBlock::with_settings(self.restart_from.clone(), self.max_errors)
                .context("invalid transfer options")?;
        Ok(Arc::new(control))
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Upload a local file or directory
    Put {
        local: std::path::PathBuf,
        remote: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Download a data object or collection
    Get {
        remote: String,
        local: std::path::PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Replicate a data object, or all data objects of a collection, to another resource
    Replicate {
        path: String,
        resource: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Rename a data object or collection; moving onto a collection places the source inside it
    Mv { source: String, target: String },
    /// Move a collection under another collection
    MvUnder { source: String, collection: String },
    /// Move a data object's replica to another storage resource
    Phymv { path: String, resource: String },
}

fn parse_size(value: &str) -> std::result::Result<u64, String> {
    value
        .parse::<bytesize::ByteSize>()
        .map(|size| size.as_u64())
}

/// Cancels the transfer between files on Ctrl-C.
fn cancel_on_interrupt(control: &Arc<TransferControlBlock>) {
    let control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing the current file");
            control.cancel();
        }
    });
}

async fn run_command(
    operations: &mut DataTransferOperations,
    command: Command,
    printer: &StatusPrinter,
) -> Result<Summary> {
    let summary = match command {
        Command::Put { local, remote, transfer } => {
            let control = transfer.control_block()?;
            cancel_on_interrupt(&control);
            operations
                .put(&local, &remote, Some(printer), Some(control))
                .await
                .with_context(|| format!("put of {local:?} to {remote} failed"))?
        }
        Command::Get { remote, local, transfer } => {
            let control = transfer.control_block()?;
            cancel_on_interrupt(&control);
            operations
                .get(&remote, &local, Some(printer), Some(control))
                .await
                .with_context(|| format!("get of {remote} to {local:?} failed"))?
        }
        Command::Replicate { path, resource, transfer } => {
            let control = transfer.control_block()?;
            cancel_on_interrupt(&control);
            operations
                .replicate(&path, &resource, Some(printer), Some(control))
                .await
                .with_context(|| format!("replication of {path} to {resource} failed"))?
        }
        Command::Mv { source, target } => {
            operations
                .move_object(&source, &target)
                .await
                .with_context(|| format!("move of {source} to {target} failed"))?;
            Summary::default()
        }
        Command::MvUnder { source, collection } => {
            operations
                .move_collection_under(&source, &collection)
                .await
                .with_context(|| format!("move of {source} under {collection} failed"))?;
            Summary::default()
        }
        Command::Phymv { path, resource } => {
            operations
                .physical_move(&path, &resource)
                .await
                .with_context(|| format!("physical move of {path} to {resource} failed"))?;
            Summary::default()
        }
    };
    Ok(summary)
}

#[tracing::instrument(skip(args), fields(host = %args.host, user = %args.user))]
async fn async_main(args: Args) -> Result<Summary> {
    let account = Account::new(&args.host, args.port, &args.user, &args.zone, &args.password)
        .context("invalid account")?
        .with_scheme(args.auth_scheme)
        .with_default_resource(&args.resource);
    let connection = ConnectionConfig {
        connect_timeout: args.connect_timeout,
        ..Default::default()
    };
    let settings = match &args.command {
        Command::Put { transfer, .. }
        | Command::Get { transfer, .. }
        | Command::Replicate { transfer, .. } => transfer.settings(),
        _ => TransferConfig::default(),
    };
    let session = Session::open(account, &connection)
        .await
        .with_context(|| format!("failed to open a session on {}:{}", args.host, args.port))?;
    let mut operations =
        DataTransferOperations::new(session, settings).context("invalid transfer options")?;
    let printer = StatusPrinter::new(args.status_format, args.progress);
    let result = run_command(&mut operations, args.command, &printer).await;
    if let Err(error) = operations.close().await {
        tracing::warn!("failed to disconnect cleanly: {error}");
    }
    let summary = result?;
    if printer.failures() > 0 {
        if args.summary {
            return Err(anyhow!("{} file(s) failed\n\n{summary}", printer.failures()));
        }
        return Err(anyhow!("{} file(s) failed", printer.failures()));
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let output = OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    if common::run(output, || async_main(args)).is_none() {
        std::process::exit(1);
    }
    Ok(())
}
