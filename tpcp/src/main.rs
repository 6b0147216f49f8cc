use anyhow::Result;
use clap::Parser;
use tracing::instrument;

use transfer::conflict::{OverwriteChoice, OverwriteReply};
use transfer::controller::{
    Controller, Host, OverwritePrompt, ProgressUpdate, TransferOutcome, TransferRequest,
};
use transfer::scan::ScanResult;
use transfer::symlink::LinkRewrite;
use transfer::{ErrorAction, Gate, OverwritePolicy, SymlinkPolicy, TransferError, TransferMode};

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OnConflict {
    /// Replace the existing destination
    Overwrite,
    /// Keep the existing destination and skip the source
    Skip,
    /// Treat the collision as an error
    Fail,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tpcp",
    version,
    about = "Copy or move files and directories with the twopane transfer engine",
    long_about = "`tpcp` drives the twopane transfer engine from the command line: recursive
copy/move with a symlink-remapping policy, conflict handling and an operation
summary. Interactive prompts are answered from the flags below.

EXAMPLE:
    # Copy two directories into /backup, replacing collisions
    tpcp --on-conflict overwrite --progress --summary src1/ src2/ /backup"
)]
struct Args {
    // Transfer options
    /// Move instead of copy (atomic rename with copy+delete fallback)
    #[arg(long = "move", help_heading = "Transfer options")]
    move_items: bool,

    /// What to do when the destination already exists
    #[arg(
        long,
        value_name = "ACTION",
        default_value = "fail",
        help_heading = "Transfer options"
    )]
    on_conflict: OnConflict,

    /// How to rewrite symlink values in the copy
    ///
    /// `target` remaps links pointing back into the copied tree so they stay
    /// valid in the destination, `no-change` keeps every link value
    /// byte-identical, `source` pins internal links to their resolved target
    /// in the original tree. `ask` requires an interactive host and is
    /// rejected here.
    #[arg(
        long,
        value_name = "POLICY",
        default_value = "target",
        help_heading = "Transfer options"
    )]
    symlinks: SymlinkPolicy,

    /// Exit on the first error instead of skipping the failed item
    #[arg(short = 'e', long = "fail-early", help_heading = "Transfer options")]
    fail_early: bool,

    // Progress & output
    /// Show progress on stderr
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Print the operation summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // ARGUMENTS
    /// Source path(s) followed by the destination
    #[arg(required = true, num_args = 2.., value_name = "PATH")]
    paths: Vec<std::path::PathBuf>,
}

/// Non-interactive [`Host`]: every prompt is answered from the flags.
struct CliHost {
    on_conflict: OnConflict,
    symlinks: SymlinkPolicy,
    fail_early: bool,
    progress: bool,
    quiet: bool,
}

impl Host for CliHost {
    fn scan_cancel_requested(&self) -> bool {
        false
    }

    async fn scan_progress(&self, _current: &std::path::Path, totals: &ScanResult) {
        if self.progress {
            eprint!("\rscanning: {totals}        ");
        }
    }

    async fn progress(&self, update: &ProgressUpdate) {
        if !self.progress {
            return;
        }
        let percent = if update.bytes_total > 0 {
            update.bytes_done * 100 / update.bytes_total
        } else {
            100
        };
        let rate = match update.bytes_per_sec {
            Some(rate) => format!(", {}/s", bytesize::ByteSize(rate as u64)),
            None => String::new(),
        };
        eprint!(
            "\r{}/{} files, {}/{} ({percent}%{rate})        ",
            update.files_done,
            update.files_total,
            bytesize::ByteSize(update.bytes_done),
            bytesize::ByteSize(update.bytes_total),
        );
    }

    async fn pause_gate(&self) -> Gate {
        Gate::Continue
    }

    async fn report_error(
        &self,
        src: &std::path::Path,
        _dst: &std::path::Path,
        error: &TransferError,
    ) -> ErrorAction {
        if !self.quiet {
            tracing::error!("{:?}: {}", src, &error);
        }
        if self.fail_early {
            ErrorAction::Cancel
        } else {
            ErrorAction::Skip
        }
    }

    async fn ask_overwrite(&self, prompt: &OverwritePrompt) -> OverwriteReply {
        let choice = match self.on_conflict {
            OnConflict::Overwrite => OverwriteChoice::Overwrite,
            OnConflict::Skip => OverwriteChoice::Skip,
            OnConflict::Fail => {
                if !self.quiet {
                    tracing::error!("{:?} already exists", &prompt.dst);
                }
                OverwriteChoice::Cancel
            }
        };
        // apply to every collision; the controller ignores the flag for
        // non-rememberable choices
        OverwriteReply {
            choice,
            remember: true,
        }
    }

    async fn ask_symlink_policy(&self) -> Option<SymlinkPolicy> {
        Some(self.symlinks)
    }

    async fn ask_symlink_target(
        &self,
        _link: &std::path::Path,
        _target: &std::path::Path,
    ) -> Option<LinkRewrite> {
        self.symlinks.as_rewrite()
    }

    async fn transfer_done(&self, _outcome: &TransferOutcome) {
        if self.progress {
            eprintln!();
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<TransferOutcome> {
    let Some((destination, sources)) = args.paths.split_last() else {
        anyhow::bail!("missing source and destination paths");
    };
    let request = TransferRequest {
        mode: if args.move_items {
            TransferMode::Move
        } else {
            TransferMode::Copy
        },
        sources: sources.to_vec(),
        source_cwd: std::env::current_dir()?,
        target_path: destination.clone(),
        overwrite_policy: match args.on_conflict {
            OnConflict::Overwrite => OverwritePolicy::Overwrite,
            OnConflict::Skip => OverwritePolicy::Skip,
            OnConflict::Fail => OverwritePolicy::Ask,
        },
    };
    let host = CliHost {
        on_conflict: args.on_conflict,
        symlinks: args.symlinks,
        fail_early: args.fail_early,
        progress: args.progress,
        quiet: args.quiet,
    };
    let mut controller = Controller::new();
    Ok(controller.execute(&request, &host).await)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    if args.symlinks == SymlinkPolicy::Ask {
        anyhow::bail!("--symlinks ask requires an interactive host");
    }
    let print_summary = args.summary;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(async_main(args))?;
    if print_summary {
        println!("{}", outcome.summary());
    }
    match outcome {
        TransferOutcome::Completed(_) => Ok(()),
        TransferOutcome::Cancelled(_) | TransferOutcome::Navigate(..) => {
            tracing::error!("transfer did not complete");
            std::process::exit(1);
        }
    }
}
