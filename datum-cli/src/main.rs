//! Datum: versioned data and reproducible pipelines.
//!
//! # Usage
//!
//! ```text
//! datum init [--force]
//! datum add <path>... [--recursive]
//! datum checkout [<target>...] [--force] [--cleanup]
//! datum push|fetch [<target>...] [--remote <name>] [--jobs <n>]
//! datum pull [<target>...] [--remote <name>] [--jobs <n>] [--force]
//! datum repro [<stage>...] [--force]
//! datum status [<target>...] [--remote [<name>]] [--json]
//! datum gc [--keep <id>...]
//! datum remove <target> [--outs]
//! datum unprotect <path>...
//! datum remote add|remove|modify|default|list
//! ```

mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    add::AddArgs, checkout::CheckoutArgs, gc::GcArgs, init::InitArgs, remote::RemoteCommand,
    remove::RemoveArgs, remove::UnprotectArgs, repro::ReproArgs, status::StatusArgs,
    transfer::PullArgs, transfer::TransferArgs,
};
use datum_core::Interrupt;
use datum_repo::Repo;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "datum",
    version,
    about = "Version large data by content and reproduce pipelines",
    long_about = None,
)]
struct Cli {
    /// Run as if started in this directory.
    #[arg(short = 'C', long = "cwd", global = true, value_name = "DIR")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a datum repository in the current directory.
    Init(InitArgs),

    /// Track files or directories by content.
    Add(AddArgs),

    /// Restore tracked outputs from the cache.
    Checkout(CheckoutArgs),

    /// Upload cached objects to a remote.
    Push(TransferArgs),

    /// Download objects from a remote into the cache.
    Fetch(TransferArgs),

    /// Fetch, then check out the fetched outputs.
    Pull(PullArgs),

    /// Re-run stale pipeline stages.
    Repro(ReproArgs),

    /// Show stale stages, modified data and remote object status.
    Status(StatusArgs),

    /// Remove unreferenced objects from the cache.
    Gc(GcArgs),

    /// Stop tracking a file or a pipeline stage.
    Remove(RemoveArgs),

    /// Make tracked files editable in place.
    Unprotect(UnprotectArgs),

    /// Manage remotes.
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Working directory and interrupt flag handed to every command.
#[derive(Debug, Clone)]
pub struct Session {
    pub cwd: PathBuf,
    pub interrupt: Interrupt,
}

impl Session {
    /// Open the repository containing the working directory.
    pub fn repo(&self) -> Result<Repo> {
        let repo = Repo::discover(&self.cwd).with_context(|| {
            format!(
                "'{}' is not inside a datum repository; run `datum init` first",
                self.cwd.display()
            )
        })?;
        Ok(repo.with_interrupt(self.interrupt.clone()))
    }

    /// Resolve a command-line path against the working directory.
    pub fn path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    /// Targets are resolved against the working directory unless they name
    /// a stage.
    pub fn targets(&self, repo: &Repo, targets: &[String]) -> Vec<String> {
        let names = repo.graph().ok();
        targets
            .iter()
            .map(|target| {
                let is_stage = names.as_ref().is_some_and(|g| g.get(target).is_some());
                if is_stage {
                    target.clone()
                } else {
                    self.path(Path::new(target)).display().to_string()
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cwd = match cli.cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot read the current directory")?,
    };
    let ctx = Session {
        cwd: cwd
            .canonicalize()
            .with_context(|| format!("cannot resolve '{}'", cwd.display()))?,
        interrupt: Interrupt::new(),
    };
    watch_ctrl_c(ctx.interrupt.clone());

    match cli.command {
        Commands::Init(args) => args.run(&ctx),
        Commands::Add(args) => args.run(&ctx),
        Commands::Checkout(args) => args.run(&ctx),
        Commands::Push(args) => args.push(&ctx),
        Commands::Fetch(args) => args.fetch(&ctx),
        Commands::Pull(args) => args.run(&ctx),
        Commands::Repro(args) => args.run(&ctx),
        Commands::Status(args) => args.run(&ctx),
        Commands::Gc(args) => args.run(&ctx),
        Commands::Remove(args) => args.run(&ctx),
        Commands::Unprotect(args) => args.run(&ctx),
        Commands::Remote { command } => commands::remote::run(&ctx, command),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Trigger `interrupt` on the first ctrl-c. Transfers and stage runs stop at
/// their next checkpoint and report what was left undone.
fn watch_ctrl_c(interrupt: Interrupt) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::debug!("ctrl-c handler unavailable: {err}");
                return;
            }
        };
        runtime.block_on(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::warn!("received ctrl-c, stopping after in-flight work");
                    interrupt.trigger();
                }
                Err(err) => tracing::debug!("ctrl-c handler failed: {err}"),
            }
        });
    });
}
