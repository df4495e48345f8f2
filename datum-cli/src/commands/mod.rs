//! One module per subcommand, plus the report printers they share.

pub mod add;
pub mod checkout;
pub mod gc;
pub mod init;
pub mod remote;
pub mod remove;
pub mod repro;
pub mod status;
pub mod transfer;

use colored::Colorize;

use datum_pipeline::ExecutorResult;
use datum_repo::RepoError;
use datum_sync::{CheckoutReport, TransferSummary};

/// Print the per-item detail of an aggregate failure, then hand the error
/// back for `main` to report.
pub fn explain(err: RepoError) -> anyhow::Error {
    match &err {
        RepoError::TransferFailed(summary) => print_transfer(summary),
        RepoError::CheckoutFailed(report) => print_checkout(report),
        RepoError::PullFailed { transfer, checkout } => {
            print_transfer(transfer);
            print_checkout(checkout);
        }
        RepoError::ReproFailed(result) => print_repro(result),
        _ => {}
    }
    err.into()
}

pub fn print_transfer(summary: &TransferSummary) {
    println!(
        "{} transferred, {} up to date",
        summary.succeeded, summary.up_to_date
    );
    for (id, err) in &summary.failed {
        println!("  {} {id}: {err}", "failed".red().bold());
    }
    if !summary.cancelled.is_empty() {
        println!(
            "  {} {} object(s) not attempted",
            "cancelled".yellow().bold(),
            summary.cancelled.len()
        );
    }
}

pub fn print_checkout(report: &CheckoutReport) {
    for path in &report.added {
        println!("{} {}", "A".green(), path.display());
    }
    for path in &report.modified {
        println!("{} {}", "M".yellow(), path.display());
    }
    for path in &report.removed {
        println!("{} {}", "D".red(), path.display());
    }
    for (path, err) in &report.failed {
        println!("{} {}: {err}", "failed".red().bold(), path.display());
    }
}

pub fn print_repro(result: &ExecutorResult) {
    for name in &result.ran {
        println!("{} {name}", "ran".green().bold());
    }
    for name in &result.skipped {
        println!("{} {name}", "up to date".bright_black());
    }
    for (name, err) in &result.failed {
        println!("{} {name}: {err}", "failed".red().bold());
    }
    for name in &result.blocked {
        println!("{} {name}", "blocked".yellow().bold());
    }
}
