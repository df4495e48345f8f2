//! `datum status [<target>...] [--remote [<name>]] [--json]`

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use datum_pipeline::StageStatus;
use datum_repo::{StageReport, StatusReport};
use datum_sync::SyncStatus;

use crate::Session;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Stages or tracking records; everything when omitted.
    pub targets: Vec<String>,

    /// Also compare the cache with a remote (the default remote when no
    /// name is given).
    #[arg(long, short = 'r', num_args = 0..=1, default_missing_value = "", value_name = "NAME")]
    pub remote: Option<String>,

    /// Output machine-readable JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let targets = ctx.targets(&repo, &self.targets);
        let report = repo
            .status(&targets, self.remote.as_deref())
            .context("status check failed")?;

        if self.json {
            print_json(&report)
        } else {
            print_table(&report);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// JSON output
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusJson {
    clean: bool,
    stages: Vec<StageJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<RemoteJson>,
}

#[derive(Serialize)]
struct StageJson {
    name: String,
    kind: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Serialize)]
struct RemoteJson {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    unknown: BTreeMap<String, String>,
    missing_local: Vec<String>,
    missing_remote: Vec<String>,
    in_sync: usize,
}

fn print_json(report: &StatusReport) -> Result<()> {
    let payload = StatusJson {
        clean: report.is_clean(),
        stages: report
            .stages
            .iter()
            .map(|stage| StageJson {
                name: stage.name.clone(),
                kind: kind(stage),
                status: status_key(&stage.status),
                reason: match &stage.status {
                    StageStatus::Stale { reason } => Some(reason.to_string()),
                    _ => None,
                },
            })
            .collect(),
        remote: report.remote.as_ref().map(|remote| RemoteJson {
            unknown: remote
                .unknown
                .iter()
                .map(|(id, err)| (id.to_string(), err.clone()))
                .collect(),
            missing_local: remote.missing_local.iter().map(|id| id.to_string()).collect(),
            missing_remote: remote.missing_remote.iter().map(|id| id.to_string()).collect(),
            in_sync: remote.in_sync.len(),
        }),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Table output
// ---------------------------------------------------------------------------

#[derive(Tabled)]
struct StageRow {
    #[tabled(rename = "stage")]
    name: String,
    #[tabled(rename = "kind")]
    kind: &'static str,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "detail")]
    detail: String,
}

fn print_table(report: &StatusReport) {
    let stale: Vec<&StageReport> = report.stale().collect();
    if stale.is_empty() {
        println!("{} Data and pipelines are up to date.", "■".green().bold());
    } else {
        let rows: Vec<StageRow> = stale
            .into_iter()
            .map(|stage| StageRow {
                name: stage.name.clone(),
                kind: kind(stage),
                status: status_label(&stage.status),
                detail: match &stage.status {
                    StageStatus::Stale { reason } => reason.to_string(),
                    _ => String::new(),
                },
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    if let Some(remote) = &report.remote {
        print_remote(remote);
    }
}

fn print_remote(remote: &SyncStatus) {
    if remote.is_clean() {
        println!("{} Cache and remote are in sync.", "■".green().bold());
        return;
    }
    for id in &remote.missing_remote {
        println!("  {} {id}", "new".yellow().bold());
    }
    for id in &remote.missing_local {
        println!("  {} {id}", "missing".red().bold());
    }
    for (id, err) in &remote.unknown {
        println!("  {} {id}: {err}", "unknown".magenta().bold());
    }
    println!(
        "{} not on the remote, {} not in the cache, {} in sync",
        remote.missing_remote.len(),
        remote.missing_local.len(),
        remote.in_sync.len()
    );
}

fn kind(stage: &StageReport) -> &'static str {
    if stage.tracking {
        "data"
    } else {
        "stage"
    }
}

fn status_key(status: &StageStatus) -> &'static str {
    match status {
        StageStatus::Current => "current",
        StageStatus::Frozen => "frozen",
        StageStatus::Stale { .. } => "stale",
    }
}

fn status_label(status: &StageStatus) -> String {
    match status {
        StageStatus::Current => "CURRENT".green().to_string(),
        StageStatus::Frozen => "FROZEN".bright_black().to_string(),
        StageStatus::Stale { .. } => "STALE".yellow().bold().to_string(),
    }
}
