//! `datum push`, `datum fetch` and `datum pull`.

use anyhow::Result;
use clap::Args;

use datum_repo::SyncRequest;
use datum_sync::CheckoutOptions;

use super::{explain, print_checkout, print_transfer};
use crate::Session;

#[derive(Args, Debug)]
pub struct TransferArgs {
    /// Stages, tracking records or output paths; everything when omitted.
    pub targets: Vec<String>,

    /// Remote name; the default remote when omitted.
    #[arg(long, short = 'r')]
    pub remote: Option<String>,

    /// Parallel transfers.
    #[arg(long, short = 'j')]
    pub jobs: Option<usize>,
}

impl TransferArgs {
    fn request(&self, ctx: &Session, repo: &datum_repo::Repo) -> SyncRequest {
        SyncRequest {
            targets: ctx.targets(repo, &self.targets),
            jobs: self.jobs,
            remote: self.remote.clone(),
        }
    }

    pub fn push(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let summary = repo.push(&self.request(ctx, &repo)).map_err(explain)?;
        print_transfer(&summary);
        Ok(())
    }

    pub fn fetch(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let summary = repo.fetch(&self.request(ctx, &repo)).map_err(explain)?;
        print_transfer(&summary);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct PullArgs {
    #[command(flatten)]
    pub transfer: TransferArgs,

    /// Overwrite workspace files that differ from the recorded version.
    #[arg(long, short = 'f')]
    pub force: bool,
}

impl PullArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let request = self.transfer.request(ctx, &repo);
        let opts = CheckoutOptions {
            force: self.force,
            cleanup: false,
        };
        let (summary, report) = repo.pull(&request, opts).map_err(explain)?;
        print_transfer(&summary);
        print_checkout(&report);
        Ok(())
    }
}
