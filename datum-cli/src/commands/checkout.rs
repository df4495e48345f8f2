//! `datum checkout [<target>...] [--force] [--cleanup]`

use anyhow::Result;
use clap::Args;

use datum_sync::CheckoutOptions;

use super::{explain, print_checkout};
use crate::Session;

#[derive(Args, Debug)]
pub struct CheckoutArgs {
    /// Stages, tracking records or output paths; everything when omitted.
    pub targets: Vec<String>,

    /// Overwrite workspace files that differ from the recorded version.
    #[arg(long, short = 'f')]
    pub force: bool,

    /// Delete files inside directory outputs that the recorded version lacks.
    #[arg(long)]
    pub cleanup: bool,
}

impl CheckoutArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let targets = ctx.targets(&repo, &self.targets);
        let opts = CheckoutOptions {
            force: self.force,
            cleanup: self.cleanup,
        };
        let report = repo.checkout(&targets, opts).map_err(explain)?;
        print_checkout(&report);
        Ok(())
    }
}
