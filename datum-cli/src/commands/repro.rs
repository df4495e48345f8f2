//! `datum repro [<stage>...] [--force]`

use anyhow::Result;
use clap::Args;

use super::{explain, print_repro};
use crate::Session;

#[derive(Args, Debug)]
pub struct ReproArgs {
    /// Stages to reproduce, with everything upstream; the whole pipeline
    /// when omitted.
    pub stages: Vec<String>,

    /// Run selected stages even when they are up to date.
    #[arg(long, short = 'f')]
    pub force: bool,
}

impl ReproArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let result = repo.repro(&self.stages, self.force).map_err(explain)?;
        print_repro(&result);
        if result.ran.is_empty() {
            println!("Pipeline is up to date.");
        }
        Ok(())
    }
}
