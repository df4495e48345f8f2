//! `datum init [--force]`

use anyhow::{Context, Result};
use clap::Args;

use datum_repo::Repo;

use crate::Session;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Reinitialize an existing repository, resetting its configuration.
    #[arg(long, short = 'f')]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = Repo::init(&ctx.cwd, self.force)
            .with_context(|| format!("failed to initialize '{}'", ctx.cwd.display()))?;
        println!("✓ Initialized datum repository in {}", repo.root().display());
        Ok(())
    }
}
