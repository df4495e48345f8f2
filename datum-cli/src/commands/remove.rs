//! `datum remove <target> [--outs]` and `datum unprotect <path>...`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::Session;

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Tracking record or stage name.
    pub target: String,

    /// Delete the outputs from the workspace too.
    #[arg(long)]
    pub outs: bool,
}

impl RemoveArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let target = ctx
            .targets(&repo, std::slice::from_ref(&self.target))
            .pop()
            .unwrap_or_else(|| self.target.clone());
        let outs = repo
            .remove(&target, self.outs)
            .with_context(|| format!("failed to remove '{}'", self.target))?;
        for out in &outs {
            let verb = if self.outs { "Deleted" } else { "Untracked" };
            println!("✓ {verb} {}", out.display());
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct UnprotectArgs {
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

impl UnprotectArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let paths: Vec<PathBuf> = self.paths.iter().map(|p| ctx.path(p)).collect();
        repo.unprotect(&paths).context("failed to unprotect")?;
        Ok(())
    }
}
