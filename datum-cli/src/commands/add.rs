//! `datum add <path>... [--recursive]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::Session;

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Files or directories to track.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Track every file below a directory on its own.
    #[arg(long, short = 'R')]
    pub recursive: bool,
}

impl AddArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let paths: Vec<PathBuf> = self.paths.iter().map(|p| ctx.path(p)).collect();
        let stages = repo
            .add(&paths, self.recursive)
            .context("failed to add paths")?;
        for stage in &stages {
            println!("✓ Tracking {}", stage.name);
        }
        Ok(())
    }
}
