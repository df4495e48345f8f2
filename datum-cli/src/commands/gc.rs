//! `datum gc [--keep <id>...]`

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use clap::Args;

use datum_core::ContentId;

use crate::Session;

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Extra object ids to keep besides everything the workspace references.
    #[arg(long, value_name = "ID", value_parser = ContentId::parse)]
    pub keep: Vec<ContentId>,
}

impl GcArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let repo = ctx.repo()?;
        let keep: BTreeSet<ContentId> = self.keep.into_iter().collect();
        let report = repo.gc(&keep).context("garbage collection failed")?;
        println!(
            "Removed {} object(s), kept {}.",
            report.removed.len(),
            report.kept
        );
        Ok(())
    }
}
