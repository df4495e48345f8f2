//! `datum remote add|remove|modify|default|list`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use datum_core::config;

use crate::Session;

#[derive(Subcommand, Debug)]
pub enum RemoteCommand {
    /// Register a remote.
    Add(RemoteAddArgs),

    /// Forget a remote.
    Remove { name: String },

    /// Set or unset one option of a remote.
    Modify(RemoteModifyArgs),

    /// Show, set or clear the default remote.
    Default {
        name: Option<String>,

        #[arg(long, conflicts_with = "name")]
        unset: bool,
    },

    /// List remotes.
    List,
}

#[derive(Args, Debug)]
pub struct RemoteAddArgs {
    pub name: String,
    /// Filesystem path or object store url (s3://, gs://, az://, memory://).
    pub url: String,

    /// Make this the default remote.
    #[arg(long, short = 'd')]
    pub default: bool,

    /// Replace an existing remote of the same name.
    #[arg(long, short = 'f')]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct RemoteModifyArgs {
    pub name: String,
    pub option: String,
    #[arg(required_unless_present = "unset")]
    pub value: Option<String>,

    #[arg(long, conflicts_with = "value")]
    pub unset: bool,
}

pub fn run(ctx: &Session, cmd: RemoteCommand) -> Result<()> {
    let repo = ctx.repo()?;
    let root = repo.root();
    match cmd {
        RemoteCommand::Add(args) => {
            config::remote_add_at(root, &args.name, &args.url, args.default, args.force)
                .with_context(|| format!("failed to add remote '{}'", args.name))?;
            println!("✓ Added remote '{}' -> {}", args.name, args.url);
        }
        RemoteCommand::Remove { name } => {
            config::remote_remove_at(root, &name)
                .with_context(|| format!("failed to remove remote '{name}'"))?;
            println!("✓ Removed remote '{name}'");
        }
        RemoteCommand::Modify(args) => {
            let value = if args.unset { None } else { args.value.as_deref() };
            config::remote_modify_at(root, &args.name, &args.option, value)
                .with_context(|| format!("failed to modify remote '{}'", args.name))?;
        }
        RemoteCommand::Default { name, unset } => match (name, unset) {
            (Some(name), _) => config::remote_default_at(root, Some(&name))
                .with_context(|| format!("failed to set default remote '{name}'"))?,
            (None, true) => config::remote_default_at(root, None)
                .context("failed to clear the default remote")?,
            (None, false) => match &repo.config().core.remote {
                Some(name) => println!("{name}"),
                None => println!("No default remote."),
            },
        },
        RemoteCommand::List => {
            let remotes = config::remote_list_at(root).context("failed to read remotes")?;
            let default = repo.config().core.remote.as_deref();
            for (name, url) in remotes {
                let marker = if Some(name.as_str()) == default { "*" } else { " " };
                println!("{marker} {name}\t{url}");
            }
        }
    }
    Ok(())
}
