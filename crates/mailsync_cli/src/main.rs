//! MailSync CLI
//!
//! Operator tools for the cursor store a MailSync client keeps on disk.
//! Every account owns one namespace file; these commands read or remove
//! them without starting a sync.

mod commands;

use clap::{ArgGroup, Parser, Subcommand};
use commands::reset::Target;
use commands::show::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailsync", author, version, about, long_about = None)]
struct Cli {
    /// Cursor store directory
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the stored cursor of each account
    Show {
        /// Only this account
        #[arg(short, long)]
        account: Option<String>,

        #[arg(short, long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// Forget stored cursors so the next sync bootstraps
    #[command(group(ArgGroup::new("target").required(true).args(["account", "all"])))]
    Reset {
        /// Forget this account
        #[arg(short, long)]
        account: Option<String>,

        /// Forget every account
        #[arg(long)]
        all: bool,
    },

    /// Print version information
    Version,
}

impl Cli {
    fn store_dir(&self) -> Result<&PathBuf, String> {
        self.dir
            .as_ref()
            .ok_or_else(|| "--dir is required for this command".to_string())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Command::Show { account, format } => {
            commands::show::run(cli.store_dir()?, account.as_deref(), *format)?;
        }
        Command::Reset { account, all } => {
            let target = match account {
                Some(id) if !all => Target::Account(id.clone()),
                _ => Target::All,
            };
            commands::reset::run(cli.store_dir()?, &target)?;
        }
        Command::Version => println!("mailsync {}", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}
