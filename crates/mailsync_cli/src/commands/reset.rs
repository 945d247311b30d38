//! Reset command implementation.

use super::open_store;
use mailsync_protocol::AccountId;
use std::path::Path;
use tracing::info;

/// What to reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One account.
    Account(String),
    /// Every stored account.
    All,
}

/// Runs the reset command.
pub fn run(dir: &Path, target: &Target) -> Result<(), Box<dyn std::error::Error>> {
    let (_, store) = open_store(dir)?;

    match target {
        Target::Account(id) => {
            store.clear(&AccountId::from(id.as_str()))?;
            info!(account = %id, "cursor reset");
            println!("Reset {id}; it bootstraps on next sync");
        }
        Target::All => {
            store.clear_all()?;
            info!("all cursors reset");
            println!("Reset all accounts in {}", dir.display());
        }
    }
    Ok(())
}
