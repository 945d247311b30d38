//! Show command implementation.

use super::open_store;
use mailsync_protocol::{AccountId, CursorState};
use mailsync_storage::StorageProvider;
use serde::Serialize;
use std::path::Path;

/// How `show` prints its reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One aligned line per account.
    #[default]
    Text,
    /// A pretty-printed JSON array.
    Json,
}

/// Stored sync position of one account.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CursorReport {
    /// Account identifier.
    pub account: String,
    /// `absent`, `locked` or `valid`.
    pub state: &'static str,
    /// Stored cursor, when valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl CursorReport {
    fn new(account: &AccountId, state: &CursorState) -> Self {
        let (label, cursor) = match state {
            CursorState::Absent => ("absent", None),
            CursorState::Locked => ("locked", None),
            CursorState::Valid(cursor) => ("valid", Some(cursor.as_str().to_string())),
        };
        Self {
            account: account.to_string(),
            state: label,
            cursor,
        }
    }
}

/// Collects the reports of every stored account, or of `account` alone.
pub fn collect(
    dir: &Path,
    account: Option<&str>,
) -> Result<Vec<CursorReport>, Box<dyn std::error::Error>> {
    let (provider, store) = open_store(dir)?;

    let mut accounts = match account {
        Some(id) => vec![id.to_string()],
        None => provider.namespaces()?,
    };
    accounts.sort();

    accounts
        .into_iter()
        .map(|id| -> Result<CursorReport, Box<dyn std::error::Error>> {
            let account = AccountId::from(id);
            let state = store.load(&account)?;
            Ok(CursorReport::new(&account, &state))
        })
        .collect()
}

/// Runs the show command.
pub fn run(
    dir: &Path,
    account: Option<&str>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let reports = collect(dir, account)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Text if reports.is_empty() => {
            println!("No accounts in {}", dir.display());
        }
        OutputFormat::Text => {
            for report in &reports {
                match &report.cursor {
                    Some(cursor) => println!("{:<24} {:<8} {}", report.account, report.state, cursor),
                    None => println!("{:<24} {}", report.account, report.state),
                }
            }
        }
    }
    Ok(())
}
