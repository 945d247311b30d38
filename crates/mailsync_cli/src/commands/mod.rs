//! CLI command implementations.

pub mod reset;
pub mod show;

use mailsync_engine::CursorStore;
use mailsync_storage::FileProvider;
use std::path::Path;
use std::sync::Arc;

/// Opens the cursor store under `dir`, which must already exist.
pub fn open_store(dir: &Path) -> Result<(Arc<FileProvider>, CursorStore), Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("No cursor store found at {}", dir.display()).into());
    }
    let provider = Arc::new(FileProvider::open(dir)?);
    let store = CursorStore::new(provider.clone());
    Ok((provider, store))
}
