//! Rollback journal initialization.
use std::path::Path;
use std::sync::Arc;

use trackcap_configuration::RollbackSettings;

use super::error::Error;
use super::sqlite::Sqlite;
use super::RollbackStore;

/// Opens the journal database, creating the parent directory and the
/// schema when missing.
///
/// # Errors
///
/// Returns an [`Error`] when the directory cannot be created or the
/// database cannot be opened or migrated.
pub fn initialize_rollback_store(config: &RollbackSettings) -> Result<Arc<Box<dyn RollbackStore>>, Error> {
    if let Some(parent) = Path::new(&config.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let store = Sqlite::new(&config.database_path)?;
    store.create_tables()?;

    tracing::info!(path = %config.database_path, "rollback journal initialized");

    Ok(Arc::new(Box::new(store)))
}
