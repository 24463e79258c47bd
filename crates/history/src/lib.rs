//! History store implementations for Loopwright.

pub mod file_backend;
pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file_backend::FileHistory;
pub use in_memory::InMemoryHistory;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteHistory;

use loopwright_config::HistoryConfig;
use loopwright_core::error::HistoryError;
use loopwright_core::history::HistoryStore;
use std::sync::Arc;

/// Open the backend named by `config.backend`.
pub async fn open(config: &HistoryConfig) -> Result<Arc<dyn HistoryStore>, HistoryError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryHistory::new())),
        "file" => Ok(Arc::new(FileHistory::new(config.resolved_path()))),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let path = config.resolved_path();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    HistoryError::Storage(format!("Failed to create history directory: {e}"))
                })?;
            }
            let url = format!("sqlite://{}", path.display());
            Ok(Arc::new(SqliteHistory::new(&url).await?))
        }
        other => Err(HistoryError::Storage(format!(
            "History backend '{other}' is not available in this build"
        ))),
    }
}
