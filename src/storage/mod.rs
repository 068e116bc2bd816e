//! Storage backends for the fleet's current view and history
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database, one file shared with whatever
//!   reads the current view
//! - **In-Memory**: No persistence, for tests or `{"backend": "none"}`
//!
//! ## Usage
//!
//! ```no_run
//! use fleet_recorder::config::StorageConfig;
//! use fleet_recorder::storage::open_backend;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = open_backend(&StorageConfig::default(), None).await?;
//!     let current = backend.load_current().await?;
//!     println!("{} machines", current.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use schema::{MachineRecord, ToolRecord};

use crate::config::StorageConfig;

/// Open the configured backend. `path_override` (from `FLEET_DB`) wins over
/// the configured SQLite path.
pub async fn open_backend(
    config: &StorageConfig,
    path_override: Option<PathBuf>,
) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::None => {
            info!("using in-memory storage (no persistence)");
            Ok(Arc::new(memory::MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => {
            let path = path_override.unwrap_or_else(|| path.clone());
            Ok(Arc::new(sqlite::SqliteBackend::new(path).await?))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            let _ = path_override;
            Err(StorageError::Unavailable("sqlite"))
        }
    }
}
