pub mod chat;
pub mod init;
pub mod sessions;

use aegis_config::{AppConfig, StoreBackend};
use aegis_core::session::SessionStore;
use aegis_store::{InMemorySessionStore, SqliteSessionStore};
use anyhow::Context;
use std::sync::Arc;

/// Open the session store selected by `[store]`.
pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemorySessionStore::new())),
        StoreBackend::Sqlite => {
            let path = config.store.db_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let store = SqliteSessionStore::new(&path.display().to_string())
                .await
                .with_context(|| format!("Failed to open session store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}
