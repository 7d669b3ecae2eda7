use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Storage manager for generated artifacts, rooted at the configured output folder.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
    local_base: Option<PathBuf>,
}

impl StorageManager {
    /// Create a new StorageManager with the specified configuration.
    ///
    /// The local backend creates its base directory on first use.
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let (store, local_base) = create_storage_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
            local_base,
        })
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    /// Access the resolved local base directory when using the local backend.
    pub fn local_base_path(&self) -> Option<&Path> {
        self.local_base.as_deref()
    }

    /// Store bytes at the specified location, replacing anything already there.
    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await.map(|_| ())
    }

    /// Retrieve bytes from the specified location, buffered in memory.
    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    /// Get a streaming handle to an object.
    ///
    /// Fails with `object_store::Error::NotFound` before yielding anything when
    /// the object is absent.
    pub async fn get_stream(
        &self,
        location: &str,
    ) -> object_store::Result<BoxStream<'static, object_store::Result<Bytes>>> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        Ok(result.into_stream())
    }

    /// Delete a single object. Deleting a missing object is not an error.
    pub async fn delete(&self, location: &str) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Check if an object exists at the specified location.
    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.store
            .head(&path)
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }
}

async fn create_storage_backend(
    cfg: &AppConfig,
) -> object_store::Result<(DynStore, Option<PathBuf>)> {
    match cfg.storage {
        StorageKind::Local => {
            let base = resolve_base_dir(cfg);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base.clone())?;
            Ok((Arc::new(store), Some(base)))
        }
        StorageKind::Memory => {
            let store = InMemory::new();
            Ok((Arc::new(store), None))
        }
    }
}

/// Resolve the absolute base directory used for local storage from config.
///
/// If `data_dir` is relative, it is resolved against the current working directory.
pub fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    if cfg.data_dir.starts_with('/') {
        PathBuf::from(&cfg.data_dir)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(&cfg.data_dir)
    }
}

/// Storage fixtures shared with the other workspace crates' tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;

    pub fn test_config_memory() -> AppConfig {
        AppConfig {
            data_dir: "/tmp/unused".into(),
            http_port: 0,
            storage: StorageKind::Memory,
            ..Default::default()
        }
    }

    pub fn test_config_local() -> AppConfig {
        let base = format!("/tmp/imagegen_test_storage_{}", uuid::Uuid::new_v4());
        AppConfig {
            data_dir: base,
            http_port: 0,
            storage: StorageKind::Local,
            ..Default::default()
        }
    }

    /// Storage manager that removes its local directory on drop.
    ///
    /// Not `Clone`: share the inner manager through `clone_storage` so only
    /// one owner removes the directory.
    pub struct TestStorageManager {
        storage: StorageManager,
        temp_dir: Option<PathBuf>,
    }

    impl TestStorageManager {
        pub async fn new_memory() -> object_store::Result<Self> {
            let storage = StorageManager::new(&test_config_memory()).await?;

            Ok(Self {
                storage,
                temp_dir: None,
            })
        }

        pub async fn new_local() -> object_store::Result<Self> {
            let storage = StorageManager::new(&test_config_local()).await?;
            let temp_dir = storage.local_base_path().map(Path::to_path_buf);

            Ok(Self { storage, temp_dir })
        }

        pub fn storage(&self) -> &StorageManager {
            &self.storage
        }

        pub fn clone_storage(&self) -> StorageManager {
            self.storage.clone()
        }
    }

    impl Drop for TestStorageManager {
        fn drop(&mut self) {
            if let Some(path) = &self.temp_dir {
                if path.exists() {
                    let _ = std::fs::remove_dir_all(path);
                }
            }
        }
    }
}
