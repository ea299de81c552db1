use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{codes, keys, AppError, AppResult};

/// One page of keys from a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

/// Capability interface over the blob store. The engine depends only on this
/// contract; backends (and the in-memory fake used in tests) conform to it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, prefix: &str, token: Option<&str>) -> AppResult<ListPage>;
    async fn get(&self, key: &str) -> AppResult<Vec<u8>>;
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AppResult<String>;
    async fn delete(&self, key: &str) -> AppResult<()>;
    async fn head(&self, key: &str) -> AppResult<bool>;
}

/// Resolves the owner of a legacy object. `Ok(None)` means the object is an
/// orphan and must not be migrated.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn owner_for_legacy_key(&self, key: &str) -> AppResult<Option<String>>;
}

/// Reference swap emitted once an item is verified. The caller persists it in
/// its own database; the engine never writes application state directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerUpdate {
    pub old_ref: String,
    pub new_ref: String,
    pub owner_id: String,
}

/// Caller-owned pointer store. Returning `Ok` from `apply` is the
/// acknowledgement that makes the item eligible for old-object deletion.
#[async_trait]
pub trait PointerSink: Send + Sync {
    async fn apply(&self, update: &PointerUpdate) -> AppResult<()>;
}

/// Pointer sink that only logs the swap; used by the CLI when the host
/// application tracks references elsewhere.
pub struct LoggingPointerSink;

#[async_trait]
impl PointerSink for LoggingPointerSink {
    async fn apply(&self, update: &PointerUpdate) -> AppResult<()> {
        tracing::info!(
            target: "rescope",
            event = "pointer_update",
            old_ref = %update.old_ref,
            new_ref = %update.new_ref,
            owner_id = %update.owner_id,
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

#[derive(Default)]
struct MemoryFaults {
    corrupt_puts: HashSet<String>,
    transient_get: HashMap<String, u32>,
    transient_put: HashMap<String, u32>,
}

/// In-memory store used by the test suite and dry-run rehearsals. Fault hooks
/// simulate corrupted uploads and transient network failures.
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    faults: Mutex<MemoryFaults>,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(MemoryFaults::default()),
            page_size: 1000,
        }
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..Self::new()
        }
    }

    pub fn insert(&self, key: &str, bytes: &[u8]) {
        self.objects.lock().expect("memory store poisoned").insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: "application/octet-stream".into(),
            },
        );
    }

    /// Future `put` calls for `key` will write flipped bytes, so verification
    /// sees a hash mismatch.
    pub fn corrupt_next_put(&self, key: &str) {
        self.faults
            .lock()
            .expect("memory store poisoned")
            .corrupt_puts
            .insert(key.to_string());
    }

    /// The next `n` `get` calls for `key` fail with a transient store error.
    pub fn fail_gets(&self, key: &str, n: u32) {
        self.faults
            .lock()
            .expect("memory store poisoned")
            .transient_get
            .insert(key.to_string(), n);
    }

    /// The next `n` `put` calls for `key` fail with a transient store error.
    pub fn fail_puts(&self, key: &str, n: u32) {
        self.faults
            .lock()
            .expect("memory store poisoned")
            .transient_put
            .insert(key.to_string(), n);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("memory store poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("memory store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_transient(map: &mut HashMap<String, u32>, key: &str) -> bool {
        match map.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str, token: Option<&str>) -> AppResult<ListPage> {
        let objects = self.objects.lock().expect("memory store poisoned");
        let keys: Vec<String> = objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| token.map(|t| key.as_str() > t).unwrap_or(true))
            .take(self.page_size)
            .cloned()
            .collect();
        let next_token = if keys.len() == self.page_size {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next_token })
    }

    async fn get(&self, key: &str) -> AppResult<Vec<u8>> {
        {
            let mut faults = self.faults.lock().expect("memory store poisoned");
            if Self::take_transient(&mut faults.transient_get, key) {
                return Err(AppError::new(codes::STORE_TRANSIENT, "Injected get failure.")
                    .with_context("key", key.to_string()));
            }
        }
        let objects = self.objects.lock().expect("memory store poisoned");
        objects
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| {
                AppError::new(codes::STORE_PERMANENT, "Object not found.")
                    .with_context("key", key.to_string())
            })
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AppResult<String> {
        let corrupt = {
            let mut faults = self.faults.lock().expect("memory store poisoned");
            if Self::take_transient(&mut faults.transient_put, key) {
                return Err(AppError::new(codes::STORE_TRANSIENT, "Injected put failure.")
                    .with_context("key", key.to_string()));
            }
            faults.corrupt_puts.remove(key)
        };
        let stored = if corrupt {
            bytes.iter().map(|b| !b).collect()
        } else {
            bytes.to_vec()
        };
        self.objects.lock().expect("memory store poisoned").insert(
            key.to_string(),
            StoredObject {
                bytes: stored,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("memory://{key}"))
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.objects
            .lock()
            .expect("memory store poisoned")
            .remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> AppResult<bool> {
        Ok(self
            .objects
            .lock()
            .expect("memory store poisoned")
            .contains_key(key))
    }
}

const TMP_EXTENSION: &str = "rescope-tmp";

async fn write_and_sync(file: &mut async_fs::File, bytes: &[u8]) -> AppResult<()> {
    file.write_all(bytes).await.map_err(|err| {
        AppError::new(codes::STORE_TRANSIENT, "Failed to write object.")
            .with_context("error", err.to_string())
    })?;
    file.sync_all().await.map_err(|err| {
        AppError::new(codes::STORE_TRANSIENT, "Failed to sync object.")
            .with_context("error", err.to_string())
    })?;
    Ok(())
}

/// Filesystem-backed store used by the `migrate` CLI: keys map to files under
/// a root directory.
pub struct FsStore {
    root: PathBuf,
    page_size: usize,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: 1000,
        }
    }

    /// Rejects keys that would escape the root before touching the filesystem.
    fn path_for(&self, key: &str) -> AppResult<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(AppError::new(codes::STORE_PERMANENT, "Key escapes store root.")
                .with_context("key", key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_keys(root, &path, out)?;
            } else if path.extension().is_some_and(|ext| ext == TMP_EXTENSION) {
                // In-flight or abandoned sidecar, never a real object.
                continue;
            } else if let Ok(relative) = path.strip_prefix(root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list(&self, prefix: &str, token: Option<&str>) -> AppResult<ListPage> {
        let mut all = Vec::new();
        Self::collect_keys(&self.root, &self.root, &mut all).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "fs_store_list")
                .with_context("root", self.root.display().to_string())
        })?;
        all.sort();
        let keys: Vec<String> = all
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| token.map(|t| key.as_str() > t).unwrap_or(true))
            .take(self.page_size)
            .collect();
        let next_token = if keys.len() == self.page_size {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next_token })
    }

    async fn get(&self, key: &str) -> AppResult<Vec<u8>> {
        let path = self.path_for(key)?;
        async_fs::read(&path).await.map_err(|err| {
            let code = if err.kind() == std::io::ErrorKind::NotFound {
                codes::STORE_PERMANENT
            } else {
                codes::STORE_TRANSIENT
            };
            AppError::new(code, "Failed to read object.")
                .with_context("key", key.to_string())
                .with_context("error", err.to_string())
        })
    }

    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> AppResult<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent).await.map_err(|err| {
                AppError::new(codes::STORE_TRANSIENT, "Failed to create object directory.")
                    .with_context("key", key.to_string())
                    .with_context("error", err.to_string())
            })?;
        }
        // Write through a uniquely named sidecar then rename so readers never
        // observe a partially written object and concurrent puts of sibling
        // keys never share a sidecar path.
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{file_name}.{}.{TMP_EXTENSION}", Uuid::new_v4()));
        let mut file = async_fs::File::create(&tmp).await.map_err(|err| {
            AppError::new(codes::STORE_TRANSIENT, "Failed to create object.")
                .with_context("key", key.to_string())
                .with_context("error", err.to_string())
        })?;
        if let Err(err) = write_and_sync(&mut file, bytes).await {
            drop(file);
            let _ = async_fs::remove_file(&tmp).await;
            return Err(err.with_context("key", key.to_string()));
        }
        drop(file);
        if let Err(err) = async_fs::rename(&tmp, &path).await {
            let _ = async_fs::remove_file(&tmp).await;
            return Err(AppError::new(codes::STORE_TRANSIENT, "Failed to finalize object.")
                .with_context("key", key.to_string())
                .with_context("error", err.to_string()));
        }
        Ok(format!("file://{}", path.display()))
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let path = self.path_for(key)?;
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::new(codes::STORE_TRANSIENT, "Failed to delete object.")
                .with_context("key", key.to_string())
                .with_context("error", err.to_string())),
        }
    }

    async fn head(&self, key: &str) -> AppResult<bool> {
        let path = self.path_for(key)?;
        Ok(async_fs::metadata(&path).await.is_ok())
    }
}

/// Owner lookup backed by an item-id table, loadable from a JSON object of
/// `{ item_id: owner_id }`.
#[derive(Default)]
pub struct MapOwnerLookup {
    owners: HashMap<String, String>,
}

impl MapOwnerLookup {
    pub fn new(owners: HashMap<String, String>) -> Self {
        Self { owners }
    }

    pub fn from_json_file(path: &Path) -> AppResult<Self> {
        let data = std::fs::read(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "owner_map_read")
                .with_context("path", path.display().to_string())
        })?;
        let owners: HashMap<String, String> = serde_json::from_slice(&data).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "owner_map_decode")
                .with_context("path", path.display().to_string())
        })?;
        Ok(Self { owners })
    }

    pub fn insert(&mut self, item_id: &str, owner_id: &str) {
        self.owners.insert(item_id.to_string(), owner_id.to_string());
    }
}

#[async_trait]
impl OwnerLookup for MapOwnerLookup {
    async fn owner_for_legacy_key(&self, key: &str) -> AppResult<Option<String>> {
        let item_id = keys::item_id_from_legacy_key(key)?;
        Ok(self.owners.get(&item_id).cloned())
    }
}
