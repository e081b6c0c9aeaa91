//! Data source descriptors and the resolver that picks an owner's active source
//!
//! Every owner has at most one active descriptor. Replacing it is a single
//! upsert keyed by owner, so there is no window in which the owner has none.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::broadcast;

use crate::error::StoreError;

/// Where an owner's dashboard data comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A remote Google Sheets document, located by spreadsheet ID
    Spreadsheet,

    /// An uploaded file in the uploads directory, located by filename
    File,
}

/// The active data source of one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    /// Username owning the source
    pub owner_id: String,

    /// Spreadsheet or uploaded file
    pub kind: SourceKind,

    /// Spreadsheet ID or stored filename
    pub locator: String,

    /// Human readable name (original filename or document title)
    pub display_name: String,

    /// When the source was uploaded or linked
    pub uploaded_at: DateTime<Utc>,
}

impl DataSourceDescriptor {
    pub fn new(
        owner_id: impl Into<String>,
        kind: SourceKind,
        locator: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            kind,
            locator: locator.into(),
            display_name: display_name.into(),
            uploaded_at: Utc::now(),
        }
    }

    /// Uploaded file left behind when `self` is replaced by `next`
    pub fn orphaned_by(&self, next: Option<&DataSourceDescriptor>) -> Option<&str> {
        if self.kind != SourceKind::File {
            return None;
        }
        match next {
            Some(n) if n.kind == SourceKind::File && n.locator == self.locator => None,
            _ => Some(&self.locator),
        }
    }
}

/// Generic CRUD over the descriptor table, keyed by owner
pub trait DescriptorStore: Send + Sync {
    /// Most recent descriptor of `owner`, if any
    fn latest(&self, owner_id: &str) -> Result<Option<DataSourceDescriptor>, StoreError>;

    /// Atomically replace the owner's descriptor, returning the superseded one
    fn upsert(
        &self,
        descriptor: DataSourceDescriptor,
    ) -> Result<Option<DataSourceDescriptor>, StoreError>;

    /// Drop the owner's descriptor, returning it
    fn remove(&self, owner_id: &str) -> Result<Option<DataSourceDescriptor>, StoreError>;
}

/// Find the active data source of `owner_id`
///
/// Returns `Ok(None)` when the owner has never configured a source; the
/// caller is expected to prompt for setup.
pub fn resolve(
    store: &dyn DescriptorStore,
    owner_id: &str,
) -> Result<Option<DataSourceDescriptor>, StoreError> {
    let found = store.latest(owner_id)?;
    match &found {
        Some(d) => log::debug!("resolved {owner_id} -> {:?} {}", d.kind, d.locator),
        None => log::debug!("no data source for {owner_id}"),
    }
    Ok(found)
}

/// In-memory store, used by tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryDescriptorStore {
    entries: RwLock<BTreeMap<String, DataSourceDescriptor>>,
}

impl MemoryDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DescriptorStore for MemoryDescriptorStore {
    fn latest(&self, owner_id: &str) -> Result<Option<DataSourceDescriptor>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(owner_id).cloned())
    }

    fn upsert(
        &self,
        descriptor: DataSourceDescriptor,
    ) -> Result<Option<DataSourceDescriptor>, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.insert(descriptor.owner_id.clone(), descriptor))
    }

    fn remove(&self, owner_id: &str) -> Result<Option<DataSourceDescriptor>, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.remove(owner_id))
    }
}

/// Descriptor table persisted as a JSON object keyed by owner
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the table, so a crash never leaves a half-written file behind.
pub struct JsonDescriptorStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonDescriptorStore {
    /// Open (creating if needed) the table at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        if !path.exists() {
            write_json_atomic(&path, &BTreeMap::<String, DataSourceDescriptor>::new())?;
        }
        Ok(Self {
            path,
            lock: RwLock::new(()),
        })
    }

    fn load(&self) -> Result<BTreeMap<String, DataSourceDescriptor>, StoreError> {
        read_json(&self.path)
    }
}

impl DescriptorStore for JsonDescriptorStore {
    fn latest(&self, owner_id: &str) -> Result<Option<DataSourceDescriptor>, StoreError> {
        let _guard = self.lock.read().map_err(|_| StoreError::Poisoned)?;
        Ok(self.load()?.remove(owner_id))
    }

    fn upsert(
        &self,
        descriptor: DataSourceDescriptor,
    ) -> Result<Option<DataSourceDescriptor>, StoreError> {
        let _guard = self.lock.write().map_err(|_| StoreError::Poisoned)?;
        let mut table = self.load()?;
        let previous = table.insert(descriptor.owner_id.clone(), descriptor);
        write_json_atomic(&self.path, &table)?;
        Ok(previous)
    }

    fn remove(&self, owner_id: &str) -> Result<Option<DataSourceDescriptor>, StoreError> {
        let _guard = self.lock.write().map_err(|_| StoreError::Poisoned)?;
        let mut table = self.load()?;
        let removed = table.remove(owner_id);
        if removed.is_some() {
            write_json_atomic(&self.path, &table)?;
        }
        Ok(removed)
    }
}

/// Read a JSON document, treating an empty file as the default value
pub(crate) fn read_json<T>(path: &Path) -> Result<T, StoreError>
where
    T: serde::de::DeserializeOwned + Default,
{
    let data = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if data.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Serialize `value` next to `path` and rename it into place
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// What happened to an owner's data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceChange {
    Replaced,
    Removed,
}

/// Notification published whenever a descriptor changes
#[derive(Debug, Clone, Serialize)]
pub struct SourceEvent {
    pub owner_id: String,
    pub change: SourceChange,
    pub descriptor: DataSourceDescriptor,
}

/// Publish/subscribe channel for data source changes
///
/// Open dashboards subscribe to learn that their owner's data was replaced
/// in another tab or session.
#[derive(Clone)]
pub struct SourceEvents {
    sender: broadcast::Sender<SourceEvent>,
}

impl SourceEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: SourceEvent) {
        let receivers = self.sender.send(event).unwrap_or(0);
        log::debug!("source event delivered to {receivers} subscriber(s)");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.sender.subscribe()
    }
}

impl Default for SourceEvents {
    fn default() -> Self {
        Self::new(64)
    }
}
