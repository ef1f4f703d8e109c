//! On-disk record store.
//!
//! Every record lives in its own directory under the store root, as a
//! pretty-printed JSON file (`<root>/<name>/machine.json`,
//! `<root>/<name>/image.json`). The files are the source of truth: the
//! daemon's in-memory state is rebuilt from [`Store::list`] at startup, and
//! every mutation is written back before it returns.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{event, Level};

use meridian_rs::config::DaemonConfig;
use meridian_rs::image::Image;
use meridian_rs::machine::Machine;

const WATCH_CAPACITY: usize = 64;

pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// File name of the record inside its directory.
    const FILE_NAME: &'static str;

    fn name(&self) -> &str;
}

impl Record for Machine {
    const FILE_NAME: &'static str = "machine.json";

    fn name(&self) -> &str {
        &self.name
    }
}

impl Record for Image {
    const FILE_NAME: &'static str = "image.json";

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0:?} already exists")]
    AlreadyExists(String),

    #[error("{0:?} not found")]
    NotFound(String),

    #[error("invalid name {0:?}")]
    InvalidName(String),
}

#[async_trait]
pub trait Store<T: Record>: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<T>>;

    async fn list(&self) -> Result<Vec<T>>;

    /// Fails with [`StoreError::AlreadyExists`] if a record of that name is
    /// present.
    async fn create(&self, record: &T) -> Result<()>;

    /// Fails with [`StoreError::NotFound`] if no record of that name exists.
    async fn update(&self, record: &T) -> Result<()>;

    /// Remove the record together with its directory. Returns the removed
    /// record, if there was one.
    async fn delete(&self, name: &str) -> Result<Option<T>>;

    async fn delete_collection(&self) -> Result<usize>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}

/// Reject names that would escape the store root.
pub fn check_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

pub struct FileStore<T> {
    root: PathBuf,
    events: broadcast::Sender<WatchEvent<T>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> FileStore<T> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        FileStore {
            root: root.into(),
            events,
            _record: PhantomData,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join(T::FILE_NAME)
    }

    async fn read(&self, path: &Path) -> Result<Option<T>> {
        let contents = match tokio::fs::read(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read record {path:?}")),
        };
        let record = serde_json::from_slice(&contents)
            .with_context(|| format!("parse record {path:?}"))?;
        Ok(Some(record))
    }

    async fn write(&self, record: &T) -> Result<()> {
        let path = self.record_path(record.name());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create record directory {parent:?}"))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?)
            .await
            .with_context(|| format!("write record {tmp:?}"))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename record into {path:?}"))
    }

    fn notify(&self, event: WatchEvent<T>) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl<T: Record> Store<T> for FileStore<T> {
    async fn get(&self, name: &str) -> Result<Option<T>> {
        check_name(name)?;
        self.read(&self.record_path(name)).await
    }

    async fn list(&self) -> Result<Vec<T>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("list {:?}", self.root)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join(T::FILE_NAME);
            match self.read(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => (),
                Err(e) => event!(Level::WARN, ?path, "Skipping unreadable record: {e:#}"),
            }
        }
        records.sort_by(|a: &T, b: &T| a.name().cmp(b.name()));
        Ok(records)
    }

    async fn create(&self, record: &T) -> Result<()> {
        check_name(record.name())?;
        if tokio::fs::try_exists(self.record_path(record.name())).await? {
            return Err(StoreError::AlreadyExists(record.name().to_string()).into());
        }
        self.write(record).await?;
        self.notify(WatchEvent::Added(record.clone()));
        Ok(())
    }

    async fn update(&self, record: &T) -> Result<()> {
        check_name(record.name())?;
        if !tokio::fs::try_exists(self.record_path(record.name())).await? {
            return Err(StoreError::NotFound(record.name().to_string()).into());
        }
        self.write(record).await?;
        self.notify(WatchEvent::Modified(record.clone()));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<Option<T>> {
        check_name(name)?;
        let record = self.read(&self.record_path(name)).await?;
        let dir = self.root.join(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(e).with_context(|| format!("remove {dir:?}")),
        }
        if let Some(ref record) = record {
            self.notify(WatchEvent::Deleted(record.clone()));
        }
        Ok(record)
    }

    async fn delete_collection(&self) -> Result<usize> {
        let records = self.list().await?;
        let mut deleted = 0;
        for record in records {
            if self.delete(record.name()).await?.is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}

/// The daemon's local backend: record stores rooted in the configured
/// directory tree, constructed once at startup and handed to every
/// component that needs it.
pub struct LocalBackend {
    pub machines: Arc<FileStore<Machine>>,
    pub images: Arc<FileStore<Image>>,
}

impl LocalBackend {
    pub async fn open(config: &DaemonConfig) -> Result<Self> {
        for dir in [config.vms_dir(), config.images_dir(), config.config_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create {dir:?}"))?;
        }
        Ok(LocalBackend {
            machines: Arc::new(FileStore::new(config.vms_dir())),
            images: Arc::new(FileStore::new(config.images_dir())),
        })
    }
}
