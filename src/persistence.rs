//! Durable records with rolling backups.
//!
//! [`PersistenceManager`] writes one file per record: the previous version is
//! copied into `backup/`, the new bytes go to a temp file which is synced and
//! renamed over the record. [`PersistenceHandle`] is the fire-and-forget
//! front end: requests are queued to a single writer task, so writes from
//! different trades never interleave on disk.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::error::{CodecError, PersistenceError};

const TMP_SUFFIX: &str = ".tmp";

fn io_err(name: &str) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        name: name.to_owned(),
        source,
    }
}

pub struct PersistenceManager {
    dir: PathBuf,
    backup_dir: PathBuf,
    num_backups: usize,
    write_lock: Mutex<()>,
}

impl PersistenceManager {
    pub fn new(dir: impl Into<PathBuf>, num_backups: usize) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        let backup_dir = dir.join("backup");
        fs::create_dir_all(&backup_dir).map_err(io_err("backup directory"))?;
        Ok(Self {
            dir,
            backup_dir,
            num_backups,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Atomically replace record `name` with `bytes`.
    pub fn write(&self, name: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        let path = self.path(name);
        if path.exists() {
            self.rolling_backup(name, &path)?;
        }

        let tmp = self.dir.join(format!("{name}{TMP_SUFFIX}"));
        {
            let mut file = File::create(&tmp).map_err(io_err(name))?;
            file.write_all(bytes).map_err(io_err(name))?;
            file.sync_all().map_err(io_err(name))?;
        }
        fs::rename(&tmp, &path).map_err(io_err(name))?;
        trace!(name, len = bytes.len(), "record written");
        Ok(())
    }

    pub fn read_bytes(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(self.path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(name)(e)),
        }
    }

    pub fn read<T>(&self, name: &str) -> Result<Option<T>, PersistenceError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let Some(bytes) = self.read_bytes(name)? else {
            return Ok(None);
        };
        let value = minicbor::decode(&bytes).map_err(|e| CodecError::Decode {
            what: "persisted record",
            reason: format!("{name}: {e}"),
        })?;
        Ok(Some(value))
    }

    /// Record names starting with `prefix`, sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err("record directory"))? {
            let entry = entry.map_err(io_err("record directory"))?;
            if !entry.path().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with(prefix) && !name.ends_with(TMP_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove record `name`; its backups are kept.
    pub fn remove(&self, name: &str) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        let path = self.path(name);
        if path.exists() {
            self.rolling_backup(name, &path)?;
            fs::remove_file(&path).map_err(io_err(name))?;
        }
        Ok(())
    }

    /// Backup files of `name`, oldest first.
    pub fn backups(&self, name: &str) -> Result<Vec<PathBuf>, PersistenceError> {
        let prefix = format!("{name}.");
        let mut backups: Vec<(i64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.backup_dir).map_err(io_err(name))? {
            let entry = entry.map_err(io_err(name))?;
            let file_name = entry.file_name();
            let Some(stamp) = file_name
                .to_str()
                .and_then(|f| f.strip_prefix(&prefix))
                .and_then(|s| s.parse::<i64>().ok())
            else {
                continue;
            };
            backups.push((stamp, entry.path()));
        }
        backups.sort();
        Ok(backups.into_iter().map(|(_, p)| p).collect())
    }

    fn rolling_backup(&self, name: &str, path: &Path) -> Result<(), PersistenceError> {
        if self.num_backups == 0 {
            return Ok(());
        }
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        fs::copy(path, self.backup_dir.join(format!("{name}.{stamp}"))).map_err(io_err(name))?;

        let backups = self.backups(name)?;
        let excess = backups.len().saturating_sub(self.num_backups);
        for old in backups.into_iter().take(excess) {
            fs::remove_file(&old).map_err(io_err(name))?;
        }
        Ok(())
    }

    /// Apply a coalesced batch. A failing record does not stop the others.
    fn write_batch(&self, batch: BTreeMap<String, Option<Vec<u8>>>) -> Result<(), String> {
        let mut failure = None;
        for (name, bytes) in batch {
            let result = match bytes {
                Some(bytes) => self.write(&name, &bytes),
                None => self.remove(&name),
            };
            if let Err(e) = result {
                error!(name, error = %e, "persisting record failed");
                failure = Some(e.to_string());
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

enum Command {
    Write(String, Vec<u8>),
    Remove(String),
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Queue in front of a [`PersistenceManager`].
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<Command>,
    manager: Arc<PersistenceManager>,
}

impl PersistenceHandle {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(manager: Arc<PersistenceManager>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(manager.clone(), rx));
        Self { tx, manager }
    }

    pub fn manager(&self) -> &Arc<PersistenceManager> {
        &self.manager
    }

    /// Encode `value` now and write it in the background.
    pub fn request_persistence<T: minicbor::Encode<()>>(&self, name: impl Into<String>, value: &T) {
        let name = name.into();
        match minicbor::to_vec(value) {
            Ok(bytes) => self.send(Command::Write(name, bytes)),
            Err(e) => error!(name, error = %e, "failed to encode record for persistence"),
        }
    }

    pub fn request_remove(&self, name: impl Into<String>) {
        self.send(Command::Remove(name.into()));
    }

    /// Resolves once every request queued before this call is on disk.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(tx))
            .map_err(|_| PersistenceError::WriterGone)?;
        rx.await
            .map_err(|_| PersistenceError::WriterGone)?
            .map_err(PersistenceError::FlushFailed)
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            error!("persistence writer has shut down, request dropped");
        }
    }
}

async fn writer_loop(manager: Arc<PersistenceManager>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(first) = rx.recv().await {
        let mut batch: BTreeMap<String, Option<Vec<u8>>> = BTreeMap::new();
        let mut waiters = Vec::new();
        let mut requests = 0usize;
        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                Command::Write(name, bytes) => {
                    requests += 1;
                    batch.insert(name, Some(bytes));
                }
                Command::Remove(name) => {
                    requests += 1;
                    batch.insert(name, None);
                }
                Command::Flush(waiter) => waiters.push(waiter),
            }
            next = rx.try_recv().ok();
        }

        let result = if batch.is_empty() {
            Ok(())
        } else {
            debug!(requests, records = batch.len(), "writing coalesced records");
            let manager = manager.clone();
            tokio::task::spawn_blocking(move || manager.write_batch(batch))
                .await
                .unwrap_or_else(|e| Err(format!("persistence worker failed: {e}")))
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
    debug!("persistence writer stopped");
}
