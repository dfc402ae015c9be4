//! Durable storage for the node instance registry.
//!
//! Each instance is persisted as one JSON record holding its node set. The
//! registry writes a record before it changes memory, so a record on disk
//! always describes a state the registry has accepted. A retired instance
//! keeps its record as a tombstone with no nodes, so late registrations are
//! still rejected after a restart.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::StoreError;

const RECORD_EXTENSION: &str = "json";
const TMP_PREFIX: &str = ".tmp-";

/// Persisted instance to node set mapping.
pub type InstanceRecords = BTreeMap<String, BTreeSet<String>>;

/// Backing store for [`super::NodeInstanceRegistry`].
///
/// Calls are synchronous and made while the registry holds the lock of the
/// affected instance, so implementations see at most one write per instance
/// at a time.
pub trait RegistryStore: Send + Sync {
    /// Loads every persisted instance record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the records cannot be read or parsed.
    fn load_all(&self) -> Result<InstanceRecords, StoreError>;

    /// Replaces the record of `instance_id` with `nodes`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record cannot be written.
    fn save(&self, instance_id: &str, nodes: &BTreeSet<String>) -> Result<(), StoreError>;

    /// Replaces the record of `instance_id` with a retirement tombstone.
    /// Tombstones are excluded from [`RegistryStore::load_all`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the tombstone cannot be written.
    fn retire(&self, instance_id: &str) -> Result<(), StoreError>;

    /// Returns true when `instance_id` has a retirement tombstone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record exists but cannot be read.
    fn is_retired(&self, instance_id: &str) -> Result<bool, StoreError>;
}

#[derive(Serialize)]
struct RecordRef<'a> {
    instance_id: &'a str,
    nodes: &'a BTreeSet<String>,
    retired: bool,
}

#[derive(Deserialize)]
struct Record {
    instance_id: String,
    nodes: BTreeSet<String>,
    #[serde(default)]
    retired: bool,
}

/// Stores one JSON file per instance inside a state directory.
///
/// File names are the hex encoding of the instance identifier so arbitrary
/// provider identifiers map to safe names. Writes go to a temporary file that
/// is renamed over the record, so readers never observe partial records. The
/// directory is synced after every rename.
#[derive(Debug)]
pub struct DirectoryStore {
    root: Utf8PathBuf,
    dir: Dir,
}

impl DirectoryStore {
    /// Opens `root`, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be created or
    /// opened.
    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        let path = root.as_ref().to_path_buf();
        Dir::create_ambient_dir_all(&path, ambient_authority()).map_err(|err| io_error(&path, &err))?;
        let dir =
            Dir::open_ambient_dir(&path, ambient_authority()).map_err(|err| io_error(&path, &err))?;
        Ok(Self { root: path, dir })
    }

    /// Returns the state directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn record_path(&self, file_name: &str) -> Utf8PathBuf {
        self.root.join(file_name)
    }

    fn read_record(&self, file_name: &str) -> Result<Record, StoreError> {
        let path = self.record_path(file_name);
        let contents = self
            .dir
            .read_to_string(file_name)
            .map_err(|err| io_error(&path, &err))?;
        let record: Record =
            serde_json::from_str(&contents).map_err(|err| StoreError::Decode {
                path: path.clone(),
                message: err.to_string(),
            })?;

        let expected = record_file_name(&record.instance_id);
        if expected != file_name {
            return Err(StoreError::Decode {
                path,
                message: format!(
                    "record names instance {} but file should be {expected}",
                    record.instance_id
                ),
            });
        }
        Ok(record)
    }

    fn write_record(
        &self,
        instance_id: &str,
        nodes: &BTreeSet<String>,
        retired: bool,
    ) -> Result<(), StoreError> {
        let record = RecordRef {
            instance_id,
            nodes,
            retired,
        };
        let payload = serde_json::to_vec_pretty(&record).map_err(|err| StoreError::Encode {
            instance_id: instance_id.to_owned(),
            message: err.to_string(),
        })?;
        self.write_atomically(&record_file_name(instance_id), &payload)
    }

    fn write_atomically(&self, file_name: &str, payload: &[u8]) -> Result<(), StoreError> {
        let tmp_name = format!("{TMP_PREFIX}{}", Uuid::new_v4().simple());
        let tmp_path = self.record_path(&tmp_name);

        let written = self
            .dir
            .create(&tmp_name)
            .and_then(|mut file| {
                file.write_all(payload)?;
                file.sync_all()
            })
            .and_then(|()| self.dir.rename(&tmp_name, &self.dir, file_name));

        if let Err(err) = written {
            if let Err(cleanup) = self.dir.remove_file(&tmp_name) {
                debug!(path = %tmp_path, error = %cleanup, "temporary record not removed");
            }
            return Err(io_error(&self.record_path(file_name), &err));
        }
        self.sync_dir()
    }

    /// Flushes directory entries so a completed rename survives a crash.
    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), StoreError> {
        self.dir
            .as_cap_std()
            .try_clone()
            .and_then(|dir| dir.into_std_file().sync_all())
            .map_err(|err| io_error(&self.root, &err))
    }

    #[cfg(not(unix))]
    #[expect(
        clippy::unnecessary_wraps,
        reason = "directory handles cannot be synced on this platform"
    )]
    const fn sync_dir(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl RegistryStore for DirectoryStore {
    fn load_all(&self) -> Result<InstanceRecords, StoreError> {
        let entries = self.dir.entries().map_err(|err| io_error(&self.root, &err))?;
        let mut records = InstanceRecords::new();
        for entry in entries {
            let file_name = entry
                .and_then(|item| item.file_name())
                .map_err(|err| io_error(&self.root, &err))?;
            if file_name.starts_with(TMP_PREFIX) {
                warn!(path = %self.record_path(&file_name), "ignoring interrupted registry write");
                continue;
            }
            if Utf8Path::new(&file_name).extension() != Some(RECORD_EXTENSION) {
                continue;
            }
            let record = self.read_record(&file_name)?;
            if record.retired {
                continue;
            }
            records.insert(record.instance_id, record.nodes);
        }
        debug!(root = %self.root, instances = records.len(), "loaded registry records");
        Ok(records)
    }

    fn save(&self, instance_id: &str, nodes: &BTreeSet<String>) -> Result<(), StoreError> {
        self.write_record(instance_id, nodes, false)
    }

    fn retire(&self, instance_id: &str) -> Result<(), StoreError> {
        self.write_record(instance_id, &BTreeSet::new(), true)?;
        debug!(root = %self.root, %instance_id, "wrote retirement tombstone");
        Ok(())
    }

    fn is_retired(&self, instance_id: &str) -> Result<bool, StoreError> {
        let file_name = record_file_name(instance_id);
        match self.dir.try_exists(&file_name) {
            Ok(true) => Ok(self.read_record(&file_name)?.retired),
            Ok(false) => Ok(false),
            Err(err) => Err(io_error(&self.record_path(&file_name), &err)),
        }
    }
}

fn record_file_name(instance_id: &str) -> String {
    format!("{}.{RECORD_EXTENSION}", hex::encode(instance_id))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// In-memory store for tests and single-process deployments that accept
/// losing the registry on restart.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<InstanceRecords>>,
    retired: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `records`.
    #[must_use]
    pub fn with_records(records: InstanceRecords) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
            retired: Arc::default(),
        }
    }

    /// Returns a copy of the stored records.
    #[must_use]
    pub fn records(&self) -> InstanceRecords {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RegistryStore for MemoryStore {
    fn load_all(&self) -> Result<InstanceRecords, StoreError> {
        Ok(self.records())
    }

    fn save(&self, instance_id: &str, nodes: &BTreeSet<String>) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_owned(), nodes.clone());
        Ok(())
    }

    fn retire(&self, instance_id: &str) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_owned());
        Ok(())
    }

    fn is_retired(&self, instance_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(instance_id))
    }
}
