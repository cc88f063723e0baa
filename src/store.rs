//! src/store.rs
//!
//! The persistent backing store: a durable `Key -> Record` map, written on
//! every accepted update and flushed to disk immediately. Open question:
//! the original had multiple keystore drafts that disagreed on whether to
//! sync every write or batch them; this crate always syncs on every write,
//! favoring the safer behavior over throughput.

use crate::domain::Key;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A single stored record: a value (or tombstone), its timestamp, and the
/// peer name that produced it. Mirrors `Keystore`'s in-memory `Record` so
/// the file format can be serialized directly with `serde_json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRecord {
    pub value: Option<serde_json::Value>,
    pub timestamp: u64,
    pub origin: String,
}

/// A durable key-value map backed by a single JSON file.
///
/// Multiple processes must not open the same backing file concurrently;
/// this type does not itself enforce that, treating the filesystem as an
/// external collaborator rather than guarding it itself.
pub struct Store {
    path: PathBuf,
    entries: HashMap<String, StoredRecord>,
}

impl Store {
    /// Opens (or creates) the backing file at `path`, loading any existing
    /// entries into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Self { path, entries })
    }

    pub fn get(&self, key: &Key) -> Option<&StoredRecord> {
        self.entries.get(key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoredRecord)> {
        self.entries.iter()
    }

    /// Writes `record` for `key` and immediately flushes the whole map to
    /// disk (`sync`) after each accepted write, remote or local. On
    /// failure the write is rolled back in memory and a
    /// `Error::Persistence` is returned so the caller treats it as not
    /// accepted.
    pub fn put(&mut self, key: Key, record: StoredRecord) -> Result<()> {
        let previous = self.entries.insert(key.0.clone(), record);
        if let Err(e) = self.sync() {
            // Roll back so in-memory state never diverges from disk.
            match previous {
                Some(prev) => {
                    self.entries.insert(key.0, prev);
                }
                None => {
                    self.entries.remove(&key.0);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::Persistence(format!("creating data dir: {e}")))?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)
                .map_err(|e| Error::Persistence(format!("opening temp data file: {e}")))?;
            let mut writer = BufWriter::new(&file);
            serde_json::to_writer(&mut writer, &self.entries)
                .map_err(|e| Error::Persistence(format!("serializing data file: {e}")))?;
            writer
                .flush()
                .map_err(|e| Error::Persistence(format!("flushing data file: {e}")))?;
            file.sync_all()
                .map_err(|e| Error::Persistence(format!("fsyncing data file: {e}")))?;
        }
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::Persistence(format!("renaming data file: {e}")))?;
        Ok(())
    }
}
