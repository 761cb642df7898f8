use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{CacheEntry, CacheStore};
use crate::error::PipelineError;

/// CSV-backed cache table.
///
/// Entries live in memory behind a lock. `flush` writes a full snapshot to a
/// temporary file next to the table and renames it over the old one, so an
/// interrupted flush never leaves a truncated table behind.
pub struct FileCache<V> {
    path: PathBuf,
    entries: Mutex<HashMap<String, V>>,
    /// Serializes concurrent flushes so an older snapshot cannot land last
    flush_lock: Mutex<()>,
}

impl<V: CacheEntry> FileCache<V> {
    /// Load the table at `path`, or start empty if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();

        if path.exists() {
            let file = File::open(&path).map_err(|source| PipelineError::CacheIo {
                path: path.clone(),
                source,
            })?;
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .from_reader(file);

            for row in reader.deserialize::<V>() {
                let entry = row.map_err(|source| PipelineError::CacheFormat {
                    path: path.clone(),
                    source,
                })?;
                entries.insert(entry.cache_key(), entry);
            }
            info!("Loaded {} cached entries from {}", entries.len(), path.display());
        } else {
            debug!("No cache at {}, starting empty", path.display());
        }

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshot(&self, mut rows: Vec<(String, V)>) -> Result<(), PipelineError> {
        let io_err = |source: std::io::Error| PipelineError::CacheIo {
            path: self.path.clone(),
            source,
        };

        // Stable ordering keeps the table diffable between runs
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            for (_, entry) in &rows {
                writer
                    .serialize(entry)
                    .map_err(|source| PipelineError::CacheFormat {
                        path: self.path.clone(),
                        source,
                    })?;
            }
            writer.flush().map_err(io_err)?;
        }
        tmp.as_file_mut().flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!("Flushed {} entries to {}", rows.len(), self.path.display());
        Ok(())
    }
}

impl<V: CacheEntry> CacheStore<V> for FileCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.lock().get(key).cloned()
    }

    fn put(&self, key: String, value: V) {
        self.lock().insert(key, value);
    }

    fn flush(&self) -> Result<(), PipelineError> {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot: Vec<(String, V)> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.write_snapshot(snapshot)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}
