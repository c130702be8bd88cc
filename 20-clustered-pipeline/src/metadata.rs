//! Single-record metadata file, and an append-only journal of records in the
//! same layout.
//!
//! A [`MetadataStore`] file holds exactly one record,
//! `[i32 length][length bytes of bincode]`, rewritten in place at offset 0 on
//! every change. The in-memory value is authoritative: a failed rewrite is
//! logged and retried on the next change.
//!
//! A [`RecordJournal`] file is a run of such records. Only its tail is ever
//! rewritten: a truncation cuts the file, an append writes past the end.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::MetadataError;

const LENGTH_PREFIX: usize = 4;

pub struct MetadataStore<T> {
    path: PathBuf,
    file: File,
    current: T,
    dirty: bool,
}

impl<T> MetadataStore<T>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    /// Opens `path`, loading the stored record or writing `initial` when the
    /// file is new or empty. A damaged record is an error, never a default.
    pub fn open(
        path: impl AsRef<Path>,
        initial: impl FnOnce() -> T,
    ) -> Result<Self, MetadataError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let (current, dirty) = match decode_record(&raw)? {
            Some(value) => (value, false),
            None => (initial(), true),
        };
        let mut store = Self {
            path,
            file,
            current,
            dirty,
        };
        if store.dirty {
            store.flush()?;
        }
        debug!(path = %store.path.display(), "metadata loaded");
        Ok(store)
    }

    pub fn get(&self) -> &T {
        &self.current
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file lags behind the in-memory value.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replaces the value and rewrites the record. I/O failures are logged;
    /// the new value stays current in memory.
    pub fn store(&mut self, value: T) {
        if value == self.current && !self.dirty {
            return;
        }
        self.current = value;
        self.dirty = true;
        if let Err(err) = self.flush() {
            warn!(path = %self.path.display(), error = %err, "metadata rewrite failed");
        }
    }

    pub fn flush(&mut self) -> Result<(), MetadataError> {
        let body = bincode::serialize(&self.current)?;
        let len = i32::try_from(body.len())
            .map_err(|_| MetadataError::Corrupt(format!("record of {} bytes", body.len())))?;
        let mut record = Vec::with_capacity(LENGTH_PREFIX + body.len());
        record.extend_from_slice(&len.to_be_bytes());
        record.extend_from_slice(&body);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&record)?;
        self.file.set_len(record.len() as u64)?;
        self.file.sync_data()?;
        self.dirty = false;
        Ok(())
    }
}

/// Reads the record stored in `path` without opening it for writing.
pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Option<T>, MetadataError> {
    match std::fs::read(path) {
        Ok(raw) => decode_record(&raw),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Append-only sequence of length-prefixed bincode records.
pub struct RecordJournal<T> {
    path: PathBuf,
    file: File,
    /// Byte offset of every record.
    offsets: Vec<u64>,
    end: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T> RecordJournal<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Opens `path` and reads back every record in it.
    ///
    /// A record cut short at the end of the file is the trace of an
    /// interrupted append: it is dropped and the file shortened. A record that
    /// is complete but does not decode is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<T>), MetadataError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut records = Vec::new();
        let mut offsets = Vec::new();
        let mut at = 0usize;
        while raw.len() - at >= LENGTH_PREFIX {
            let mut prefix = [0u8; LENGTH_PREFIX];
            prefix.copy_from_slice(&raw[at..at + LENGTH_PREFIX]);
            let len = i32::from_be_bytes(prefix);
            if len < 0 {
                return Err(MetadataError::Corrupt(format!(
                    "record {} has length {len}",
                    records.len() + 1
                )));
            }
            let body = at + LENGTH_PREFIX;
            let next = body + len as usize;
            if next > raw.len() {
                break;
            }
            let record = bincode::deserialize(&raw[body..next]).map_err(|err| {
                MetadataError::Corrupt(format!("record {}: {err}", records.len() + 1))
            })?;
            offsets.push(at as u64);
            records.push(record);
            at = next;
        }
        if at < raw.len() {
            warn!(
                path = %path.display(),
                dropped = raw.len() - at,
                "dropping torn journal tail"
            );
            file.set_len(at as u64)?;
            file.sync_data()?;
        }
        debug!(path = %path.display(), records = records.len(), "journal loaded");

        let journal = Self {
            path,
            file,
            offsets,
            end: at as u64,
            _record: PhantomData,
        };
        Ok((journal, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Keeps the first `keep` records and drops the rest.
    pub fn truncate(&mut self, keep: usize) -> Result<(), MetadataError> {
        let Some(&cut) = self.offsets.get(keep) else {
            return Ok(());
        };
        self.file.set_len(cut)?;
        self.offsets.truncate(keep);
        self.end = cut;
        Ok(())
    }

    /// Writes `records` after the last one and syncs the file.
    pub fn append(&mut self, records: &[T]) -> Result<(), MetadataError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            let body = bincode::serialize(record)?;
            let len = i32::try_from(body.len())
                .map_err(|_| MetadataError::Corrupt(format!("record of {} bytes", body.len())))?;
            offsets.push(self.end + buf.len() as u64);
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&body);
        }

        // Cut whatever a failed earlier append left behind.
        self.file.set_len(self.end)?;
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.end += buf.len() as u64;
        self.offsets.extend(offsets);
        Ok(())
    }
}

fn decode_record<T: DeserializeOwned>(raw: &[u8]) -> Result<Option<T>, MetadataError> {
    if raw.is_empty() {
        return Ok(None);
    }
    if raw.len() < LENGTH_PREFIX {
        return Err(MetadataError::Corrupt(format!(
            "{} bytes is shorter than the length prefix",
            raw.len()
        )));
    }
    let mut prefix = [0u8; LENGTH_PREFIX];
    prefix.copy_from_slice(&raw[..LENGTH_PREFIX]);
    let len = i32::from_be_bytes(prefix);
    let body = &raw[LENGTH_PREFIX..];
    if len < 0 || len as usize > body.len() {
        return Err(MetadataError::Corrupt(format!(
            "length {len} but {} bytes persisted",
            body.len()
        )));
    }
    let value = bincode::deserialize(&body[..len as usize])
        .map_err(|err| MetadataError::Corrupt(err.to_string()))?;
    Ok(Some(value))
}
