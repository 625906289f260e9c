//! EZKV - Store Journal
//! The single backing file of a store. Every committed write transaction is
//! appended as one checksummed frame, so a commit is either fully on disk or
//! not at all.
//!
//! ## Binary Format
//! ```text
//! header: [magic: 8 bytes "EZKVLOG\0"][version: 4 bytes (LE)]
//! frame:  [payload_len: 4 bytes (LE)][crc32(payload): 4 bytes (LE)]
//!         [crc32(payload_len ++ crc32(payload)): 4 bytes (LE)][payload: bincode Vec<Record>]
//! ```
//!
//! The frame header carries its own checksum so a damaged length is reported
//! as corruption instead of being mistaken for a torn final commit.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{EzkvError, Result};
use crate::types::{Deadline, Key, Value};

use super::index::KeyIndex;

const MAGIC: &[u8; 8] = b"EZKVLOG\0";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 12;
const FRAME_HEADER_LEN: usize = 12;

/// One mutation inside a committed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Set {
        key: Key,
        value: Value,
        deadline: Option<Deadline>,
    },
    Delete {
        key: Key,
    },
}

impl Record {
    /// Apply this record to an index.
    pub fn apply(self, index: &mut KeyIndex) {
        match self {
            Record::Set {
                key,
                value,
                deadline,
            } => {
                index.upsert(key, value, deadline);
            }
            Record::Delete { key } => {
                index.remove(&key);
            }
        }
    }
}

/// What [`StoreLog::open`] found on disk.
#[derive(Debug, Default)]
pub struct Recovery {
    pub index: KeyIndex,
    /// Frames replayed.
    pub frames: usize,
    /// Records replayed.
    pub records: usize,
    /// Bytes dropped from a torn final frame.
    pub truncated_bytes: u64,
}

/// Append-only commit log backing a store.
pub struct StoreLog {
    path: PathBuf,
    file: File,
    /// Current logical length of the file in bytes.
    len: u64,
    sync_writes: bool,
    /// Set when a rewrite failed after replacing the file. Every later write
    /// is refused because the handle may point at the unlinked old log.
    poisoned: bool,
    #[cfg(test)]
    fail_next_append: bool,
    #[cfg(test)]
    fail_next_reopen: bool,
}

impl StoreLog {
    /// Open or create the log at `path` and replay it into a fresh index.
    ///
    /// Entries whose deadline is at or before `now_ms` are not loaded.
    pub fn open(path: impl Into<PathBuf>, sync_writes: bool, now_ms: u64) -> Result<(Self, Recovery)> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let mut recovery = Recovery::default();

        let len = if file_len == 0 {
            file.write_all(&Self::encode_header())?;
            file.sync_all()?;
            HEADER_LEN
        } else {
            let mut buf = Vec::with_capacity(file_len as usize);
            file.read_to_end(&mut buf)?;
            Self::check_header(&buf)?;
            let good_len = Self::replay(&buf, now_ms, &mut recovery)?;
            if good_len < file_len {
                recovery.truncated_bytes = file_len - good_len;
                log::warn!(
                    "Discarding torn commit at end of {:?} ({} bytes)",
                    path,
                    recovery.truncated_bytes
                );
                file.set_len(good_len)?;
                file.sync_all()?;
            }
            good_len
        };

        file.seek(SeekFrom::Start(len))?;

        Ok((
            Self {
                path,
                file,
                len,
                sync_writes,
                poisoned: false,
                #[cfg(test)]
                fail_next_append: false,
                #[cfg(test)]
                fail_next_reopen: false,
            },
            recovery,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the log in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= HEADER_LEN
    }

    fn encode_header() -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN as usize);
        buf.put_slice(MAGIC);
        buf.put_u32_le(VERSION);
        buf.to_vec()
    }

    fn check_header(buf: &[u8]) -> Result<()> {
        if buf.len() < HEADER_LEN as usize || &buf[..MAGIC.len()] != MAGIC {
            return Err(EzkvError::Corruption("not an ezkv store file".into()));
        }
        let mut version = &buf[MAGIC.len()..HEADER_LEN as usize];
        let version = version.get_u32_le();
        if version != VERSION {
            return Err(EzkvError::Corruption(format!(
                "unsupported format version {}",
                version
            )));
        }
        Ok(())
    }

    /// Encode one commit into a frame.
    pub fn encode_frame(records: &[Record]) -> Result<Vec<u8>> {
        let payload = bincode::serialize(records)?;
        let payload_len = Self::payload_len(payload.len())?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u32_le(payload_len);
        buf.put_u32_le(crc32fast::hash(&payload));
        let header_crc = crc32fast::hash(&buf[..8]);
        buf.put_u32_le(header_crc);
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    fn payload_len(len: usize) -> Result<u32> {
        u32::try_from(len).map_err(|_| {
            EzkvError::Serialization(format!(
                "commit of {} bytes exceeds the {} byte frame limit",
                len,
                u32::MAX
            ))
        })
    }

    /// Replay frames after the header. Returns the offset just past the
    /// last intact frame.
    fn replay(buf: &[u8], now_ms: u64, recovery: &mut Recovery) -> Result<u64> {
        let mut offset = HEADER_LEN as usize;

        while offset < buf.len() {
            let mut rest = &buf[offset..];
            if rest.len() < FRAME_HEADER_LEN {
                break; // torn frame header
            }
            let header = &buf[offset..offset + 8];
            let payload_len = rest.get_u32_le() as usize;
            let crc = rest.get_u32_le();
            if crc32fast::hash(header) != rest.get_u32_le() {
                if buf[offset..].iter().all(|&b| b == 0) {
                    break; // file was extended but the frame never landed
                }
                return Err(EzkvError::Corruption(format!(
                    "damaged frame header at offset {}",
                    offset
                )));
            }
            if rest.len() < payload_len {
                break; // torn payload
            }
            let payload = &rest[..payload_len];
            let frame_end = offset + FRAME_HEADER_LEN + payload_len;

            if crc32fast::hash(payload) != crc {
                if frame_end == buf.len() {
                    break; // final frame only partially reached the disk
                }
                return Err(EzkvError::Corruption(format!(
                    "checksum mismatch in frame at offset {}",
                    offset
                )));
            }

            let records: Vec<Record> = bincode::deserialize(payload).map_err(|e| {
                EzkvError::Corruption(format!("undecodable frame at offset {}: {}", offset, e))
            })?;
            recovery.frames += 1;
            recovery.records += records.len();
            for record in records {
                match record {
                    Record::Set {
                        deadline: Some(deadline),
                        ref key,
                        ..
                    } if deadline <= now_ms => {
                        recovery.index.remove(key);
                    }
                    record => record.apply(&mut recovery.index),
                }
            }
            offset = frame_end;
        }

        Ok(offset as u64)
    }

    /// Append one commit. On failure the file is cut back to its previous
    /// length and the error is returned as [`EzkvError::Persistence`].
    pub fn append(&mut self, records: &[Record]) -> Result<usize> {
        self.check_usable()?;
        let frame = Self::encode_frame(records)?;
        match self.write_frame(&frame) {
            Ok(()) => {
                self.len += frame.len() as u64;
                Ok(frame.len())
            }
            Err(err) => {
                log::warn!("Commit to {:?} failed, rolling back: {}", self.path, err);
                if let Err(rollback) = self.rollback() {
                    log::warn!("Could not truncate {:?} after failed commit: {}", self.path, rollback);
                }
                Err(EzkvError::Persistence(err))
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        {
            if std::mem::take(&mut self.fail_next_append) {
                // Leave a torn frame behind like a crash mid-write would.
                self.file.write_all(&frame[..frame.len() / 2])?;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected append failure",
                ));
            }
        }
        self.file.write_all(frame)?;
        if self.sync_writes {
            self.file.sync_data()?;
        } else {
            self.file.flush()?;
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(EzkvError::Persistence(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store log was lost by a failed rewrite",
            )));
        }
        Ok(())
    }

    fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.len)?;
        self.file.seek(SeekFrom::Start(self.len))?;
        Ok(())
    }

    /// Replace the log with one holding a single frame of `records`.
    ///
    /// The new log is written to a sibling temp file, synced, and renamed over
    /// the old one, so a crash leaves either the old or the new log in place.
    ///
    /// A failure before the rename removes the temp file and leaves this log
    /// untouched. A failure after it poisons the log, and every later
    /// append fails with [`EzkvError::Persistence`].
    pub fn rewrite(&mut self, records: &[Record]) -> Result<()> {
        self.check_usable()?;
        let tmp_path = self.path.with_extension("shrink");
        let staged = Self::write_compacted(&tmp_path, records).and_then(|new_len| {
            std::fs::rename(&tmp_path, &self.path)?;
            Ok(new_len)
        });
        let new_len = match staged {
            Ok(new_len) => new_len,
            Err(err) => {
                if tmp_path.exists() {
                    if let Err(cleanup) = std::fs::remove_file(&tmp_path) {
                        log::warn!("Could not remove {:?}: {}", tmp_path, cleanup);
                    }
                }
                return Err(err);
            }
        };

        if let Err(err) = self.reopen(new_len) {
            log::error!(
                "Lost handle on {:?} after rewrite, refusing further writes: {}",
                self.path,
                err
            );
            self.poisoned = true;
            return Err(EzkvError::Persistence(err));
        }
        Ok(())
    }

    /// Write a fresh log holding `records` to `path` and return its length.
    fn write_compacted(path: &Path, records: &[Record]) -> Result<u64> {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        tmp.write_all(&Self::encode_header())?;
        if !records.is_empty() {
            tmp.write_all(&Self::encode_frame(records)?)?;
        }
        tmp.sync_all()?;
        Ok(tmp.metadata()?.len())
    }

    /// Point this log at the renamed file, then make the rename durable.
    fn reopen(&mut self, new_len: u64) -> std::io::Result<()> {
        #[cfg(test)]
        {
            if std::mem::take(&mut self.fail_next_reopen) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected reopen failure",
                ));
            }
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(new_len))?;
        self.file = file;
        self.len = new_len;
        #[cfg(unix)]
        {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                File::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }

    /// Flush and fsync regardless of the sync policy.
    pub fn sync(&mut self) -> Result<()> {
        self.check_usable()?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_append_failure(&mut self) {
        self.fail_next_append = true;
    }

    #[cfg(test)]
    pub(crate) fn inject_reopen_failure(&mut self) {
        self.fail_next_reopen = true;
    }
}
