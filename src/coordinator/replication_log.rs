//! Durable backlog of writes awaiting replication
//!
//! Entry format: [MAGIC][SEQUENCE u64][LEN u32][COMMAND][CRC32]
//!
//! Committed writes are appended before the client is answered. A separate
//! cursor file records the first sequence the peer has not yet confirmed, so
//! a restarted primary resends everything from the cursor onward. Once the
//! peer has confirmed every entry the log is truncated and numbering restarts.
//!
//! Unconfirmed entries are also kept in memory; the file is only read on open.

use crate::common::{crc32, Error, LogSyncPolicy, Result};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = [0x52, 0x50, 0x4C, 0x31]; // "RPL1"
const HEADER_LEN: u64 = 4 + 8 + 4;

/// Largest command accepted into the log
pub const MAX_COMMAND_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: u64,
    pub command: String,
}

pub struct ReplicationLog {
    cursor_path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    /// First sequence not yet confirmed by the peer
    cursor: u64,
    /// Entries at or after `cursor`, in sequence order
    unconfirmed: VecDeque<LogEntry>,
    sync_policy: LogSyncPolicy,
}

impl ReplicationLog {
    /// Open or create the log and its cursor.
    /// A torn or corrupted tail is cut off so later appends stay readable.
    pub fn open(path: impl AsRef<Path>, sync_policy: LogSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cursor_path = path.with_extension("cursor");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (entries, valid_len) = Self::scan(&path)?;
        let next_sequence = entries.last().map_or(0, |e| e.sequence + 1);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Replication log {} has a corrupted tail, truncating to {} bytes",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
        }

        let cursor = Self::read_cursor(&cursor_path)?.min(next_sequence);
        let unconfirmed = entries
            .into_iter()
            .filter(|e| e.sequence >= cursor)
            .collect();

        let log = Self {
            cursor_path,
            writer: BufWriter::new(file),
            next_sequence,
            cursor,
            unconfirmed,
            sync_policy,
        };
        log.persist_cursor(cursor)?;
        Ok(log)
    }

    /// Intact entries and the byte length they occupy
    fn scan(path: &Path) -> Result<(Vec<LogEntry>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut valid_len = 0;

        loop {
            match Self::read_entry_internal(&mut reader) {
                Ok(Some((entry, len))) => {
                    entries.push(entry);
                    valid_len += len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Replication log scan stopped at corrupted entry: {}", e);
                    break;
                }
            }
        }

        Ok((entries, valid_len))
    }

    /// Append a committed write. Returns the sequence assigned to it.
    pub fn append(&mut self, command: &str) -> Result<u64> {
        if command.len() > MAX_COMMAND_BYTES {
            return Err(Error::ReplicationLog(format!(
                "command of {} bytes exceeds log limit",
                command.len()
            )));
        }

        let sequence = self.next_sequence;
        self.write_entry(sequence, command.as_bytes())?;
        self.writer.flush()?;
        if self.sync_policy == LogSyncPolicy::Always {
            self.writer.get_ref().sync_data()?;
        }
        self.next_sequence += 1;
        self.unconfirmed.push_back(LogEntry {
            sequence,
            command: command.to_string(),
        });

        Ok(sequence)
    }

    fn write_entry(&mut self, sequence: u64, payload: &[u8]) -> Result<()> {
        let len = (payload.len() as u32).to_le_bytes();
        let seq = sequence.to_le_bytes();

        let mut checksum_data = Vec::with_capacity(12 + payload.len());
        checksum_data.extend_from_slice(&seq);
        checksum_data.extend_from_slice(&len);
        checksum_data.extend_from_slice(payload);
        let checksum = crc32(&checksum_data);

        self.writer.write_all(&LOG_MAGIC)?;
        self.writer.write_all(&seq)?;
        self.writer.write_all(&len)?;
        self.writer.write_all(payload)?;
        self.writer.write_all(&checksum.to_le_bytes())?;
        Ok(())
    }

    /// Entries the peer has not confirmed yet, in sequence order
    pub fn pending(&self) -> Vec<LogEntry> {
        self.unconfirmed.iter().cloned().collect()
    }

    /// Read one entry and the number of bytes it occupied
    fn read_entry_internal<R: Read>(reader: &mut R) -> Result<Option<(LogEntry, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != LOG_MAGIC {
            return Err(Error::ReplicationLog("Invalid log magic".into()));
        }

        let mut seq_bytes = [0u8; 8];
        reader.read_exact(&mut seq_bytes)?;
        let sequence = u64::from_le_bytes(seq_bytes);

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_COMMAND_BYTES {
            return Err(Error::ReplicationLog(format!("Entry length {} too large", len)));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut checksum_data = Vec::with_capacity(12 + len);
        checksum_data.extend_from_slice(&seq_bytes);
        checksum_data.extend_from_slice(&len_bytes);
        checksum_data.extend_from_slice(&payload);
        if crc32(&checksum_data) != stored_checksum {
            return Err(Error::ReplicationLog("Checksum mismatch".into()));
        }

        let command = String::from_utf8(payload)
            .map_err(|_| Error::ReplicationLog("Invalid UTF-8 in command".into()))?;

        Ok(Some((
            LogEntry { sequence, command },
            HEADER_LEN + len as u64 + 4,
        )))
    }

    /// Record that the peer confirmed `sequence` (and everything before it)
    pub fn acknowledge(&mut self, sequence: u64) -> Result<()> {
        let cursor = (sequence + 1).min(self.next_sequence);
        if cursor > self.cursor {
            self.persist_cursor(cursor)?;
            self.cursor = cursor;
            while self.unconfirmed.front().is_some_and(|e| e.sequence < cursor) {
                self.unconfirmed.pop_front();
            }
        }
        Ok(())
    }

    /// Truncate the log once every entry is confirmed. Returns whether it did.
    ///
    /// The cursor is reset on disk first: a failure at any step leaves the
    /// in-memory state untouched, and a crash part way through can only cause
    /// confirmed entries to be resent, never unsent ones to be skipped.
    pub fn compact_if_drained(&mut self) -> Result<bool> {
        if self.next_sequence == 0 || self.cursor < self.next_sequence {
            return Ok(false);
        }

        self.writer.flush()?;
        self.persist_cursor(0)?;
        self.writer.get_ref().set_len(0)?;
        self.writer.get_ref().sync_all()?;
        self.next_sequence = 0;
        self.cursor = 0;
        self.unconfirmed.clear();

        Ok(true)
    }

    /// Entries appended but not yet confirmed
    pub fn backlog(&self) -> u64 {
        self.next_sequence - self.cursor
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    fn read_cursor(path: &Path) -> Result<u64> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() != 12 {
            return Err(Error::ReplicationLog(format!(
                "cursor file {} is malformed",
                path.display()
            )));
        }

        let (value, checksum) = bytes.split_at(8);
        let stored = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        if crc32(value) != stored {
            return Err(Error::ReplicationLog("Cursor checksum mismatch".into()));
        }

        let mut seq = [0u8; 8];
        seq.copy_from_slice(value);
        Ok(u64::from_le_bytes(seq))
    }

    /// Write-then-rename so a crash never leaves a half-written cursor
    fn persist_cursor(&self, cursor: u64) -> Result<()> {
        let value = cursor.to_le_bytes();
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&value);
        bytes.extend_from_slice(&crc32(&value).to_le_bytes());

        let tmp = self.cursor_path.with_extension("cursor.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            if self.sync_policy == LogSyncPolicy::Always {
                file.sync_all()?;
            }
        }
        std::fs::rename(&tmp, &self.cursor_path)?;
        Ok(())
    }
}
