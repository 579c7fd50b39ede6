// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Event Log - durable per-channel record of messages and state snapshots
//!
//! One SQLite file per live channel with three tables:
//!
//! - `messages`: every published sequence message, append-only, ordered by id
//! - `state_sequences`: one row per state snapshot; `end_us` is NULL while
//!   the snapshot is the active one
//! - `state_log`: the entries of each snapshot, keyed by `seq_id`
//!
//! Writes go through a single locked writer connection. Reads use their own
//! connection against the WAL journal, so a replay scanning the log does not
//! hold up a live session appending to it.

use crate::error::{StorageError, StorageResult};
use crate::state_store::StateEntry;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use sisdk_core::time::micros_to_datetime;
use sisdk_core::{now_micros, ChannelId, StorageConfig};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Rows fetched per keyset page while iterating messages
const PAGE_SIZE: usize = 256;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        message         BLOB    NOT NULL,
        timestamp_us    INTEGER NOT NULL,
        datetime        TEXT    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS state_sequences (
        seq_id          TEXT    PRIMARY KEY,
        start_us        INTEGER NOT NULL,
        end_us          INTEGER,
        updated_at      TEXT    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS state_log (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        seq_id          TEXT    NOT NULL,
        key             TEXT    NOT NULL,
        value           TEXT    NOT NULL,
        message         BLOB    NOT NULL,
        timestamp_us    INTEGER NOT NULL,
        updated_at_us   INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp_us);
    CREATE INDEX IF NOT EXISTS idx_sequences_start ON state_sequences(start_us);
    CREATE INDEX IF NOT EXISTS idx_state_log_seq ON state_log(seq_id);
    CREATE INDEX IF NOT EXISTS idx_state_log_timestamp ON state_log(timestamp_us);
";

/// One recorded sequence message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogRecord {
    pub id: i64,
    pub message: Vec<u8>,
    pub timestamp_us: i64,
    /// RFC 3339 rendering of `timestamp_us`
    pub datetime: String,
}

/// Metadata of one state snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSequence {
    pub seq_id: String,
    pub start_us: i64,
    /// `None` while this is the active snapshot
    pub end_us: Option<i64>,
    pub updated_at: String,
}

impl StateSequence {
    pub fn is_open(&self) -> bool {
        self.end_us.is_none()
    }
}

/// One entry of a state snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLogRecord {
    pub seq_id: String,
    pub key: String,
    pub value: String,
    pub encoded_message: Vec<u8>,
    /// When the snapshot holding this entry was taken
    pub timestamp_us: i64,
    /// When the entry itself was last updated
    pub updated_at_us: i64,
}

impl StateLogRecord {
    pub fn to_entry(&self) -> StateEntry {
        StateEntry {
            key: self.key.clone(),
            human_value: self.value.clone(),
            encoded_message: self.encoded_message.clone(),
            updated_at_us: self.updated_at_us,
        }
    }
}

/// A sequence together with all of its entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub sequence: StateSequence,
    pub records: Vec<StateLogRecord>,
}

impl StateSnapshot {
    pub fn entries(&self) -> Vec<StateEntry> {
        self.records.iter().map(StateLogRecord::to_entry).collect()
    }
}

/// Which state sequence to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceSelector {
    /// First snapshot recorded, regardless of its timestamp
    First,
    /// Snapshot with this id
    Id(String),
    /// Latest snapshot started at or before this timestamp
    At(i64),
}

pub struct EventLog {
    path: PathBuf,
    /// `None` for a log opened read-only
    writer: Option<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl EventLog {
    /// Open (creating if needed) the log at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(&path)?;
        let mode: String =
            writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open(&path)?;
        reader.busy_timeout(BUSY_TIMEOUT)?;
        reader.pragma_update(None, "query_only", true)?;

        info!(path = %path.display(), journal_mode = %mode, "Event log opened");

        Ok(Self {
            path,
            writer: Some(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    /// Open an existing log for reading only.
    ///
    /// Nothing is created: a missing file is [`StorageError::NotFound`] and
    /// every write returns [`StorageError::ReadOnly`].
    pub fn open_read_only(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(StorageError::NotFound(path));
        }

        let reader = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        info!(path = %path.display(), "Event log opened read-only");

        Ok(Self {
            path,
            writer: None,
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    /// Open the log of `channel` under the configured log directory
    pub fn open_for(config: &StorageConfig, channel: &ChannelId) -> StorageResult<Self> {
        Self::open(config.log_path(channel))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.writer.is_none()
    }

    fn writer(&self) -> StorageResult<&Mutex<Connection>> {
        self.writer
            .as_ref()
            .ok_or_else(|| StorageError::ReadOnly(self.path.clone()))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn save_message(&self, message: &[u8]) -> Option<i64> {
        self.save_message_at(message, now_micros())
    }

    /// Append a message; failures are logged and the write is dropped
    pub fn save_message_at(&self, message: &[u8], timestamp_us: i64) -> Option<i64> {
        match self.try_save_message_at(message, timestamp_us) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(path = %self.path.display(), "Failed to save message: {}", e);
                None
            }
        }
    }

    pub fn try_save_message_at(&self, message: &[u8], timestamp_us: i64) -> StorageResult<i64> {
        let datetime = micros_to_datetime(timestamp_us).to_rfc3339();
        let conn = self.writer()?.lock();
        conn.execute(
            "INSERT INTO messages (message, timestamp_us, datetime) VALUES (?1, ?2, ?3)",
            params![message, timestamp_us, datetime],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn save_state_snapshot(&self, entries: &[StateEntry]) -> Option<String> {
        self.save_state_snapshot_at(entries, now_micros())
    }

    /// Record a full snapshot; failures are logged and the write is dropped
    pub fn save_state_snapshot_at(
        &self,
        entries: &[StateEntry],
        timestamp_us: i64,
    ) -> Option<String> {
        match self.try_save_state_snapshot_at(entries, timestamp_us) {
            Ok(seq_id) => Some(seq_id),
            Err(e) => {
                error!(path = %self.path.display(), "Failed to save state snapshot: {}", e);
                None
            }
        }
    }

    /// Close the active sequence and open a new one holding `entries`.
    ///
    /// Runs as one transaction, so readers see either the old snapshot or
    /// the complete new one.
    pub fn try_save_state_snapshot_at(
        &self,
        entries: &[StateEntry],
        timestamp_us: i64,
    ) -> StorageResult<String> {
        let seq_id = uuid::Uuid::new_v4().to_string();
        let updated_at = chrono::Utc::now().to_rfc3339();

        let mut conn = self.writer()?.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE state_sequences SET end_us = ?1, updated_at = ?2 WHERE end_us IS NULL",
            params![timestamp_us, updated_at],
        )?;
        tx.execute(
            "INSERT INTO state_sequences (seq_id, start_us, end_us, updated_at)
             VALUES (?1, ?2, NULL, ?3)",
            params![seq_id, timestamp_us, updated_at],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO state_log (seq_id, key, value, message, timestamp_us, updated_at_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    seq_id,
                    entry.key,
                    entry.human_value,
                    entry.encoded_message,
                    timestamp_us,
                    entry.updated_at_us
                ])?;
            }
        }
        tx.commit()?;

        debug!(seq_id = %seq_id, entries = entries.len(), "State snapshot saved");
        Ok(seq_id)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn message_count(&self) -> StorageResult<usize> {
        let conn = self.reader.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Record at zero-based position `index` in id order
    pub fn message_at(&self, index: usize) -> StorageResult<Option<EventLogRecord>> {
        let conn = self.reader.lock();
        let record = conn
            .query_row(
                "SELECT id, message, timestamp_us, datetime FROM messages
                 ORDER BY id ASC LIMIT 1 OFFSET ?1",
                params![index as i64],
                map_message,
            )
            .optional()?;
        Ok(record)
    }

    /// Iterate messages in id order starting at position `resume_index`.
    ///
    /// Returns the cursor and the total number of messages in the log.
    pub fn iter_messages(&self, resume_index: usize) -> StorageResult<(MessageCursor, usize)> {
        let total = self.message_count()?;
        let start = self.message_at(resume_index)?;

        let cursor = MessageCursor {
            reader: Arc::clone(&self.reader),
            after_id: start.as_ref().map(|record| record.id - 1).unwrap_or(i64::MAX),
            page: VecDeque::new(),
            exhausted: start.is_none(),
        };
        Ok((cursor, total))
    }

    pub fn get_state_sequence(
        &self,
        selector: &SequenceSelector,
    ) -> StorageResult<Option<StateSnapshot>> {
        let conn = self.reader.lock();
        let sequence = match selector {
            SequenceSelector::First => conn
                .query_row(
                    "SELECT seq_id, start_us, end_us, updated_at FROM state_sequences
                     ORDER BY rowid ASC LIMIT 1",
                    [],
                    map_sequence,
                )
                .optional()?,
            SequenceSelector::Id(seq_id) => conn
                .query_row(
                    "SELECT seq_id, start_us, end_us, updated_at FROM state_sequences
                     WHERE seq_id = ?1",
                    params![seq_id],
                    map_sequence,
                )
                .optional()?,
            SequenceSelector::At(timestamp_us) => conn
                .query_row(
                    "SELECT seq_id, start_us, end_us, updated_at FROM state_sequences
                     WHERE start_us <= ?1
                     ORDER BY start_us DESC, rowid DESC LIMIT 1",
                    params![timestamp_us],
                    map_sequence,
                )
                .optional()?,
        };

        let Some(sequence) = sequence else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT seq_id, key, value, message, timestamp_us, updated_at_us FROM state_log
             WHERE seq_id = ?1 ORDER BY id ASC",
        )?;
        let records = stmt
            .query_map(params![sequence.seq_id], map_state)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(StateSnapshot { sequence, records }))
    }

    /// Snapshot entries recorded exactly at `timestamp_us`
    pub fn states_at(&self, timestamp_us: i64) -> StorageResult<Vec<StateLogRecord>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(
            "SELECT seq_id, key, value, message, timestamp_us, updated_at_us FROM state_log
             WHERE timestamp_us = ?1 ORDER BY id ASC",
        )?;
        let records = stmt
            .query_map(params![timestamp_us], map_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Every sequence in the order it was recorded
    pub fn sequences(&self) -> StorageResult<Vec<StateSequence>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(
            "SELECT seq_id, start_us, end_us, updated_at FROM state_sequences ORDER BY rowid ASC",
        )?;
        let sequences = stmt
            .query_map([], map_sequence)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sequences)
    }

    /// The currently active sequence, if any
    pub fn open_sequence(&self) -> StorageResult<Option<StateSequence>> {
        let conn = self.reader.lock();
        let sequence = conn
            .query_row(
                "SELECT seq_id, start_us, end_us, updated_at FROM state_sequences
                 WHERE end_us IS NULL ORDER BY start_us DESC LIMIT 1",
                [],
                map_sequence,
            )
            .optional()?;
        Ok(sequence)
    }
}

/// Keyset-paged iterator over `messages`
pub struct MessageCursor {
    reader: Arc<Mutex<Connection>>,
    after_id: i64,
    page: VecDeque<EventLogRecord>,
    exhausted: bool,
}

impl MessageCursor {
    fn fetch_page(&mut self) -> StorageResult<()> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, message, timestamp_us, datetime FROM messages
             WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![self.after_id, PAGE_SIZE as i64], map_message)?
            .collect::<Result<Vec<_>, _>>()?;

        if rows.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.after_id = last.id;
        }
        self.page.extend(rows);
        Ok(())
    }
}

impl Iterator for MessageCursor {
    type Item = StorageResult<EventLogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<EventLogRecord> {
    Ok(EventLogRecord {
        id: row.get(0)?,
        message: row.get(1)?,
        timestamp_us: row.get(2)?,
        datetime: row.get(3)?,
    })
}

fn map_sequence(row: &Row<'_>) -> rusqlite::Result<StateSequence> {
    Ok(StateSequence {
        seq_id: row.get(0)?,
        start_us: row.get(1)?,
        end_us: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn map_state(row: &Row<'_>) -> rusqlite::Result<StateLogRecord> {
    Ok(StateLogRecord {
        seq_id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        encoded_message: row.get(3)?,
        timestamp_us: row.get(4)?,
        updated_at_us: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(key: &str, value: &str, ts: i64) -> StateEntry {
        StateEntry {
            key: key.to_string(),
            human_value: value.to_string(),
            encoded_message: value.as_bytes().to_vec(),
            updated_at_us: ts,
        }
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("CR_1_LIVE.db");
        let log = EventLog::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(log.message_count().unwrap(), 0);
        assert!(log.message_at(0).unwrap().is_none());
        assert!(log.open_sequence().unwrap().is_none());
        assert!(log
            .get_state_sequence(&SequenceSelector::First)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_message_ids_increase() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(dir.path().join("log.db")).unwrap();

        let a = log.save_message_at(b"a", 100).unwrap();
        let b = log.save_message_at(b"b", 50).unwrap();
        assert!(b > a);

        let record = log.message_at(1).unwrap().unwrap();
        assert_eq!(record.message, b"b".to_vec());
        assert_eq!(record.timestamp_us, 50);
        assert!(record.datetime.starts_with("1970-01-01T00:00:00"));
    }

    #[test]
    fn test_snapshot_closes_previous() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(dir.path().join("log.db")).unwrap();

        let first = log
            .try_save_state_snapshot_at(&[entry("TITLE", "Intro", 10)], 10)
            .unwrap();
        let second = log
            .try_save_state_snapshot_at(
                &[entry("TITLE", "Intro", 10), entry("LOGO", "a.png", 20)],
                20,
            )
            .unwrap();

        let first = log
            .get_state_sequence(&SequenceSelector::Id(first))
            .unwrap()
            .unwrap();
        assert_eq!(first.sequence.end_us, Some(20));

        let open = log.open_sequence().unwrap().unwrap();
        assert_eq!(open.seq_id, second);
        assert!(open.is_open());

        let at = log.states_at(20).unwrap();
        assert_eq!(at.len(), 2);
        assert!(at.iter().all(|r| r.seq_id == second && r.timestamp_us == 20));
        assert_eq!(at[0].updated_at_us, 10);
    }

    #[test]
    fn test_first_is_recording_order() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(dir.path().join("log.db")).unwrap();

        // wall clock stepped back between the two snapshots
        let recorded_first = log
            .try_save_state_snapshot_at(&[entry("TITLE", "Intro", 500)], 500)
            .unwrap();
        log.try_save_state_snapshot_at(&[entry("TITLE", "Later", 100)], 100)
            .unwrap();

        let first = log
            .get_state_sequence(&SequenceSelector::First)
            .unwrap()
            .unwrap();
        assert_eq!(first.sequence.seq_id, recorded_first);
        assert_eq!(first.records[0].value, "Intro");

        let ids: Vec<String> = log.sequences().unwrap().into_iter().map(|s| s.seq_id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], recorded_first);
    }

    #[test]
    fn test_read_only_open_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("CR_1_LIVE.db");

        let err = EventLog::open_read_only(&path).err().unwrap();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(!path.exists());

        {
            let log = EventLog::open(&path).unwrap();
            log.try_save_message_at(b"recorded", 10).unwrap();
        }

        let log = EventLog::open_read_only(&path).unwrap();
        assert!(log.is_read_only());
        assert_eq!(log.message_count().unwrap(), 1);
        assert!(matches!(
            log.try_save_message_at(b"x", 20),
            Err(StorageError::ReadOnly(_))
        ));
        assert!(log.save_state_snapshot_at(&[entry("K", "v", 20)], 20).is_none());
        assert_eq!(log.message_count().unwrap(), 1);
    }
}
