//! Log records as seen by the scavenger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event number carried by a stream's tombstone.
pub const DELETED_STREAM_EVENT_NUMBER: i64 = i64::MAX;

/// Event number of a prepare written inside an explicit transaction,
/// before the commit assigns one.
pub const UNCOMMITTED_EVENT_NUMBER: i64 = -1;

/// Bytes of framing counted for each record on top of its payload
const RECORD_OVERHEAD: u64 = 48;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareFlags {
    /// Single record write carrying its own commit
    pub self_committed: bool,
    pub transaction_begin: bool,
    pub transaction_end: bool,
    pub tombstone: bool,
}

impl PrepareFlags {
    pub fn self_committed() -> Self {
        Self {
            self_committed: true,
            transaction_begin: true,
            transaction_end: true,
            tombstone: false,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            tombstone: true,
            ..Self::self_committed()
        }
    }
}

/// An event written to a stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRecord {
    pub log_position: i64,
    /// Position of the first prepare of the write this record belongs to
    pub transaction_position: i64,
    pub stream_id: String,
    pub event_number: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub flags: PrepareFlags,
    pub data: Vec<u8>,
}

impl PrepareRecord {
    pub fn is_self_committed(&self) -> bool {
        self.flags.self_committed
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags.tombstone
    }
}

/// Commit of an explicit transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub log_position: i64,
    pub transaction_position: i64,
    pub first_event_number: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
}

impl LogRecord {
    pub fn log_position(&self) -> i64 {
        match self {
            LogRecord::Prepare(prepare) => prepare.log_position,
            LogRecord::Commit(commit) => commit.log_position,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Prepare(prepare) => prepare.timestamp,
            LogRecord::Commit(commit) => commit.timestamp,
        }
    }

    /// Bytes the record occupies in a chunk
    pub fn size(&self) -> u64 {
        match self {
            LogRecord::Prepare(prepare) => {
                RECORD_OVERHEAD
                    + prepare.stream_id.len() as u64
                    + prepare.event_type.len() as u64
                    + prepare.data.len() as u64
            }
            LogRecord::Commit(_) => RECORD_OVERHEAD,
        }
    }

    pub fn as_prepare(&self) -> Option<&PrepareRecord> {
        match self {
            LogRecord::Prepare(prepare) => Some(prepare),
            LogRecord::Commit(_) => None,
        }
    }
}
