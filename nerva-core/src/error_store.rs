use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{ErrorKind, KernelError};
use crate::ids::MessageId;

/// Default ring capacity.
pub const DEFAULT_ERROR_STORE_CAPACITY: usize = 1000;

/// Coarse severity derived from the error kind: infrastructure pushback is
/// a warning, handler and invariant failures are errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
}

impl ErrorSeverity {
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation
            | ErrorKind::NotFound
            | ErrorKind::QueueFull
            | ErrorKind::Timeout
            | ErrorKind::Forbidden => ErrorSeverity::Warning,
            ErrorKind::HandlerError | ErrorKind::BuildError | ErrorKind::Internal => {
                ErrorSeverity::Error
            }
        }
    }
}

/// One recorded failure.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub subsystem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Filter for [`ErrorStore::query`]; unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct ErrorQuery {
    pub kind: Option<ErrorKind>,
    pub severity: Option<ErrorSeverity>,
    pub subsystem: Option<String>,
    /// Only records at or after this timestamp (ms since epoch).
    pub since: Option<i64>,
}

/// Bounded ring of recorded errors, oldest-evicted-first.
///
/// Most subsystems opt in through their processor; the ring keeps recent
/// failures queryable by kind, severity, subsystem, and time without
/// growing unbounded.
pub struct ErrorStore {
    ring: Mutex<VecDeque<ErrorRecord>>,
    capacity: usize,
}

impl ErrorStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Record an error against a subsystem; returns the record id.
    pub fn record(
        &self,
        error: &KernelError,
        subsystem: &str,
        message_id: Option<MessageId>,
    ) -> Uuid {
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            kind: error.kind(),
            severity: ErrorSeverity::for_kind(error.kind()),
            message: error.to_string(),
            subsystem: subsystem.to_string(),
            message_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let id = record.id;
        let mut ring = self.ring.lock().expect("error store poisoned");
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<ErrorRecord> {
        self.ring
            .lock()
            .expect("error store poisoned")
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// All records matching the filter, oldest first.
    pub fn query(&self, filter: &ErrorQuery) -> Vec<ErrorRecord> {
        self.ring
            .lock()
            .expect("error store poisoned")
            .iter()
            .filter(|r| filter.kind.map_or(true, |k| r.kind == k))
            .filter(|r| filter.severity.map_or(true, |s| r.severity == s))
            .filter(|r| {
                filter
                    .subsystem
                    .as_deref()
                    .map_or(true, |s| r.subsystem == s)
            })
            .filter(|r| filter.since.map_or(true, |t| r.timestamp >= t))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("error store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ErrorStore {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_STORE_CAPACITY)
    }
}
