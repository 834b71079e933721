//! In-process sink.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::MessageSink;
use crate::error::SinkError;
use crate::types::PersistedRecord;

/// Keeps rows in memory; can be told to fail the next inserts.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    rows: Vec<PersistedRecord>,
    pending_failures: u32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` inserts.
    pub fn fail_next_inserts(&self, n: u32) {
        self.lock().pending_failures = n;
    }

    pub fn rows(&self) -> Vec<PersistedRecord> {
        self.lock().rows.clone()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn insert(&self, message: &str) -> Result<PersistedRecord, SinkError> {
        let mut state = self.lock();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(SinkError::Unavailable("connection reset".to_string()));
        }

        let record = PersistedRecord {
            id: state.rows.len() as i32 + 1,
            message: message.to_string(),
        };
        state.rows.push(record.clone());
        Ok(record)
    }
}
