//! In-memory subscription logs
//!
//! Logs outlive the manager that opened them, so tests can drop a manager
//! and build a new one over the same store to simulate a restart. Flush and
//! commit failures can be injected per log.

use super::{push_line, Log, LogStore};
use crate::error::{EventError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::Notify;

/// Keeps every opened log in memory, keyed by subscription id
#[derive(Default)]
pub struct MemoryLogStore {
    logs: RwLock<HashMap<String, Arc<MemoryLog>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the log of a subscription, if it was ever opened and not removed
    pub fn get(&self, sub_id: &str) -> Option<Arc<MemoryLog>> {
        self.logs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(sub_id)
            .cloned()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn open(&self, sub_id: &str) -> Result<Arc<dyn Log>> {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let log = logs
            .entry(sub_id.to_string())
            .or_insert_with(|| Arc::new(MemoryLog::new(sub_id)));
        log.reopen();
        let log: Arc<dyn Log> = log.clone();
        Ok(log)
    }

    async fn remove(&self, sub_id: &str) -> Result<()> {
        self.logs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sub_id);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Default)]
struct MemoryState {
    pending: Vec<u8>,
    data: Vec<u8>,
    read: u64,
    consumed: u64,
    paused: bool,
    closed: bool,
    fail_flushes: bool,
    fail_commits: bool,
}

/// A subscription log held in memory
pub struct MemoryLog {
    sub_id: String,
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryLog {
    fn new(sub_id: &str) -> Self {
        Self {
            sub_id: sub_id.to_string(),
            state: Mutex::new(MemoryState {
                paused: true,
                ..Default::default()
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Back to the state right after a restart: unflushed records are lost
    fn reopen(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.read = state.consumed;
        state.paused = true;
        state.closed = false;
    }

    /// Make every following `flush` fail (or succeed again)
    pub fn fail_flushes(&self, fail: bool) {
        self.lock().fail_flushes = fail;
    }

    /// Make every following `commit` fail (or succeed again)
    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    /// Everything flushed so far
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().data)
    }

    fn injected(&self, what: &str) -> EventError {
        EventError::LogIo {
            path: format!("memory:{}", self.sub_id),
            source: std::io::Error::new(std::io::ErrorKind::Other, format!("injected {} failure", what)),
        }
    }

    fn closed_error(&self) -> EventError {
        EventError::LogIo {
            path: format!("memory:{}", self.sub_id),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "log is closed"),
        }
    }
}

#[async_trait]
impl Log for MemoryLog {
    fn sub_id(&self) -> &str {
        &self.sub_id
    }

    fn append(&self, line: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        push_line(&mut state.pending, line);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.pending.is_empty() {
                return Ok(());
            }
            // records stay pending so every later flush reports the failure too
            if state.fail_flushes {
                return Err(self.injected("flush"));
            }
            let pending = std::mem::take(&mut state.pending);
            state.data.extend_from_slice(&pending);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn read_next(&self) -> Result<Option<Bytes>> {
        let mut state = self.lock();
        if state.paused {
            return Ok(None);
        }
        let start = state.read as usize;
        let Some(newline) = state.data[start..].iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let end = start + newline + 1;
        let line = Bytes::copy_from_slice(&state.data[start..end]);
        state.read = end as u64;
        Ok(Some(line))
    }

    async fn readable(&self) {
        self.notify.notified().await;
    }

    fn pause(&self) {
        self.lock().paused = true;
    }

    fn resume(&self) {
        self.lock().paused = false;
        self.notify.notify_one();
    }

    fn is_paused(&self) -> bool {
        self.lock().paused
    }

    fn read_offset(&self) -> u64 {
        self.lock().read
    }

    fn consumed_offset(&self) -> u64 {
        self.lock().consumed
    }

    async fn commit(&self, offset: u64) -> Result<()> {
        let mut state = self.lock();
        if state.fail_commits {
            return Err(self.injected("commit"));
        }
        state.consumed = offset;
        Ok(())
    }

    async fn rewind(&self) -> Result<()> {
        {
            let mut state = self.lock();
            state.read = state.consumed;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let flushed = self.flush().await;
        {
            let mut state = self.lock();
            state.closed = true;
            state.paused = true;
        }
        self.notify.notify_one();
        flushed
    }
}
