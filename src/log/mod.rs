//! Log port: the append-only, newline-delimited storage behind a durable
//! subscription
//!
//! A `Log` has one writer side (the appender listener) and one reader side
//! (the batch deliverer). Lines become visible to the reader only once
//! flushed. The reader position is volatile; the consumed offset is durable
//! and only moves forward through `commit`.
//!
//! Backends implement `LogStore` to open and remove the log of a
//! subscription id:
//!
//! - **file**: `f.<subId>` data file plus a `f.<subId>.hd` header
//! - **memory**: in-process, with fault injection for tests

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod file;
pub mod memory;

pub use file::{FileLog, FileLogStore};
pub use memory::{MemoryLog, MemoryLogStore};

/// Append-only log of newline-terminated records
///
/// A freshly opened log starts paused, positioned at its consumed offset.
#[async_trait]
pub trait Log: Send + Sync {
    /// Subscription this log belongs to
    fn sub_id(&self) -> &str;

    /// Buffer one record, adding the trailing newline if missing
    ///
    /// Synchronous so that records keep the order in which they were published.
    fn append(&self, line: &[u8]) -> Result<()>;

    /// Durably write every buffered record
    async fn flush(&self) -> Result<()>;

    /// Next complete line (with its newline), or `None` when paused, caught
    /// up, or only part of a line has been written
    async fn read_next(&self) -> Result<Option<Bytes>>;

    /// Wait until new data may be readable
    ///
    /// Wakeups may be spurious; a wakeup that happens while nobody waits is
    /// kept for the next caller.
    async fn readable(&self);

    /// Stop handing out lines from `read_next`
    fn pause(&self);

    /// Resume handing out lines
    fn resume(&self);

    fn is_paused(&self) -> bool;

    /// Offset just past the last line returned by `read_next`
    fn read_offset(&self) -> u64;

    /// Durably committed offset
    fn consumed_offset(&self) -> u64;

    /// Durably record that everything before `offset` has been consumed
    async fn commit(&self, offset: u64) -> Result<()>;

    /// Move the reader back to the consumed offset, dropping read-ahead
    async fn rewind(&self) -> Result<()>;

    /// Flush buffered records and release the writer
    async fn close(&self) -> Result<()>;
}

/// Factory for subscription logs
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Open (creating if needed) the log of a subscription
    async fn open(&self, sub_id: &str) -> Result<Arc<dyn Log>>;

    /// Remove every file belonging to a subscription's log
    async fn remove(&self, sub_id: &str) -> Result<()>;

    /// Store name (e.g., "file", "memory")
    fn name(&self) -> &str;
}

/// Append `line` to `buf`, terminated by exactly one newline
pub(crate) fn push_line(buf: &mut Vec<u8>, line: &[u8]) {
    buf.extend_from_slice(line);
    if !line.ends_with(b"\n") {
        buf.push(b'\n');
    }
}
