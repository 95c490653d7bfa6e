//! File-backed subscription logs
//!
//! Each subscription owns two files in the store directory:
//!
//! - `f.<subId>`: newline-delimited records, append only
//! - `f.<subId>.hd`: JSON header `{"consumed": <offset>}`
//!
//! The header is replaced atomically (temp file, fsync, rename). A missing
//! or unreadable header means nothing has been consumed yet.

use super::{push_line, Log, LogStore};
use crate::error::{EventError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Header {
    consumed: u64,
}

/// Opens logs as files under one directory
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    /// Create a store rooted at `dir`; the directory is created on first open
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, sub_id: &str) -> PathBuf {
        self.dir.join(format!("f.{}", sub_id))
    }

    fn header_path(&self, sub_id: &str) -> PathBuf {
        self.dir.join(format!("f.{}.hd", sub_id))
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| EventError::log_io(&self.dir, e))?;
        let meta = fs::metadata(&self.dir)
            .await
            .map_err(|e| EventError::log_io(&self.dir, e))?;
        if !meta.is_dir() {
            return Err(EventError::log_io(
                &self.dir,
                std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn open(&self, sub_id: &str) -> Result<Arc<dyn Log>> {
        self.ensure_dir().await?;
        let log = FileLog::open(sub_id, self.data_path(sub_id), self.header_path(sub_id)).await?;
        Ok(Arc::new(log))
    }

    async fn remove(&self, sub_id: &str) -> Result<()> {
        for path in [self.data_path(sub_id), self.header_path(sub_id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EventError::log_io(&path, e)),
            }
        }
        tracing::debug!(sub_id, dir = %self.dir.display(), "Log files removed");
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

struct Reader {
    file: BufReader<fs::File>,
    /// Bytes of a line whose newline has not been written yet
    partial: Vec<u8>,
    /// Offset of the first byte of `partial`
    pos: u64,
}

/// A subscription log stored in a data file and a header file
pub struct FileLog {
    sub_id: String,
    data_path: PathBuf,
    header_path: PathBuf,
    pending: std::sync::Mutex<Vec<u8>>,
    writer: Mutex<Option<fs::File>>,
    reader: Mutex<Reader>,
    read_offset: AtomicU64,
    consumed: AtomicU64,
    paused: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl FileLog {
    async fn open(sub_id: &str, data_path: PathBuf, header_path: PathBuf) -> Result<Self> {
        let writer = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .await
            .map_err(|e| EventError::log_io(&data_path, e))?;
        let len = writer
            .metadata()
            .await
            .map_err(|e| EventError::log_io(&data_path, e))?
            .len();

        let mut consumed = read_header(&header_path).await;
        if consumed > len {
            tracing::warn!(
                sub_id,
                consumed,
                len,
                "Consumed offset past end of log, clamping"
            );
            consumed = len;
        }

        let mut file = fs::File::open(&data_path)
            .await
            .map_err(|e| EventError::log_io(&data_path, e))?;
        file.seek(SeekFrom::Start(consumed))
            .await
            .map_err(|e| EventError::log_io(&data_path, e))?;

        tracing::debug!(sub_id, path = %data_path.display(), consumed, len, "Log opened");

        Ok(Self {
            sub_id: sub_id.to_string(),
            data_path,
            header_path,
            pending: std::sync::Mutex::new(Vec::new()),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Reader {
                file: BufReader::new(file),
                partial: Vec::new(),
                pos: consumed,
            }),
            read_offset: AtomicU64::new(consumed),
            consumed: AtomicU64::new(consumed),
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Get the data file path
    pub fn path(&self) -> &Path {
        &self.data_path
    }

    fn closed_error(&self) -> EventError {
        EventError::log_io(
            &self.data_path,
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "log is closed"),
        )
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put records from a failed flush back in front of anything appended since
    fn restore_pending(&self, buf: Vec<u8>) {
        let mut pending = self.lock_pending();
        let later = std::mem::replace(&mut *pending, buf);
        pending.extend_from_slice(&later);
    }

    /// Cut the data file back to `len` after a failed write
    ///
    /// Also drops any read-ahead of the cut bytes so the reader never joins
    /// them with the records written next.
    async fn truncate_to(&self, file: &mut fs::File, len: u64) {
        if let Err(e) = file.set_len(len).await {
            tracing::warn!(sub_id = %self.sub_id, len, error = %e, "Failed to truncate partial write");
        }

        let mut reader = self.reader.lock().await;
        let pos = reader.pos.min(len);
        reader.partial.clear();
        reader.pos = pos;
        self.read_offset.fetch_min(pos, Ordering::AcqRel);
        if let Err(e) = reader.file.seek(SeekFrom::Start(pos)).await {
            tracing::warn!(sub_id = %self.sub_id, pos, error = %e, "Failed to reposition reader");
        }
    }

    async fn write_header(&self, consumed: u64) -> Result<()> {
        let json = serde_json::to_vec(&Header { consumed })?;
        let tmp_path = self.header_path.with_extension("hd.tmp");

        let mut tmp = fs::File::create(&tmp_path)
            .await
            .map_err(|e| EventError::log_io(&tmp_path, e))?;
        tmp.write_all(&json)
            .await
            .map_err(|e| EventError::log_io(&tmp_path, e))?;
        tmp.sync_all()
            .await
            .map_err(|e| EventError::log_io(&tmp_path, e))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.header_path)
            .await
            .map_err(|e| EventError::log_io(&self.header_path, e))
    }
}

async fn write_durable(file: &mut fs::File, buf: &[u8]) -> std::io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await?;
    file.sync_data().await
}

async fn read_header(path: &Path) -> u64 {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable log header, starting from 0");
            return 0;
        }
    };
    match serde_json::from_slice::<Header>(&raw) {
        Ok(header) => header.consumed,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupt log header, starting from 0");
            0
        }
    }
}

#[async_trait]
impl Log for FileLog {
    fn sub_id(&self) -> &str {
        &self.sub_id
    }

    fn append(&self, line: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        push_line(&mut self.lock_pending(), line);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // Take the buffer under the writer lock so flushes land in append order.
        let mut writer = self.writer.lock().await;
        let buf = std::mem::take(&mut *self.lock_pending());
        if buf.is_empty() {
            return Ok(());
        }
        let Some(file) = writer.as_mut() else {
            self.restore_pending(buf);
            return Err(self.closed_error());
        };

        let start = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.restore_pending(buf);
                return Err(EventError::log_io(&self.data_path, e));
            }
        };
        if let Err(e) = write_durable(file, &buf).await {
            self.truncate_to(file, start).await;
            self.restore_pending(buf);
            return Err(EventError::log_io(&self.data_path, e));
        }

        self.notify.notify_one();
        Ok(())
    }

    async fn read_next(&self) -> Result<Option<Bytes>> {
        if self.is_paused() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        let Reader { file, partial, pos } = &mut *reader;

        file.read_until(b'\n', partial)
            .await
            .map_err(|e| EventError::log_io(&self.data_path, e))?;
        if !partial.ends_with(b"\n") {
            return Ok(None);
        }

        let line = Bytes::from(std::mem::take(partial));
        *pos += line.len() as u64;
        self.read_offset.store(*pos, Ordering::Release);
        Ok(Some(line))
    }

    async fn readable(&self) {
        self.notify.notified().await;
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn read_offset(&self) -> u64 {
        self.read_offset.load(Ordering::Acquire)
    }

    fn consumed_offset(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    async fn commit(&self, offset: u64) -> Result<()> {
        self.write_header(offset).await?;
        self.consumed.store(offset, Ordering::Release);
        Ok(())
    }

    async fn rewind(&self) -> Result<()> {
        let consumed = self.consumed_offset();
        let mut reader = self.reader.lock().await;
        reader
            .file
            .seek(SeekFrom::Start(consumed))
            .await
            .map_err(|e| EventError::log_io(&self.data_path, e))?;
        reader.partial.clear();
        reader.pos = consumed;
        self.read_offset.store(consumed, Ordering::Release);
        self.notify.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let flushed = self.flush().await;
        self.closed.store(true, Ordering::Release);
        self.paused.store(true, Ordering::Release);
        self.writer.lock().await.take();
        self.notify.notify_one();
        flushed
    }
}
