//! Per-session handle table.
//!
//! Maps server-chosen handle ids to open files. Table mutation is a short
//! critical section inside the map; file I/O happens under the handle's own
//! mutex, so operations on different handles never wait on each other while
//! operations on the same handle run one at a time.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::HandleId;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::dispatch::SessionError;

/// Access mode an open file was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    ReadWrite,
}

impl OpenMode {
    /// Whether reads are permitted.
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    /// Whether writes are permitted.
    pub fn can_write(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// An open file owned by a handle.
///
/// Closing takes the file out under the handle's lock, so a request that
/// looked the handle up before a CLOSE finds it closed once it gets the lock.
#[derive(Debug)]
pub struct OpenFile {
    file: Option<File>,
    mode: OpenMode,
}

impl OpenFile {
    /// Wrap an opened file.
    pub fn new(file: File, mode: OpenMode) -> Self {
        Self {
            file: Some(file),
            mode,
        }
    }

    /// The granted access mode.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether the file has been closed.
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn file_mut(&mut self) -> std::io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("handle is closed"))
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only when end of file is reached.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write all of `data` starting at `offset`.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        // Surface deferred write errors before answering the request.
        file.flush().await
    }

    /// Flush pending writes and release the file. Closing twice is a no-op.
    pub async fn close(&mut self) -> std::io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush().await,
            None => Ok(()),
        }
    }
}

type SharedFile = Arc<Mutex<OpenFile>>;

/// Handle table owned by exactly one session.
#[derive(Debug)]
pub struct HandleTable {
    files: DashMap<u32, SharedFile>,
    next_id: AtomicU32,
    open: AtomicUsize,
    max_open: usize,
}

impl HandleTable {
    /// Create an empty table allowing at most `max_open` handles.
    pub fn new(max_open: usize) -> Self {
        Self {
            files: DashMap::new(),
            next_id: AtomicU32::new(1),
            open: AtomicUsize::new(0),
            max_open,
        }
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no handles are open.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Claim a slot for a file that is about to be opened.
    ///
    /// The slot is released again if the reservation is dropped unused.
    pub fn reserve(&self) -> Result<Reservation<'_>, SessionError> {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_open).then_some(n + 1)
            })
            .map_err(|_| SessionError::TooManyHandles(self.max_open))?;
        Ok(Reservation {
            table: self,
            used: false,
        })
    }

    /// Register an open file and allocate its handle.
    pub fn insert(&self, file: OpenFile) -> Result<HandleId, SessionError> {
        Ok(self.reserve()?.insert(file))
    }

    fn insert_reserved(&self, file: OpenFile) -> HandleId {
        let shared = Arc::new(Mutex::new(file));
        loop {
            // Ids only repeat after wrapping; skip any still in use.
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.files.entry(id) {
                slot.insert(shared);
                return HandleId::new(id);
            }
        }
    }

    /// Look up a handle, releasing the table lock before returning.
    pub fn get(&self, handle: HandleId) -> Result<SharedFile, SessionError> {
        self.files
            .get(&handle.value())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::UnknownHandle(handle))
    }

    /// Remove a handle and close its file.
    ///
    /// Waits for any in-flight operation on the same handle to finish.
    pub async fn close(&self, handle: HandleId) -> Result<(), SessionError> {
        let (_, shared) = self
            .files
            .remove(&handle.value())
            .ok_or(SessionError::UnknownHandle(handle))?;
        self.open.fetch_sub(1, Ordering::AcqRel);

        close_shared(shared).await.map_err(SessionError::Io)
    }

    /// Close every handle. Returns how many were open.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<u32> = self.files.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;

        for id in ids {
            if let Some((_, shared)) = self.files.remove(&id) {
                self.open.fetch_sub(1, Ordering::AcqRel);
                closed += 1;
                if let Err(e) = close_shared(shared).await {
                    tracing::debug!(handle = id, error = %e, "Error flushing file during teardown");
                }
            }
        }

        closed
    }
}

/// A claimed handle slot. See [`HandleTable::reserve`].
#[derive(Debug)]
pub struct Reservation<'a> {
    table: &'a HandleTable,
    used: bool,
}

impl Reservation<'_> {
    /// Register the opened file in the reserved slot.
    pub fn insert(mut self, file: OpenFile) -> HandleId {
        self.used = true;
        self.table.insert_reserved(file)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.used {
            self.table.open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

async fn close_shared(shared: SharedFile) -> std::io::Result<()> {
    // Waits out any operation already holding the handle. Requests queued
    // behind this one see the file gone.
    shared.lock().await.close().await
}
