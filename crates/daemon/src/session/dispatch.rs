//! Authenticated file session.
//!
//! A [`Session`] is created once a device has authenticated. It owns the
//! device's confined root and its handle table, and answers every file
//! request through [`Session::dispatch`].

use protocol::{HandleId, OpenFlags, SftpRequest, SftpResponse, StatusCode};
use thiserror::Error;
use tokio::fs::OpenOptions;
use uuid::Uuid;

use super::handles::{HandleTable, OpenFile, OpenMode};
use crate::config::StorageConfig;
use crate::files::{confine, ConfinedPath, SandboxViolation};

/// Request-scoped failures. None of them end the session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested path was refused.
    #[error("path rejected: {0}")]
    SandboxViolation(#[from] SandboxViolation),

    /// The handle is not open in this session.
    #[error("unknown handle {0}")]
    UnknownHandle(HandleId),

    /// The handle was not exactly four bytes.
    #[error("malformed handle of {0} bytes")]
    MalformedHandle(usize),

    /// The session already has the maximum number of open handles.
    #[error("too many open handles (limit {0})")]
    TooManyHandles(usize),

    /// The open flags do not name a supported mode.
    #[error("unsupported open flags {0:#x}")]
    UnsupportedFlags(u32),

    /// The handle was not opened for this kind of access.
    #[error("handle not opened for {0}")]
    AccessDenied(&'static str),

    /// Nothing left to read.
    #[error("end of file")]
    Eof,

    /// The filesystem reported an error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Status reported to the peer.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::Eof => StatusCode::Eof,
            _ => StatusCode::Failure,
        }
    }
}

/// Per-session resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum simultaneously open handles.
    pub max_open_handles: usize,
    /// Longest single read; longer requests are clamped.
    pub max_read_len: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for SessionLimits {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            max_open_handles: storage.max_open_handles,
            max_read_len: storage.max_read_len,
        }
    }
}

/// Translate `pflags` into open options.
///
/// The combinations of the standard flag table are accepted: `r`, `r+`,
/// `w`, `wx`, `w+`, `wx+`, `a`, `ax`, `a+` and `ax+`. `WRITE|CREAT` without
/// `TRUNC` (with or without `READ`) opens for writing without truncating,
/// which is how clients resume an upload.
fn open_options(flags: OpenFlags) -> Result<(OpenOptions, OpenMode), SessionError> {
    const R: u32 = OpenFlags::READ;
    const W: u32 = OpenFlags::WRITE;
    const A: u32 = OpenFlags::APPEND;
    const C: u32 = OpenFlags::CREAT;
    const T: u32 = OpenFlags::TRUNC;
    const X: u32 = OpenFlags::EXCL;

    let bits = flags.bits();
    let mut options = OpenOptions::new();

    let mode = match bits {
        b if b == R => {
            options.read(true);
            OpenMode::Read
        }
        b if b == R | W => {
            options.read(true).write(true);
            OpenMode::ReadWrite
        }
        b if b == W | C | T || b == W | C | T | X => {
            options.write(true);
            OpenMode::Write
        }
        b if b == R | W | C | T || b == R | W | C | T | X => {
            options.read(true).write(true);
            OpenMode::ReadWrite
        }
        b if b == W | C || b == W | C | X => {
            options.write(true);
            OpenMode::Write
        }
        b if b == R | W | C || b == R | W | C | X => {
            options.read(true).write(true);
            OpenMode::ReadWrite
        }
        b if b == W | A | C || b == W | A | C | X => {
            options.append(true);
            OpenMode::Write
        }
        b if b == R | W | A | C || b == R | W | A | C | X => {
            options.read(true).append(true);
            OpenMode::ReadWrite
        }
        _ => return Err(SessionError::UnsupportedFlags(bits)),
    };

    if bits & X != 0 {
        options.create_new(true);
    } else if bits & C != 0 {
        options.create(true);
    }
    if bits & T != 0 {
        options.truncate(true);
    }

    Ok((options, mode))
}

fn parse_handle(raw: &[u8]) -> Result<HandleId, SessionError> {
    HandleId::from_wire(raw).map_err(|_| SessionError::MalformedHandle(raw.len()))
}

/// One authenticated device connection.
#[derive(Debug)]
pub struct Session {
    device_id: Uuid,
    root: ConfinedPath,
    handles: HandleTable,
    limits: SessionLimits,
}

impl Session {
    /// Create a session rooted at the device's confined directory.
    pub fn new(device_id: Uuid, root: ConfinedPath, limits: SessionLimits) -> Self {
        Self {
            device_id,
            root,
            handles: HandleTable::new(limits.max_open_handles),
            limits,
        }
    }

    /// The authenticated device.
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    /// The device's storage directory.
    pub fn root(&self) -> &ConfinedPath {
        &self.root
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Open `filename` beneath the session root.
    pub async fn open(&self, filename: &str, flags: OpenFlags) -> Result<HandleId, SessionError> {
        let path = confine(self.root.as_path(), filename)?;
        let (options, mode) = open_options(flags)?;

        // Claim the slot first so a refused OPEN never creates or truncates.
        let slot = self.handles.reserve()?;
        let file = options.open(path.as_path()).await?;
        let handle = slot.insert(OpenFile::new(file, mode));

        tracing::debug!(
            device_id = %self.device_id,
            handle = %handle,
            path = %path,
            ?mode,
            "Opened file"
        );
        Ok(handle)
    }

    /// Read up to `len` bytes at `offset`.
    pub async fn read(&self, handle: &[u8], offset: u64, len: u32) -> Result<Vec<u8>, SessionError> {
        let handle = parse_handle(handle)?;
        let file = self.handles.get(handle)?;
        let mut file = file.lock().await;

        if file.is_closed() {
            return Err(SessionError::UnknownHandle(handle));
        }
        if !file.mode().can_read() {
            return Err(SessionError::AccessDenied("reading"));
        }

        let len = len.min(self.limits.max_read_len);
        let data = file.read_at(offset, len as usize).await?;
        if data.is_empty() && len > 0 {
            return Err(SessionError::Eof);
        }
        Ok(data)
    }

    /// Write `data` at `offset`.
    pub async fn write(&self, handle: &[u8], offset: u64, data: &[u8]) -> Result<(), SessionError> {
        let handle = parse_handle(handle)?;
        let file = self.handles.get(handle)?;
        let mut file = file.lock().await;

        if file.is_closed() {
            return Err(SessionError::UnknownHandle(handle));
        }
        if !file.mode().can_write() {
            return Err(SessionError::AccessDenied("writing"));
        }

        file.write_at(offset, data).await?;
        Ok(())
    }

    /// Close a handle.
    pub async fn close(&self, handle: &[u8]) -> Result<(), SessionError> {
        let handle = parse_handle(handle)?;
        self.handles.close(handle).await?;
        tracing::debug!(device_id = %self.device_id, handle = %handle, "Closed file");
        Ok(())
    }

    /// Handle one request and produce its response.
    ///
    /// Failures are logged with full detail and answered with a generic
    /// status; nothing about paths or OS errors reaches the peer.
    pub async fn dispatch(&self, request: SftpRequest) -> SftpResponse {
        let id = request.id();
        let kind = request.kind();

        let result = match request {
            SftpRequest::Open {
                filename, flags, ..
            } => self
                .open(&filename, flags)
                .await
                .map(|handle| SftpResponse::Handle { id, handle }),
            SftpRequest::Read {
                handle,
                offset,
                len,
                ..
            } => self
                .read(&handle, offset, len)
                .await
                .map(|data| SftpResponse::Data { id, data }),
            SftpRequest::Write {
                handle,
                offset,
                data,
                ..
            } => self
                .write(&handle, offset, &data)
                .await
                .map(|()| SftpResponse::ok(id)),
            SftpRequest::Close { handle, .. } => {
                self.close(&handle).await.map(|()| SftpResponse::ok(id))
            }
            SftpRequest::Unsupported { packet_type, .. } => {
                tracing::debug!(
                    device_id = %self.device_id,
                    request_id = id,
                    packet_type,
                    "Unsupported request"
                );
                return SftpResponse::status(id, StatusCode::OpUnsupported);
            }
        };

        result.unwrap_or_else(|e| {
            match &e {
                SessionError::Eof => {}
                SessionError::Io(_) => tracing::warn!(
                    device_id = %self.device_id,
                    request_id = id,
                    request = kind,
                    error = %e,
                    "File request failed"
                ),
                _ => tracing::debug!(
                    device_id = %self.device_id,
                    request_id = id,
                    request = kind,
                    error = %e,
                    "File request rejected"
                ),
            }
            SftpResponse::status(id, e.status_code())
        })
    }

    /// Close every open handle. Returns how many were open.
    pub async fn teardown(&self) -> usize {
        let closed = self.handles.close_all().await;
        if closed > 0 {
            tracing::info!(
                device_id = %self.device_id,
                closed,
                "Closed handles left open at session end"
            );
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(temp: &TempDir) -> Session {
        let root = confine(temp.path(), "device").unwrap();
        std::fs::create_dir_all(root.as_path()).unwrap();
        Session::new(Uuid::new_v4(), root, SessionLimits::default())
    }

    fn flags(bits: u32) -> OpenFlags {
        OpenFlags::from_bits(bits)
    }

    fn create_write() -> OpenFlags {
        flags(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC)
    }

    fn create_rw() -> OpenFlags {
        flags(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC)
    }

    #[tokio::test]
    async fn test_notes_scenario() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);

        let open = SftpRequest::Open {
            id: 1,
            filename: "notes.txt".to_string(),
            flags: create_rw(),
            attrs: Default::default(),
        };
        let handle = match session.dispatch(open).await {
            SftpResponse::Handle { id: 1, handle } => handle,
            other => panic!("unexpected response: {other:?}"),
        };
        let wire = handle.to_wire().to_vec();

        let write = SftpRequest::Write {
            id: 2,
            handle: wire.clone(),
            offset: 0,
            data: b"hello".to_vec(),
        };
        assert_eq!(session.dispatch(write).await, SftpResponse::ok(2));

        let read = SftpRequest::Read {
            id: 3,
            handle: wire.clone(),
            offset: 0,
            len: 5,
        };
        assert_eq!(
            session.dispatch(read).await,
            SftpResponse::Data {
                id: 3,
                data: b"hello".to_vec()
            }
        );

        let close = SftpRequest::Close {
            id: 4,
            handle: wire.clone(),
        };
        assert_eq!(session.dispatch(close).await, SftpResponse::ok(4));

        let read_again = SftpRequest::Read {
            id: 5,
            handle: wire,
            offset: 0,
            len: 5,
        };
        assert_eq!(session.dispatch(read_again).await, SftpResponse::failure(5));
        assert!(matches!(
            session.read(&handle.to_wire(), 0, 5).await,
            Err(SessionError::UnknownHandle(h)) if h == handle
        ));

        let on_disk = std::fs::read(session.root().as_path().join("notes.txt")).unwrap();
        assert_eq!(on_disk, b"hello");
    }

    #[tokio::test]
    async fn test_open_rejects_traversal_without_touching_disk() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);

        let result = session.open("../../etc/passwd", create_write()).await;
        assert!(matches!(
            result,
            Err(SessionError::SandboxViolation(SandboxViolation::EscapesRoot))
        ));

        let result = session.open("../sibling", create_write()).await;
        assert!(matches!(result, Err(SessionError::SandboxViolation(_))));
        assert!(!temp.path().join("sibling").exists());
        assert_eq!(session.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_open_missing_file_for_read_fails() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);

        let result = session.open("absent", flags(OpenFlags::READ)).await;
        assert!(matches!(result, Err(SessionError::Io(_))));
        assert_eq!(session.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_open_rejects_unsupported_flags() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);

        for bits in [0, OpenFlags::CREAT, OpenFlags::WRITE, OpenFlags::READ | OpenFlags::TRUNC] {
            let result = session.open("file", flags(bits)).await;
            assert!(
                matches!(result, Err(SessionError::UnsupportedFlags(b)) if b == bits),
                "flags {bits:#x}"
            );
        }
    }

    #[tokio::test]
    async fn test_write_create_without_truncate_keeps_contents() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        std::fs::write(session.root().as_path().join("upload"), b"0123456789").unwrap();

        let resume = flags(OpenFlags::WRITE | OpenFlags::CREAT);
        let handle = session.open("upload", resume).await.unwrap();
        session.write(&handle.to_wire(), 10, b"abc").await.unwrap();
        assert!(matches!(
            session.read(&handle.to_wire(), 0, 4).await,
            Err(SessionError::AccessDenied(_))
        ));
        session.close(&handle.to_wire()).await.unwrap();

        let contents = std::fs::read(session.root().as_path().join("upload")).unwrap();
        assert_eq!(contents, b"0123456789abc");

        let handle = session
            .open("fresh", flags(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT))
            .await
            .unwrap();
        session.write(&handle.to_wire(), 0, b"xy").await.unwrap();
        assert_eq!(session.read(&handle.to_wire(), 0, 2).await.unwrap(), b"xy");
    }

    #[tokio::test]
    async fn test_open_over_handle_limit_leaves_disk_untouched() {
        let temp = TempDir::new().unwrap();
        let root = confine(temp.path(), "device").unwrap();
        std::fs::create_dir_all(root.as_path()).unwrap();
        let limits = SessionLimits {
            max_open_handles: 1,
            ..SessionLimits::default()
        };
        let session = Session::new(Uuid::new_v4(), root, limits);
        std::fs::write(session.root().as_path().join("keep"), b"precious").unwrap();

        session.open("first", create_write()).await.unwrap();

        assert!(matches!(
            session.open("keep", create_write()).await,
            Err(SessionError::TooManyHandles(1))
        ));
        assert!(matches!(
            session.open("new-file", create_write()).await,
            Err(SessionError::TooManyHandles(1))
        ));

        let kept = std::fs::read(session.root().as_path().join("keep")).unwrap();
        assert_eq!(kept, b"precious");
        assert!(!session.root().as_path().join("new-file").exists());
        assert_eq!(session.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_releases_its_slot() {
        let temp = TempDir::new().unwrap();
        let root = confine(temp.path(), "device").unwrap();
        std::fs::create_dir_all(root.as_path()).unwrap();
        let limits = SessionLimits {
            max_open_handles: 1,
            ..SessionLimits::default()
        };
        let session = Session::new(Uuid::new_v4(), root, limits);

        assert!(session.open("absent", flags(OpenFlags::READ)).await.is_err());
        session.open("present", create_write()).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_file_reports_unknown_handle() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        let handle = session.open("f", create_rw()).await.unwrap();

        // A request that looked the handle up before CLOSE finds the file
        // already taken once it holds the lock.
        let in_flight = session.handles.get(handle).unwrap();
        in_flight.lock().await.close().await.unwrap();

        assert!(matches!(
            session.write(&handle.to_wire(), 0, b"late").await,
            Err(SessionError::UnknownHandle(h)) if h == handle
        ));
        assert!(matches!(
            session.read(&handle.to_wire(), 0, 4).await,
            Err(SessionError::UnknownHandle(h)) if h == handle
        ));
        assert!(std::fs::read(session.root().as_path().join("f")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_create_fails_when_present() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);

        let handle = session.open("once", create_write()).await.unwrap();
        session.close(&handle.to_wire()).await.unwrap();

        let exclusive = flags(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::EXCL);
        assert!(matches!(
            session.open("once", exclusive).await,
            Err(SessionError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_append_mode() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        std::fs::write(session.root().as_path().join("log"), b"one,").unwrap();

        let append = flags(OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREAT);
        let handle = session.open("log", append).await.unwrap();
        session.write(&handle.to_wire(), 0, b"two").await.unwrap();
        session.close(&handle.to_wire()).await.unwrap();

        let contents = std::fs::read(session.root().as_path().join("log")).unwrap();
        assert_eq!(contents, b"one,two");
    }

    #[tokio::test]
    async fn test_short_read_and_eof() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        std::fs::write(session.root().as_path().join("data"), b"abc").unwrap();

        let handle = session.open("data", flags(OpenFlags::READ)).await.unwrap();
        let wire = handle.to_wire();

        assert_eq!(session.read(&wire, 1, 100).await.unwrap(), b"bc");
        assert!(matches!(
            session.read(&wire, 3, 10).await,
            Err(SessionError::Eof)
        ));

        let response = session
            .dispatch(SftpRequest::Read {
                id: 9,
                handle: wire.to_vec(),
                offset: 50,
                len: 1,
            })
            .await;
        assert_eq!(response.status_code(), Some(StatusCode::Eof));
    }

    #[tokio::test]
    async fn test_read_is_clamped() {
        let temp = TempDir::new().unwrap();
        let root = confine(temp.path(), "device").unwrap();
        std::fs::create_dir_all(root.as_path()).unwrap();
        std::fs::write(root.as_path().join("big"), vec![7u8; 64]).unwrap();

        let limits = SessionLimits {
            max_open_handles: 4,
            max_read_len: 16,
        };
        let session = Session::new(Uuid::new_v4(), root, limits);

        let handle = session.open("big", flags(OpenFlags::READ)).await.unwrap();
        let data = session.read(&handle.to_wire(), 0, 1000).await.unwrap();
        assert_eq!(data.len(), 16);
    }

    #[tokio::test]
    async fn test_mode_enforced() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);

        let handle = session.open("w", create_write()).await.unwrap();
        assert!(matches!(
            session.read(&handle.to_wire(), 0, 1).await,
            Err(SessionError::AccessDenied(_))
        ));

        std::fs::write(session.root().as_path().join("r"), b"x").unwrap();
        let handle = session.open("r", flags(OpenFlags::READ)).await.unwrap();
        assert!(matches!(
            session.write(&handle.to_wire(), 0, b"y").await,
            Err(SessionError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_handles() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);
        session.open("f", create_write()).await.unwrap();

        for raw in [vec![], vec![0, 0, 1], vec![0, 0, 0, 1, 0]] {
            assert!(matches!(
                session.close(&raw).await,
                Err(SessionError::MalformedHandle(n)) if n == raw.len()
            ));
        }
        assert_eq!(session.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_request() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);

        let response = session
            .dispatch(SftpRequest::Unsupported {
                packet_type: 13,
                id: 77,
            })
            .await;
        assert_eq!(response.status_code(), Some(StatusCode::OpUnsupported));
        assert_eq!(response.id(), Some(77));
    }

    #[tokio::test]
    async fn test_handles_do_not_cross_sessions() {
        let temp = TempDir::new().unwrap();
        let first = session(&temp);
        let second = session(&temp);

        let handle = first.open("a", create_write()).await.unwrap();
        assert!(matches!(
            second.write(&handle.to_wire(), 0, b"x").await,
            Err(SessionError::UnknownHandle(_))
        ));
        first.write(&handle.to_wire(), 0, b"x").await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_closes_everything() {
        let temp = TempDir::new().unwrap();
        let session = session(&temp);

        let a = session.open("a", create_write()).await.unwrap();
        session.open("b", create_write()).await.unwrap();

        assert_eq!(session.teardown().await, 2);
        assert_eq!(session.open_handles(), 0);
        assert!(matches!(
            session.close(&a.to_wire()).await,
            Err(SessionError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_distinct_handles() {
        let temp = TempDir::new().unwrap();
        let session = std::sync::Arc::new(session(&temp));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8u8 {
            let session = std::sync::Arc::clone(&session);
            tasks.spawn(async move {
                let name = format!("file-{i}");
                let handle = session.open(&name, create_write()).await.unwrap();
                session.write(&handle.to_wire(), 0, &[i; 32]).await.unwrap();
                session.close(&handle.to_wire()).await.unwrap();
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        for i in 0..8u8 {
            let contents = std::fs::read(session.root().as_path().join(format!("file-{i}"))).unwrap();
            assert_eq!(contents, vec![i; 32]);
        }
        assert_eq!(session.open_handles(), 0);
    }
}
