//! Append-only queue of deferred remote requests.
//!
//! The file starts with a 12-byte header of three little-endian `u32`s
//! (read offset, first processing time, last processing time). Each entry
//! after it is one line of base64-encoded JSON [`Request`].
//!
//! Appends hold an exclusive lock. A replay session marks itself in the header
//! so concurrent sessions back off, commits the offset after every delivered
//! entry and deletes the file once everything is delivered.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fpc_storage::{Clock, FileHandle, HandleLock, LockKind, OpenMode, Storage};
use fpc_transport::{Request, Response, ResponseStatus, Transport};

use crate::BacklogError;

const QUEUE_FILE: &str = "backlog.queue";
const HEADER_LEN: u64 = 12;
const REPEAT_HEADER: &str = "x-nitro-repeat";
const APPEND_ATTEMPTS: u32 = 3;

/// Seconds a replay may stay unfinished before it fails for good.
pub const REPLAY_TTL: u64 = 3600;

/// The fixed header in front of the entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogHeader {
    /// Byte position just past the last delivered entry. 0 means none.
    pub offset: u32,
    /// When the first unfinished replay started.
    pub first_processing: u32,
    /// When the replay in progress started. 0 when none is running.
    pub last_processing: u32,
}

impl BacklogHeader {
    #[must_use]
    pub fn to_bytes(self) -> [u8; 12] {
        let mut raw = [0u8; 12];
        raw[0..4].copy_from_slice(&self.offset.to_le_bytes());
        raw[4..8].copy_from_slice(&self.first_processing.to_le_bytes());
        raw[8..12].copy_from_slice(&self.last_processing.to_le_bytes());
        raw
    }

    /// Decode a header. Missing bytes read as zero.
    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self {
            offset: field(raw, 0),
            first_processing: field(raw, 1),
            last_processing: field(raw, 2),
        }
    }

    fn entries_start(self) -> u64 {
        u64::from(self.offset).max(HEADER_LEN)
    }
}

fn field(raw: &[u8], index: usize) -> u32 {
    raw.get(index * 4..index * 4 + 4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map_or(0, u32::from_le_bytes)
}

enum EntryOutcome {
    Delivered,
    Failed,
}

/// The backlog queue of one installation.
pub struct Backlog {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
    enabled: bool,
}

impl Backlog {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            path: PathBuf::from(QUEUE_FILE),
            enabled: true,
        }
    }

    /// Turn the queue off. A disabled queue drops appends, never replays and
    /// reports that it does not exist.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether undelivered entries are waiting.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.enabled && self.storage.exists(&self.path)
    }

    pub fn delete(&self) -> Result<(), BacklogError> {
        self.storage.delete(&self.path)?;
        tracing::info!(path = %self.path.display(), "Deleted backlog");
        Ok(())
    }

    /// Queue `request` for later delivery.
    pub fn append(&self, request: &Request) -> Result<(), BacklogError> {
        if !self.enabled {
            return Ok(());
        }
        let line = STANDARD.encode(serde_json::to_vec(request)?);

        for _ in 0..APPEND_ATTEMPTS {
            let mut handle = self.storage.open(&self.path, OpenMode::ReadWrite)?;
            let written = {
                let mut locked = HandleLock::acquire(handle.as_mut(), LockKind::Exclusive)?;
                // A drained replay unlinks the file while we wait for the lock.
                if self.storage.exists(&self.path) {
                    load_header(&mut *locked)?;
                    locked.seek(SeekFrom::End(0))?;
                    locked.write(line.as_bytes())?;
                    locked.write(b"\n")?;
                    locked.flush()?;
                    true
                } else {
                    false
                }
            };
            handle.close()?;

            if written {
                tracing::debug!(path = %request.path, method = %request.method, "Appended request to backlog");
                return Ok(());
            }
            tracing::debug!(path = %self.path.display(), "Backlog file removed before append, reopening");
        }
        Err(BacklogError::Contended {
            attempts: APPEND_ATTEMPTS,
        })
    }

    /// Deliver queued entries through `transport` for at most `time_limit`.
    ///
    /// Returns `Ok(true)` when the queue is empty afterwards (the file is then
    /// deleted) and `Ok(false)` when entries remain, another replay started
    /// less than `time_limit` ago, or the queue is disabled. Fails with
    /// [`BacklogError::ReplayTimeout`] once replays have been unfinished for
    /// longer than [`REPLAY_TTL`].
    pub fn replay(&self, time_limit: Duration, transport: &dyn Transport) -> Result<bool, BacklogError> {
        if !self.enabled {
            return Ok(false);
        }
        if !self.storage.exists(&self.path) {
            return Ok(true);
        }

        let started = Instant::now();
        let mut handle = self.storage.open(&self.path, OpenMode::ReadWrite)?;
        let Some(header) = self.acquire(handle.as_mut(), time_limit)? else {
            handle.close()?;
            tracing::debug!("Backlog replay already in progress");
            return Ok(false);
        };

        let now = self.now();
        if now.saturating_sub(header.first_processing) > u32::try_from(REPLAY_TTL).unwrap_or(u32::MAX) {
            self.release(handle.as_mut())?;
            handle.close()?;
            tracing::warn!(first_processing = header.first_processing, "Backlog replay exceeded its lifetime");
            return Err(BacklogError::ReplayTimeout { ttl: REPLAY_TTL });
        }

        let delivered = self.deliver(handle.as_mut(), header, started, time_limit, transport);
        let count = match delivered {
            Ok(count) => count,
            Err(e) => {
                self.release(handle.as_mut())?;
                handle.close()?;
                return Err(e);
            }
        };
        tracing::info!(count, "Replayed backlog entries");

        let drained = {
            let mut locked = HandleLock::acquire(handle.as_mut(), LockKind::Exclusive)?;
            let header = load_header(&mut *locked)?;
            let len = locked.seek(SeekFrom::End(0))?;
            let drained = header.entries_start() >= len;
            if drained {
                self.storage.delete(&self.path)?;
            }
            drained
        };
        if drained {
            handle.close()?;
            tracing::info!(path = %self.path.display(), "Backlog drained");
            return Ok(true);
        }
        self.release(handle.as_mut())?;
        handle.close()?;
        Ok(false)
    }

    /// Rewind the read offset so every entry is delivered again.
    pub fn reset_offset(&self) -> Result<(), BacklogError> {
        self.update_header(|header| header.offset = 0)
    }

    /// The stored header, if the queue file exists.
    pub fn header(&self) -> Result<Option<BacklogHeader>, BacklogError> {
        if !self.storage.exists(&self.path) {
            return Ok(None);
        }
        let raw = self.storage.read(&self.path)?;
        Ok(Some(BacklogHeader::from_bytes(&raw)))
    }

    /// Every entry not yet delivered, oldest first.
    pub fn entries(&self) -> Result<Vec<Request>, BacklogError> {
        let Some(header) = self.header()? else {
            return Ok(Vec::new());
        };
        let raw = self.storage.read(&self.path)?;
        let start = usize::try_from(header.entries_start()).unwrap_or(usize::MAX);
        raw.get(start..)
            .unwrap_or_default()
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(decode_entry)
            .collect()
    }

    fn now(&self) -> u32 {
        u32::try_from(self.clock.now()).unwrap_or(u32::MAX)
    }

    /// Claim the queue for a replay session. `None` when a session started
    /// within `time_limit`.
    fn acquire(
        &self,
        handle: &mut dyn FileHandle,
        time_limit: Duration,
    ) -> Result<Option<BacklogHeader>, BacklogError> {
        let mut locked = HandleLock::acquire(handle, LockKind::Exclusive)?;
        let mut header = load_header(&mut *locked)?;
        let now = self.now();
        let limit = u32::try_from(time_limit.as_secs()).unwrap_or(u32::MAX);
        if now.saturating_sub(header.last_processing) <= limit {
            return Ok(None);
        }

        header.last_processing = now;
        if header.first_processing == 0 {
            header.first_processing = now;
        }
        store_header(&mut *locked, header)?;
        Ok(Some(header))
    }

    fn release(&self, handle: &mut dyn FileHandle) -> Result<(), BacklogError> {
        let mut locked = HandleLock::acquire(handle, LockKind::Exclusive)?;
        let mut header = load_header(&mut *locked)?;
        header.last_processing = 0;
        store_header(&mut *locked, header)?;
        Ok(())
    }

    fn update_header(&self, update: impl FnOnce(&mut BacklogHeader)) -> Result<(), BacklogError> {
        if !self.storage.exists(&self.path) {
            return Ok(());
        }
        let mut handle = self.storage.open(&self.path, OpenMode::ReadWrite)?;
        {
            let mut locked = HandleLock::acquire(handle.as_mut(), LockKind::Exclusive)?;
            let mut header = load_header(&mut *locked)?;
            update(&mut header);
            store_header(&mut *locked, header)?;
        }
        handle.close()?;
        Ok(())
    }

    /// Send entries from the committed offset until one fails, the queue ends
    /// or time runs out. Returns how many were delivered.
    fn deliver(
        &self,
        handle: &mut dyn FileHandle,
        header: BacklogHeader,
        started: Instant,
        time_limit: Duration,
        transport: &dyn Transport,
    ) -> Result<usize, BacklogError> {
        handle.seek(SeekFrom::Start(header.entries_start()))?;
        let mut delivered = 0;

        while started.elapsed() < time_limit {
            let Some(line) = handle.read_line()? else {
                break;
            };
            if line.is_empty() {
                continue;
            }
            let request = match decode_entry(&line) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(error = %e, "Stopping replay at undecodable backlog entry");
                    break;
                }
            };

            let remaining = time_limit.saturating_sub(started.elapsed());
            match replay_entry(&request, remaining, transport) {
                EntryOutcome::Delivered => {
                    let end = handle.tell()?;
                    let mut locked = HandleLock::acquire(&mut *handle, LockKind::Exclusive)?;
                    let mut current = load_header(&mut *locked)?;
                    current.offset = u32::try_from(end).unwrap_or(u32::MAX);
                    store_header(&mut *locked, current)?;
                    delivered += 1;
                }
                EntryOutcome::Failed => break,
            }
        }
        Ok(delivered)
    }
}

/// Send one entry, repeating it while the service asks for repeats.
fn replay_entry(request: &Request, time_limit: Duration, transport: &dyn Transport) -> EntryOutcome {
    let started = Instant::now();
    let mut response = match transport.send(request) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(path = %request.path, error = %e, "Backlog entry failed");
            return EntryOutcome::Failed;
        }
    };

    while wants_repeat(&response) {
        if started.elapsed() >= time_limit {
            tracing::debug!(path = %request.path, "Out of time while repeating backlog entry");
            return EntryOutcome::Failed;
        }
        response = match transport.replay(request) {
            Ok(response) if response.status() == ResponseStatus::Ok => response,
            Ok(response) => {
                tracing::warn!(path = %request.path, code = response.code, "Backlog entry repeat rejected");
                return EntryOutcome::Failed;
            }
            Err(e) => {
                tracing::warn!(path = %request.path, error = %e, "Backlog entry repeat failed");
                return EntryOutcome::Failed;
            }
        };
    }

    if response.status() == ResponseStatus::Ok {
        EntryOutcome::Delivered
    } else {
        tracing::warn!(path = %request.path, code = response.code, "Backlog entry rejected");
        EntryOutcome::Failed
    }
}

fn wants_repeat(response: &Response) -> bool {
    response.status() == ResponseStatus::Ok
        && response
            .header(REPEAT_HEADER)
            .is_some_and(|v| !v.is_empty() && v != "0")
}

fn decode_entry(line: &[u8]) -> Result<Request, BacklogError> {
    let json = STANDARD
        .decode(line.trim_ascii())
        .map_err(|e| BacklogError::Entry(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Read the header, writing an empty one when the file is too short to hold
/// it. Keeps the position.
fn load_header(handle: &mut dyn FileHandle) -> Result<BacklogHeader, BacklogError> {
    let pos = handle.tell()?;
    let len = handle.seek(SeekFrom::End(0))?;
    if len < HEADER_LEN {
        handle.seek(SeekFrom::Start(pos))?;
        let header = BacklogHeader::default();
        store_header(handle, header)?;
        return Ok(header);
    }
    handle.seek(SeekFrom::Start(0))?;
    let raw = handle.read(12)?;
    handle.seek(SeekFrom::Start(pos))?;
    Ok(BacklogHeader::from_bytes(&raw))
}

/// Overwrite the header in place. Keeps the position.
fn store_header(handle: &mut dyn FileHandle, header: BacklogHeader) -> Result<(), BacklogError> {
    let pos = handle.tell()?;
    handle.seek(SeekFrom::Start(0))?;
    handle.write(&header.to_bytes())?;
    handle.flush()?;
    handle.seek(SeekFrom::Start(pos))?;
    Ok(())
}
