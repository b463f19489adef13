// This file is part of pipework, a process pipeline engine for shells.
// Copyright (C) 2026 The pipework authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Background capture of pipe output into memory
//!
//! A [`BufferHandle`] names an in-memory buffer that collects whatever is
//! written to one or more pipes. Each pipe is drained by its own reader
//! thread started with [`start`] or [`append_existing`]; all readers of a
//! handle append to the same buffer, so output that a stage writes to both
//! standard output and standard error ends up in one place.
//!
//! The buffer may be read at any time with [`BufferHandle::contents`].
//! [`BufferHandle::wait_for_eof`] blocks until every pipe has been closed by
//! its writers, and [`BufferHandle::stop`] asks the readers to drain what is
//! available and quit without waiting for end-of-file.

use crate::sys;
use nix::errno::Errno;
use std::ffi::c_int;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{trace, warn};

/// Size of a single read from a pipe
const CHUNK_SIZE: usize = 16 * 1024;

/// Interval in milliseconds at which readers check the stop request
const STOP_POLL_INTERVAL: c_int = 50;

/// Error in starting a reader thread
#[derive(Debug, Error)]
#[error("cannot start a buffer reader thread: {0}")]
pub struct PumpError(#[from] pub std::io::Error);

/// Bytes collected so far
#[derive(Debug, Default)]
struct CaptureBuffer {
    /// Maximum number of bytes to keep, or zero for no limit
    limit: usize,
    bytes: Vec<u8>,
    /// Whether the output exceeded the limit
    ///
    /// Once set, the buffer stays empty and further input is ignored.
    discarded: bool,
}

impl CaptureBuffer {
    /// Appends data, or discards everything if the limit would be exceeded.
    ///
    /// Returns false if the data was not kept.
    fn append(&mut self, data: &[u8]) -> bool {
        if self.discarded {
            return false;
        }
        let proposed = self.bytes.len().checked_add(data.len());
        match proposed {
            Some(size) if self.limit == 0 || size <= self.limit => {
                self.bytes.extend_from_slice(data);
                true
            }
            _ => {
                self.bytes = Vec::new();
                self.discarded = true;
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    buffer: Mutex<CaptureBuffer>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stop: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared reference to a capture buffer
///
/// Cloning a handle yields another reference to the same buffer.
#[derive(Clone, Default)]
pub struct BufferHandle(Arc<Shared>);

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buffer = lock(&self.0.buffer);
        f.debug_struct("BufferHandle")
            .field("len", &buffer.bytes.len())
            .field("limit", &buffer.limit)
            .field("discarded", &buffer.discarded)
            .field("pumping", &self.is_pumping())
            .finish()
    }
}

impl BufferHandle {
    /// Creates a new unlimited buffer with no readers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new buffer that keeps at most `limit` bytes.
    ///
    /// If more output arrives, the buffer is emptied and marked
    /// [discarded](Self::is_discarded). A limit of zero means no limit.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let handle = Self::default();
        lock(&handle.0.buffer).limit = limit;
        handle
    }

    /// Returns a snapshot of the bytes collected so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.0.buffer).bytes.clone()
    }

    /// Returns true if the output exceeded the buffer limit.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        lock(&self.0.buffer).discarded
    }

    /// Returns true if a reader has been started for this buffer.
    #[must_use]
    pub fn is_pumping(&self) -> bool {
        self.0.started.load(Ordering::Acquire)
    }

    /// Returns true if both handles refer to the same buffer.
    #[must_use]
    pub fn ptr_eq(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Asks the readers to collect what is currently readable and finish.
    ///
    /// This function does not wait for the readers. Call
    /// [`wait_for_eof`](Self::wait_for_eof) afterwards to join them.
    pub fn stop(&self) {
        self.0.stop.store(true, Ordering::Release);
    }

    /// Waits until all readers started so far have finished.
    ///
    /// A reader finishes when all write ends of its pipe are closed, or soon
    /// after [`stop`](Self::stop) is called.
    pub fn wait_for_eof(&self) {
        let readers = std::mem::take(&mut *lock(&self.0.readers));
        for reader in readers {
            if reader.join().is_err() {
                warn!("buffer reader thread panicked");
            }
        }
    }
}

/// Starts collecting the output of a pipe into a new buffer.
pub fn start(read_end: OwnedFd) -> Result<BufferHandle, PumpError> {
    let handle = BufferHandle::new();
    spawn_reader(&handle, read_end)?;
    Ok(handle)
}

/// Starts collecting the output of a pipe into an existing buffer.
///
/// The new reader appends to the same buffer as the readers already started
/// for `existing`, so the two pipes are merged rather than captured
/// independently.
pub fn append_existing(read_end: OwnedFd, existing: &BufferHandle) -> Result<(), PumpError> {
    spawn_reader(existing, read_end)
}

fn spawn_reader(handle: &BufferHandle, read_end: OwnedFd) -> Result<(), PumpError> {
    let shared = Arc::clone(&handle.0);
    let reader = thread::Builder::new()
        .name("pipework-pump".to_owned())
        .spawn(move || fill(&shared, read_end))?;
    handle.0.started.store(true, Ordering::Release);
    lock(&handle.0.readers).push(reader);
    Ok(())
}

/// Body of a reader thread
fn fill(shared: &Shared, read_end: OwnedFd) {
    let fd = read_end.as_raw_fd();
    let mut chunk = vec![0; CHUNK_SIZE];
    loop {
        let stopping = shared.stop.load(Ordering::Acquire);
        let timeout = if stopping { 0 } else { STOP_POLL_INTERVAL };
        match sys::poll_readable(fd, timeout) {
            Ok(true) => (),
            Ok(false) if stopping => break,
            Ok(false) | Err(Errno::EINTR) => continue,
            Err(errno) => {
                warn!(fd, %errno, "cannot poll the captured pipe");
                break;
            }
        }
        match sys::read(fd, &mut chunk) {
            Ok(0) => break,
            Ok(count) => {
                if !lock(&shared.buffer).append(&chunk[..count]) {
                    trace!(fd, "captured output exceeds the buffer limit");
                }
            }
            Err(errno) => {
                warn!(fd, %errno, "cannot read the captured pipe");
                break;
            }
        }
    }
    trace!(fd, "buffer reader finished");
}
