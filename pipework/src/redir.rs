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

//! Redirection of the standard streams
//!
//! # Effect of redirections
//!
//! The redirection engine binds the standard streams of the engine's own
//! process to the [targets](StdioTarget) of a stage, so that the process
//! forked next inherits them. The streams are redirected in the order
//! standard input, standard output and standard error:
//!
//! - `Default` leaves the stream untouched.
//! - `File` opens a file for reading (standard input), or for writing after
//!   truncating it (output streams). `Append` opens a file for appending.
//!   Files are created if missing.
//! - `Null` opens the null device.
//! - `Pipe` on standard input takes over the read end supplied by the
//!   previous stage. On an output stream, it creates a new pipe whose read
//!   end is kept in the [`PreviousRedirectState`] for the next stage. If
//!   both output streams are piped, they share one pipe.
//! - `Buffer` creates a new pipe and starts a [reader](crate::pump) that
//!   collects its output into the buffer. If the buffer is already being
//!   filled, the new reader appends to it.
//! - `MergeToSibling` makes the stream a copy of the other output stream as
//!   it is when this stream is redirected. Because standard output is
//!   redirected first, merging standard output into standard error binds
//!   it to the *original* standard error.
//!
//! # Restoring the streams
//!
//! Before a stream is replaced, its open file description is saved in a
//! close-on-exec file descriptor not less than [`MIN_SAVE_FD`]. Dropping the
//! [`PreviousRedirectState`] (or calling
//! [`revert`](PreviousRedirectState::revert)) moves the saved descriptions
//! back in reverse order. If any redirection fails, the ones already made are
//! reverted before the error is returned, so a failed
//! [`initialize`] leaves the streams as they were.
//!
//! Redirections affect the whole process, so they must be serialized with
//! other redirections and with forking. [`initialize`] requires a
//! [`StdioLock`] as a witness, and the returned state borrows it so that it
//! cannot outlive the lock.

use crate::context::ExecContext;
use crate::pump::{self, BufferHandle};
use crate::stdio::{NULL_DEVICE, StdioTarget, Stream};
use crate::sys;
use nix::errno::Errno;
use std::ffi::{CString, c_int};
use std::io::Write;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Minimum file descriptor number used to save the original streams
pub const MIN_SAVE_FD: c_int = 10;

static STDIO: Mutex<()> = Mutex::new(());

/// Exclusive right to modify the standard streams of the process
#[derive(Debug)]
#[must_use = "the lock is released when dropped"]
pub struct StdioLock {
    _guard: MutexGuard<'static, ()>,
}

/// Acquires the [`StdioLock`], blocking until it is available.
pub fn lock_stdio() -> StdioLock {
    let _guard = STDIO.lock().unwrap_or_else(PoisonError::into_inner);
    StdioLock { _guard }
}

/// Types of errors that may occur in redirection
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RedirErrorCause {
    /// Error while opening a file
    #[error("cannot open `{path}`: {errno}", path = .0.display(), errno = .1)]
    OpenFile(PathBuf, Errno),
    /// Pathname containing a nul byte
    #[error("nul byte found in the pathname")]
    NulByte,
    /// The original stream could not be saved.
    #[error("cannot save the original stream: {0}")]
    SaveFd(Errno),
    /// The stream could not be replaced.
    #[error("cannot redirect the stream: {0}")]
    BindFd(Errno),
    #[error("cannot create a pipe: {0}")]
    Pipe(Errno),
    /// The target cannot be used for this stream.
    #[error("this target is not applicable to the stream")]
    InapplicableTarget,
    /// Both output streams are merged into each other.
    #[error("standard output and standard error cannot both be merged into each other")]
    MutualMerge,
}

/// Error in redirecting a stream
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{stream}: {cause}")]
pub struct RedirError {
    pub stream: Stream,
    pub cause: RedirErrorCause,
}

/// Identity of the open file description a stream refers to
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
    pub access_mode: c_int,
    pub close_on_exec: bool,
}

/// Identities of the three standard streams (`None` if closed)
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StdioSnapshot {
    pub stdin: Option<FileIdentity>,
    pub stdout: Option<FileIdentity>,
    pub stderr: Option<FileIdentity>,
}

/// Returns the identities of the current standard streams.
///
/// This function has no side effects.
#[must_use]
pub fn capture_current_state() -> StdioSnapshot {
    fn identify(stream: Stream) -> Option<FileIdentity> {
        let fd = stream.fd();
        let (device, inode) = sys::file_id(fd).ok()?;
        let access_mode = sys::access_mode(fd).ok()?;
        let close_on_exec = sys::fd_flags(fd).ok()? & libc::FD_CLOEXEC != 0;
        Some(FileIdentity {
            device,
            inode,
            access_mode,
            close_on_exec,
        })
    }
    StdioSnapshot {
        stdin: identify(Stream::Stdin),
        stdout: identify(Stream::Stdout),
        stderr: identify(Stream::Stderr),
    }
}

/// Record of saving a stream in another file descriptor
#[derive(Debug)]
struct SavedStream {
    /// Copy of the original open file description, or `None` if the stream
    /// was closed
    save: Option<OwnedFd>,
    /// File descriptor flags of the original stream
    flags: c_int,
}

impl SavedStream {
    fn restore(self, stream: Stream) {
        let fd = stream.fd();
        if let Some(save) = self.save {
            debug_assert_ne!(save.as_raw_fd(), fd);
            let _: Result<_, _> = sys::dup2(save.as_raw_fd(), fd);
            let _: Result<_, _> = sys::set_fd_flags(fd, self.flags);
        } else {
            let _: Result<_, _> = sys::close(fd);
        }
    }
}

/// Record of redirections performed by [`initialize`]
///
/// Dropping this state restores the streams. The read end of a pipe created
/// for an output stream is closed with the state unless it has been taken
/// with [`take_pipe_for_next`](Self::take_pipe_for_next).
#[derive(Debug)]
#[must_use = "the streams are restored when the state is dropped"]
pub struct PreviousRedirectState<'l> {
    _lock: &'l StdioLock,
    stdin: Option<SavedStream>,
    stdout: Option<SavedStream>,
    stderr: Option<SavedStream>,
    stdout_aliases_stderr: bool,
    stderr_aliases_stdout: bool,
    pipe_for_next: Option<OwnedFd>,
    for_builtin: bool,
}

impl<'l> PreviousRedirectState<'l> {
    fn new(lock: &'l StdioLock, for_builtin: bool) -> Self {
        PreviousRedirectState {
            _lock: lock,
            stdin: None,
            stdout: None,
            stderr: None,
            stdout_aliases_stderr: false,
            stderr_aliases_stdout: false,
            pipe_for_next: None,
            for_builtin,
        }
    }

    fn saved_mut(&mut self, stream: Stream) -> &mut Option<SavedStream> {
        match stream {
            Stream::Stdin => &mut self.stdin,
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    /// Returns true if the stream has been redirected.
    #[must_use]
    pub fn is_redirected(&self, stream: Stream) -> bool {
        match stream {
            Stream::Stdin => self.stdin.is_some(),
            Stream::Stdout => self.stdout.is_some(),
            Stream::Stderr => self.stderr.is_some(),
        }
    }

    /// Returns true if standard output is a copy of standard error.
    #[must_use]
    pub fn stdout_aliases_stderr(&self) -> bool {
        self.stdout_aliases_stderr
    }

    /// Returns true if standard error is a copy of standard output.
    #[must_use]
    pub fn stderr_aliases_stdout(&self) -> bool {
        self.stderr_aliases_stdout
    }

    /// Takes the read end of the pipe created for an output stream.
    ///
    /// The read end should become the standard input of the next stage.
    pub fn take_pipe_for_next(&mut self) -> Option<OwnedFd> {
        self.pipe_for_next.take()
    }

    /// Restores the streams to the state before [`initialize`].
    pub fn revert(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        if self.for_builtin {
            flush_std_streams();
        }
        for stream in [Stream::Stderr, Stream::Stdout, Stream::Stdin] {
            if let Some(saved) = self.saved_mut(stream).take() {
                saved.restore(stream);
            }
        }
        self.stdout_aliases_stderr = false;
        self.stderr_aliases_stdout = false;
    }
}

impl Drop for PreviousRedirectState<'_> {
    fn drop(&mut self) {
        self.undo()
    }
}

/// Flushes the buffered standard streams of the Rust runtime.
///
/// Output written by in-process code must reach the redirected descriptors
/// before they are switched.
fn flush_std_streams() {
    let _: Result<_, _> = std::io::stdout().flush();
    let _: Result<_, _> = std::io::stderr().flush();
}

/// Source of the new open file description for a stream
enum Source {
    /// Newly opened file descriptor
    Owned(OwnedFd),
    /// Copy of another stream
    Alias(Stream),
}

/// Redirects the standard streams according to the targets of `context`.
///
/// On success, the returned state remembers the original streams. Pipes
/// supplied in the targets are taken out of `context`. If `for_builtin` is
/// true, the standard output and error buffers of this process are flushed
/// before redirecting and before restoring, for running code in-process with
/// the redirections in effect.
///
/// On failure, all redirections made so far are reverted.
pub fn initialize<'l>(
    lock: &'l StdioLock,
    context: &mut ExecContext,
    for_builtin: bool,
) -> Result<PreviousRedirectState<'l>, RedirError> {
    if context.stdout_target.is_merge() && context.stderr_target.is_merge() {
        return Err(RedirError {
            stream: Stream::Stderr,
            cause: RedirErrorCause::MutualMerge,
        });
    }

    if for_builtin {
        flush_std_streams();
    }

    let mut state = PreviousRedirectState::new(lock, for_builtin);
    redirect(&mut state, Stream::Stdin, &mut context.stdin_target)?;
    redirect(&mut state, Stream::Stdout, &mut context.stdout_target)?;
    redirect(&mut state, Stream::Stderr, &mut context.stderr_target)?;
    debug!(
        stdin = state.is_redirected(Stream::Stdin),
        stdout = state.is_redirected(Stream::Stdout),
        stderr = state.is_redirected(Stream::Stderr),
        "redirected standard streams"
    );
    Ok(state)
}

/// Runs `f` with the standard streams redirected for `context`.
///
/// This is for commands that run inside the engine's process. The streams
/// are restored when `f` returns. A pipe created for an output stream is
/// closed at that time, so the command cannot feed a following stage.
pub fn with_redirection<R, F>(context: &mut ExecContext, f: F) -> Result<R, RedirError>
where
    F: FnOnce() -> R,
{
    let lock = lock_stdio();
    let state = initialize(&lock, context, true)?;
    let result = f();
    state.revert();
    Ok(result)
}

/// Performs the redirection of a single stream.
fn redirect(
    state: &mut PreviousRedirectState<'_>,
    stream: Stream,
    target: &mut StdioTarget,
) -> Result<(), RedirError> {
    if matches!(target, StdioTarget::Default) {
        return Ok(());
    }
    let error = |cause| RedirError { stream, cause };
    trace!(%stream, ?target, "redirecting");

    // Save the current open file description
    let fd = stream.fd();
    let flags = sys::fd_flags(fd).unwrap_or(0);
    let save =
        sys::dup_above(fd, MIN_SAVE_FD).map_err(|errno| error(RedirErrorCause::SaveFd(errno)))?;
    *state.saved_mut(stream) = Some(SavedStream { save, flags });

    let source = match stream {
        Stream::Stdin => input_source(target),
        Stream::Stdout | Stream::Stderr => output_source(state, stream, target),
    }
    .map_err(error)?;
    install(stream, source).map_err(|errno| error(RedirErrorCause::BindFd(errno)))
}

fn open_file(path: &Path, flags: c_int) -> Result<OwnedFd, RedirErrorCause> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| RedirErrorCause::NulByte)?;
    sys::open(&c_path, flags).map_err(|errno| RedirErrorCause::OpenFile(path.to_owned(), errno))
}

fn input_source(target: &mut StdioTarget) -> Result<Source, RedirErrorCause> {
    match target {
        StdioTarget::File(path) | StdioTarget::Append(path) => {
            open_file(path, libc::O_RDONLY).map(Source::Owned)
        }
        StdioTarget::Null => open_file(Path::new(NULL_DEVICE), libc::O_RDONLY).map(Source::Owned),
        StdioTarget::Pipe(upstream) => match upstream.take() {
            Some(reader) => Ok(Source::Owned(reader)),
            None => {
                // Nobody will write to this pipe
                let (reader, _writer) = sys::pipe().map_err(RedirErrorCause::Pipe)?;
                Ok(Source::Owned(reader))
            }
        },
        StdioTarget::Default | StdioTarget::Buffer(_) | StdioTarget::MergeToSibling => {
            Err(RedirErrorCause::InapplicableTarget)
        }
    }
}

fn output_source(
    state: &mut PreviousRedirectState<'_>,
    stream: Stream,
    target: &mut StdioTarget,
) -> Result<Source, RedirErrorCause> {
    let sibling = stream.sibling().ok_or(RedirErrorCause::InapplicableTarget)?;
    match target {
        StdioTarget::File(path) => {
            open_file(path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC).map(Source::Owned)
        }
        StdioTarget::Append(path) => {
            open_file(path, libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND).map(Source::Owned)
        }
        StdioTarget::Null => open_file(Path::new(NULL_DEVICE), libc::O_WRONLY).map(Source::Owned),
        StdioTarget::Pipe(writer) => {
            if let Some(writer) = writer.take() {
                return Ok(Source::Owned(writer));
            }
            if state.pipe_for_next.is_some() {
                // The sibling already writes to the pipe for the next stage.
                set_alias(state, stream);
                return Ok(Source::Alias(sibling));
            }
            let (reader, writer) = sys::pipe().map_err(RedirErrorCause::Pipe)?;
            state.pipe_for_next = Some(reader);
            Ok(Source::Owned(writer))
        }
        StdioTarget::Buffer(handle) => {
            let (reader, writer) = sys::pipe().map_err(RedirErrorCause::Pipe)?;
            attach_buffer(handle, reader, stream);
            Ok(Source::Owned(writer))
        }
        StdioTarget::MergeToSibling => {
            set_alias(state, stream);
            Ok(Source::Alias(sibling))
        }
        StdioTarget::Default => Err(RedirErrorCause::InapplicableTarget),
    }
}

fn set_alias(state: &mut PreviousRedirectState<'_>, stream: Stream) {
    match stream {
        Stream::Stdout => state.stdout_aliases_stderr = true,
        Stream::Stderr => state.stderr_aliases_stdout = true,
        Stream::Stdin => (),
    }
}

/// Starts collecting the pipe into the buffer.
///
/// If no reader can be started, the read end is closed and the capture stays
/// empty.
fn attach_buffer(handle: &BufferHandle, reader: OwnedFd, stream: Stream) {
    let merged = handle.is_pumping();
    match pump::append_existing(reader, handle) {
        Ok(()) => trace!(%stream, merged, "capturing output"),
        Err(error) => warn!(%stream, %error, "output will not be captured"),
    }
}

/// Makes the stream refer to the source.
fn install(stream: Stream, source: Source) -> nix::Result<()> {
    let fd = stream.fd();
    match source {
        Source::Alias(sibling) => sys::dup2(sibling.fd(), fd),
        Source::Owned(new_fd) if new_fd.as_raw_fd() == fd => {
            // The stream was closed and the file happened to be opened on it.
            let new_fd = new_fd.into_raw_fd();
            sys::set_fd_flags(new_fd, 0)
        }
        Source::Owned(new_fd) => sys::dup2(new_fd.as_raw_fd(), fd),
    }
}
