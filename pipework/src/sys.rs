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

//! Thin wrappers around the system calls the engine makes
//!
//! The functions retry on `EINTR` where retrying is the only sensible
//! reaction, and return owned file descriptors so that they are closed when
//! dropped. All new file descriptors are opened with the close-on-exec flag.

use nix::errno::Errno;
use std::ffi::{CStr, c_int};
use std::mem::MaybeUninit;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Creates a pipe and returns its `(reader, writer)` ends.
pub(crate) fn pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    Errno::result(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    let reader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((reader, writer))
}

/// Opens a file with the given flags and mode `0666`.
pub(crate) fn open(path: &CStr, flags: c_int) -> nix::Result<OwnedFd> {
    let mode: libc::c_uint = 0o666;
    loop {
        let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, mode) };
        match Errno::result(fd) {
            Ok(fd) => return Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
            Err(Errno::EINTR) => (),
            Err(errno) => return Err(errno),
        }
    }
}

/// Duplicates `fd` to a new close-on-exec descriptor not less than `min`.
///
/// Returns `Ok(None)` if `fd` is not open.
pub(crate) fn dup_above(fd: RawFd, min: RawFd) -> nix::Result<Option<OwnedFd>> {
    match Errno::result(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) }) {
        Ok(new_fd) => Ok(Some(unsafe { OwnedFd::from_raw_fd(new_fd) })),
        Err(Errno::EBADF) => Ok(None),
        Err(errno) => Err(errno),
    }
}

pub(crate) fn dup2(from: RawFd, to: RawFd) -> nix::Result<()> {
    loop {
        match Errno::result(unsafe { libc::dup2(from, to) }) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => (),
            Err(errno) => return Err(errno),
        }
    }
}

/// Closes a file descriptor that is not owned by an `OwnedFd`.
///
/// Closing a descriptor that is not open is not an error.
pub(crate) fn close(fd: RawFd) -> nix::Result<()> {
    match Errno::result(unsafe { libc::close(fd) }) {
        Ok(_) | Err(Errno::EBADF) => Ok(()),
        Err(errno) => Err(errno),
    }
}

pub(crate) fn fd_flags(fd: RawFd) -> nix::Result<c_int> {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })
}

pub(crate) fn set_fd_flags(fd: RawFd, flags: c_int) -> nix::Result<()> {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags) }).map(drop)
}

pub(crate) fn read(fd: RawFd, buffer: &mut [u8]) -> nix::Result<usize> {
    loop {
        let count = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
        match Errno::result(count) {
            Ok(count) => return Ok(count as usize),
            Err(Errno::EINTR) => (),
            Err(errno) => return Err(errno),
        }
    }
}

pub(crate) fn write_all(fd: RawFd, mut buffer: &[u8]) -> nix::Result<()> {
    while !buffer.is_empty() {
        let count = unsafe { libc::write(fd, buffer.as_ptr().cast(), buffer.len()) };
        match Errno::result(count) {
            Ok(count) => buffer = &buffer[count as usize..],
            Err(Errno::EINTR) => (),
            Err(errno) => return Err(errno),
        }
    }
    Ok(())
}

/// Waits until `fd` becomes readable or hangs up.
///
/// Returns `Ok(false)` if the timeout (in milliseconds) expires first.
pub(crate) fn poll_readable(fd: RawFd, timeout: c_int) -> nix::Result<bool> {
    let mut poll_fd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let count = Errno::result(unsafe { libc::poll(&mut poll_fd, 1, timeout) })?;
    Ok(count > 0)
}

/// Device and inode numbers of the file `fd` refers to.
pub(crate) fn file_id(fd: RawFd) -> nix::Result<(u64, u64)> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    Errno::result(unsafe { libc::fstat(fd, stat.as_mut_ptr()) })?;
    let stat = unsafe { stat.assume_init() };
    #[allow(clippy::unnecessary_cast)]
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}

/// Access mode (`O_RDONLY`, `O_WRONLY` or `O_RDWR`) of the open file
/// description `fd` refers to.
pub(crate) fn access_mode(fd: RawFd) -> nix::Result<c_int> {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) }).map(|flags| flags & libc::O_ACCMODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_transfers_bytes() {
        let (reader, writer) = pipe().unwrap();
        write_all(writer.as_raw_fd(), b"abc").unwrap();
        drop(writer);
        let mut buffer = [0; 8];
        let count = read(reader.as_raw_fd(), &mut buffer).unwrap();
        assert_eq!(&buffer[..count], b"abc");
        assert_eq!(read(reader.as_raw_fd(), &mut buffer), Ok(0));
    }

    #[test]
    fn pipe_ends_are_close_on_exec() {
        let (reader, writer) = pipe().unwrap();
        assert_eq!(fd_flags(reader.as_raw_fd()), Ok(libc::FD_CLOEXEC));
        assert_eq!(fd_flags(writer.as_raw_fd()), Ok(libc::FD_CLOEXEC));
    }

    #[test]
    fn dup_above_returns_high_descriptor() {
        let (reader, _writer) = pipe().unwrap();
        let copy = dup_above(reader.as_raw_fd(), 10).unwrap().unwrap();
        assert!(copy.as_raw_fd() >= 10);
        assert_eq!(file_id(copy.as_raw_fd()), file_id(reader.as_raw_fd()));
    }

    #[test]
    fn poll_times_out_on_empty_pipe() {
        let (reader, writer) = pipe().unwrap();
        assert_eq!(poll_readable(reader.as_raw_fd(), 0), Ok(false));
        drop(writer);
        assert_eq!(poll_readable(reader.as_raw_fd(), 0), Ok(true));
    }
}
