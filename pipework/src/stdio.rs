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

//! Standard streams and the targets they can be bound to

use crate::pump::BufferHandle;
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;

/// One of the three standard streams of a process
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    /// All streams in the order they are redirected
    pub const ALL: [Stream; 3] = [Stream::Stdin, Stream::Stdout, Stream::Stderr];

    /// Returns the file descriptor number of the stream.
    #[must_use]
    pub const fn fd(self) -> RawFd {
        match self {
            Stream::Stdin => 0,
            Stream::Stdout => 1,
            Stream::Stderr => 2,
        }
    }

    /// Returns the other output stream.
    ///
    /// Standard output and standard error are siblings of each other.
    /// Standard input has no sibling.
    #[must_use]
    pub const fn sibling(self) -> Option<Stream> {
        match self {
            Stream::Stdin => None,
            Stream::Stdout => Some(Stream::Stderr),
            Stream::Stderr => Some(Stream::Stdout),
        }
    }
}

/// Where a standard stream of a stage is bound
///
/// The default target leaves the stream as inherited from the engine's
/// process. The other targets are resolved by the
/// [redirection engine](crate::redir) just before the stage is launched.
#[derive(Debug, Default)]
pub enum StdioTarget {
    /// Inherit the stream as is.
    #[default]
    Default,
    /// Read from (or truncate and write to) the named file.
    File(PathBuf),
    /// Append to the named file, creating it if needed.
    ///
    /// For standard input, this is the same as `File`.
    Append(PathBuf),
    /// Bind the stream to the null device.
    Null,
    /// Connect the stream to a pipe.
    ///
    /// For standard input, the pipe's read end is usually supplied by the
    /// previous stage's launch. If none has been supplied, a fresh pipe is
    /// created and its write end closed, so the stage reads end-of-file.
    ///
    /// For standard output and standard error, a fresh pipe is created unless
    /// a write end is supplied, and the read end is handed to the next
    /// stage's standard input.
    Pipe(Option<OwnedFd>),
    /// Capture the output into an in-memory buffer.
    ///
    /// If standard output and standard error share one handle, both streams
    /// are appended to the same buffer.
    Buffer(BufferHandle),
    /// Make the stream a duplicate of its sibling output stream.
    MergeToSibling,
}

impl StdioTarget {
    /// Returns true if this is [`MergeToSibling`](Self::MergeToSibling).
    #[must_use]
    pub fn is_merge(&self) -> bool {
        matches!(self, StdioTarget::MergeToSibling)
    }

    /// Returns true if this is a [`Pipe`](Self::Pipe), with or without a
    /// file descriptor.
    #[must_use]
    pub fn is_pipe(&self) -> bool {
        matches!(self, StdioTarget::Pipe(_))
    }

    /// Creates a target that opens `path`, mapping the null device to
    /// [`Null`](Self::Null).
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        if path.as_os_str() == NULL_DEVICE {
            StdioTarget::Null
        } else {
            StdioTarget::File(path)
        }
    }

    /// Creates an appending target, mapping the null device to
    /// [`Null`](Self::Null).
    pub fn append<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        if path.as_os_str() == NULL_DEVICE {
            StdioTarget::Null
        } else {
            StdioTarget::Append(path)
        }
    }
}

/// Path of the null device
pub const NULL_DEVICE: &str = "/dev/null";

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn stream_numbers_and_names() {
        assert_eq!(Stream::Stdin.fd(), 0);
        assert_eq!(Stream::Stdout.fd(), 1);
        assert_eq!(Stream::Stderr.fd(), 2);
        assert_eq!(Stream::Stderr.to_string(), "stderr");
    }

    #[test]
    fn output_streams_are_siblings() {
        assert_eq!(Stream::Stdout.sibling(), Some(Stream::Stderr));
        assert_eq!(Stream::Stderr.sibling(), Some(Stream::Stdout));
        assert_eq!(Stream::Stdin.sibling(), None);
    }

    #[test]
    fn null_device_path_becomes_null_target() {
        assert_matches!(StdioTarget::file("/dev/null"), StdioTarget::Null);
        assert_matches!(StdioTarget::append("/dev/null"), StdioTarget::Null);
        assert_matches!(StdioTarget::file("out.txt"), StdioTarget::File(path) => {
            assert_eq!(path, PathBuf::from("out.txt"));
        });
    }
}
