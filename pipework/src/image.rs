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

//! Classification of executable images
//!
//! Before a suspended stage is resumed, the launcher reads the header of the
//! program image to decide how the stage should be terminated on
//! cancellation. Native executables and interpreter scripts run in the
//! foreground of a terminal session and are expected to handle an interrupt
//! signal, so they are interrupted gracefully. Anything else is killed.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of bytes read from the beginning of an image
const HEADER_SIZE: u64 = 64;

const ELF_MAGIC: &[u8] = b"\x7fELF";
/// Offset of the `EI_DATA` byte that tells the byte order
const ELF_DATA_OFFSET: usize = 5;
/// Offset of the `e_type` field
const ELF_TYPE_OFFSET: usize = 16;
const ELF_DATA_LSB: u8 = 1;
const ELF_DATA_MSB: u8 = 2;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

/// Kind of program an image contains
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Subsystem {
    /// Executable or shared object that runs attached to a terminal, or a
    /// script starting with `#!`
    #[default]
    Console,
    /// Anything else
    Other,
}

impl Subsystem {
    /// Classifies an image by its first bytes.
    #[must_use]
    pub fn from_header(header: &[u8]) -> Self {
        if header.starts_with(b"#!") {
            return Subsystem::Console;
        }
        if !header.starts_with(ELF_MAGIC) || header.len() < ELF_TYPE_OFFSET + 2 {
            return Subsystem::Other;
        }
        let bytes = [header[ELF_TYPE_OFFSET], header[ELF_TYPE_OFFSET + 1]];
        let elf_type = match header[ELF_DATA_OFFSET] {
            ELF_DATA_LSB => u16::from_le_bytes(bytes),
            ELF_DATA_MSB => u16::from_be_bytes(bytes),
            _ => return Subsystem::Other,
        };
        match elf_type {
            ET_EXEC | ET_DYN => Subsystem::Console,
            _ => Subsystem::Other,
        }
    }

    /// Whether processes running this kind of image should be interrupted
    /// rather than killed.
    #[must_use]
    pub fn allows_graceful_termination(self) -> bool {
        self == Subsystem::Console
    }
}

/// Error in reading an image header
#[derive(Debug, Error)]
#[error("cannot inspect `{}`: {source}", path.display())]
pub struct InspectionError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Reads the header of the image at `path` and classifies it.
pub fn inspect(path: &Path) -> Result<Subsystem, InspectionError> {
    let error = |source| InspectionError {
        path: path.to_owned(),
        source,
    };
    let file = File::open(path).map_err(error)?;
    let mut header = Vec::with_capacity(HEADER_SIZE as usize);
    file.take(HEADER_SIZE)
        .read_to_end(&mut header)
        .map_err(error)?;
    Ok(Subsystem::from_header(&header))
}
