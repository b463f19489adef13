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

//! Command lines of stages
//!
//! A [`CommandLine`] is the argument vector of a stage together with the
//! information whether each argument was quoted in the source it was parsed
//! from. The quoting matters only when the command line is rendered back to
//! a string, which happens when a plan is delegated to a secondary shell and
//! when stages are reported in logs.
//!
//! Rendering follows the rules of POSIX double quotes:
//!
//! - An argument that was quoted is wrapped in double quotes.
//! - An argument that was not quoted is wrapped in double quotes if it is
//!   empty or contains whitespace, so that it stays a single word.
//! - Inside double quotes, `"`, `$`, `` ` `` and `\` are escaped with a
//!   backslash, unless the command line is rendered with literal escapes.
//!   Literal escapes are for command lines that were constructed
//!   programmatically and already contain the escapes they need.

use crate::config::Config;
use crate::search::{is_executable_file, search_path};
use itertools::Itertools;
use std::ffi::{CString, OsStr};
use std::fmt::Write;
use thiserror::Error;

/// Error in constructing or converting a command line
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum CmdLineError {
    #[error("empty command")]
    Empty,
    #[error("argument contains a nul byte: {0:?}")]
    NulByte(String),
    #[error("cannot find the command interpreter `{0}`")]
    InterpreterNotFound(String),
}

/// Single argument of a command line
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Argument {
    /// Argument value passed to the program
    pub value: String,
    /// Whether the argument was quoted in the source
    pub quoted: bool,
}

impl Argument {
    /// Creates an argument that was not quoted.
    pub fn new<S: Into<String>>(value: S) -> Self {
        let value = value.into();
        Argument {
            value,
            quoted: false,
        }
    }

    /// Creates an argument that was quoted.
    pub fn quoted<S: Into<String>>(value: S) -> Self {
        let value = value.into();
        Argument {
            value,
            quoted: true,
        }
    }

    /// Returns an object that displays the argument as a shell word.
    pub fn display(&self, literal_escapes: bool) -> DisplayArgument<'_> {
        DisplayArgument {
            argument: self,
            literal_escapes,
        }
    }

    fn needs_quotes(&self) -> bool {
        self.quoted || self.value.is_empty() || self.value.chars().any(char::is_whitespace)
    }
}

/// Display adapter returned by [`Argument::display`]
#[derive(Clone, Copy, Debug)]
#[must_use = "`DisplayArgument` does nothing unless printed"]
pub struct DisplayArgument<'a> {
    argument: &'a Argument,
    literal_escapes: bool,
}

impl std::fmt::Display for DisplayArgument<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = &self.argument.value;
        if !self.argument.needs_quotes() {
            return f.write_str(value);
        }
        f.write_char('"')?;
        if self.literal_escapes {
            f.write_str(value)?;
        } else {
            for c in value.chars() {
                if matches!(c, '"' | '`' | '$' | '\\') {
                    f.write_char('\\')?;
                }
                f.write_char(c)?;
            }
        }
        f.write_char('"')
    }
}

/// Argument vector of a stage
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandLine {
    args: Vec<Argument>,
}

impl CommandLine {
    /// Creates a command line from `(value, quoted)` pairs.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        let args = args
            .into_iter()
            .map(|(value, quoted)| Argument {
                value: value.into(),
                quoted,
            })
            .collect();
        CommandLine { args }
    }

    /// Creates a command line from unquoted words.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_args(words.into_iter().map(|word| (word, false)))
    }

    /// Creates a command line that runs `raw` in a secondary shell.
    ///
    /// The interpreter named by [`Config::shell_name`] is searched for in
    /// `$PATH`, falling back to [`Config::fallback_shell`]. The resulting
    /// command line is `interpreter -c raw`, where `raw` is marked quoted so
    /// that it is passed as a single argument.
    pub fn wrap_for_secondary_shell<S: Into<String>>(
        raw: S,
        config: &Config,
    ) -> Result<Self, CmdLineError> {
        let path = std::env::var_os("PATH");
        let interpreter = search_path(OsStr::new(&config.shell_name), path.as_deref())
            .or_else(|| Some(config.fallback_shell.clone()).filter(|p| is_executable_file(p)))
            .ok_or_else(|| CmdLineError::InterpreterNotFound(config.shell_name.clone()))?;
        let interpreter = interpreter.to_string_lossy().into_owned();
        Ok(CommandLine {
            args: vec![
                Argument::new(interpreter),
                Argument::new("-c"),
                Argument::quoted(raw),
            ],
        })
    }

    #[must_use]
    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Returns the command name, that is, the first argument.
    #[must_use]
    pub fn program(&self) -> Option<&str> {
        self.args.first().map(|arg| arg.value.as_str())
    }

    /// Appends an argument.
    pub fn push(&mut self, argument: Argument) {
        self.args.push(argument);
    }

    /// Converts the arguments to C strings for `execve`.
    pub fn to_c_strings(&self) -> Result<Vec<CString>, CmdLineError> {
        if self.args.is_empty() {
            return Err(CmdLineError::Empty);
        }
        self.args
            .iter()
            .map(|arg| {
                CString::new(arg.value.as_bytes())
                    .map_err(|_| CmdLineError::NulByte(arg.value.clone()))
            })
            .collect()
    }

    /// Renders the command line as a single string.
    #[must_use]
    pub fn render(&self, literal_escapes: bool) -> String {
        self.args
            .iter()
            .format_with(" ", |arg, f| f(&arg.display(literal_escapes)))
            .to_string()
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render(false))
    }
}
