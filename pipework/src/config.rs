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

//! Engine configuration

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Environment variable naming the interpreter of secondary shells
pub const SHELL_VAR: &str = "PIPEWORK_SHELL";

/// Environment variable limiting the size of capture buffers
pub const BUFFER_LIMIT_VAR: &str = "PIPEWORK_BUFFER_LIMIT";

/// Environment variable through which a stage finds its environment channel
///
/// A stage that is asked to report its environment on exit gets this
/// variable set to the number of a file descriptor. The stage writes its
/// environment to the descriptor as `NAME=value` records, each terminated by
/// a nul byte.
pub const ENV_FD_VAR: &str = "PIPEWORK_ENV_FD";

/// What happens to running stages when a plan is cancelled
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum CancelAction {
    /// Terminate the stages and wait for them to exit.
    #[default]
    Terminate,
    /// Leave the stages running and hand them to the caller.
    LeaveRunning,
}

/// Configuration of the pipeline engine
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Name of the interpreter that runs delegated command lines
    pub shell_name: String,
    /// Interpreter used if `shell_name` is not found in `$PATH`, and for
    /// executing files that the kernel does not recognize as executables
    pub fallback_shell: PathBuf,
    /// Maximum number of bytes kept in a capture buffer (zero for no limit)
    pub buffer_limit: usize,
    /// Interval at which running stages are polled for exit
    pub poll_interval: Duration,
    /// Time a gracefully terminated stage is given before it is killed
    pub kill_grace: Duration,
    pub cancel_action: CancelAction,
    /// Working directory for launched stages (`None` to inherit)
    pub working_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shell_name: "sh".to_string(),
            fallback_shell: PathBuf::from("/bin/sh"),
            buffer_limit: 0,
            poll_interval: Duration::from_millis(10),
            kill_grace: Duration::from_secs(1),
            cancel_action: CancelAction::default(),
            working_dir: None,
        }
    }
}

impl Config {
    /// Creates a configuration from the default values overridden by
    /// environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var_os(name))
    }

    /// Creates a configuration from variables looked up by `get`.
    pub fn from_vars<F, V>(get: F) -> Self
    where
        F: Fn(&str) -> Option<V>,
        V: AsRef<OsStr>,
    {
        let mut config = Config::default();
        if let Some(shell) = get(SHELL_VAR) {
            let shell = shell.as_ref().to_string_lossy();
            if !shell.is_empty() {
                config.shell_name = shell.into_owned();
            }
        }
        if let Some(limit) = get(BUFFER_LIMIT_VAR) {
            let limit = limit.as_ref().to_string_lossy();
            match limit.parse() {
                Ok(limit) => config.buffer_limit = limit,
                Err(error) => warn!(%limit, %error, "ignoring invalid {BUFFER_LIMIT_VAR}"),
            }
        }
        config
    }
}
