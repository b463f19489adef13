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

//! Interface to the operating system
//!
//! The [`System`] trait is the seam between the [plan
//! orchestrator](crate::plan) and the processes it runs. [`RealSystem`]
//! forks real processes; [`VirtualSystem`](crate::VirtualSystem) simulates
//! them for testing the orchestration logic.

use crate::config::Config;
use crate::context::ExecContext;
use crate::launch::{LaunchError, ProcessLauncher};
use crate::status::ExitStatus;
use crate::stdio::StdioTarget;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::fmt::Debug;
use std::path::Path;

/// Handle to a process running a stage
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChildProcess {
    pid: Pid,
    terminate_gracefully: bool,
}

impl ChildProcess {
    #[must_use]
    pub fn new(pid: Pid, terminate_gracefully: bool) -> Self {
        ChildProcess {
            pid,
            terminate_gracefully,
        }
    }

    /// Process ID, which is also the process group ID
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the process is interrupted rather than killed on termination
    #[must_use]
    pub fn terminate_gracefully(&self) -> bool {
        self.terminate_gracefully
    }

    /// Returns the signal [`terminate`](Self::terminate) sends.
    #[must_use]
    pub fn termination_signal(&self) -> Signal {
        if self.terminate_gracefully {
            Signal::SIGINT
        } else {
            Signal::SIGKILL
        }
    }

    /// Asks the process to terminate.
    pub fn terminate<S: System + ?Sized>(&self, system: &mut S) -> nix::Result<()> {
        system.signal(self, self.termination_signal())
    }
}

/// Operations the orchestrator needs to run stages
pub trait System: Debug {
    /// Starts a process for the stage.
    ///
    /// On success, the process handle is recorded in the context with
    /// [`ExecContext::set_process`]. If the standard output (or standard
    /// error) of the stage is piped and `next_stdin` is given, the read end of
    /// the pipe is stored in `next_stdin` before the process is started, even
    /// if starting fails afterwards.
    fn launch(
        &mut self,
        context: &mut ExecContext,
        next_stdin: Option<&mut StdioTarget>,
        working_dir: Option<&Path>,
    ) -> Result<(), LaunchError>;

    /// Returns the exit status of the process if it has terminated.
    ///
    /// This function does not block.
    fn try_wait(&mut self, process: &ChildProcess) -> nix::Result<Option<ExitStatus>>;

    /// Sends a signal to the process group of the process.
    fn signal(&mut self, process: &ChildProcess, signal: Signal) -> nix::Result<()>;
}

/// Implementation of [`System`] that runs real processes
#[derive(Debug, Default)]
pub struct RealSystem {
    config: Config,
}

impl RealSystem {
    #[must_use]
    pub fn new(config: Config) -> Self {
        RealSystem { config }
    }
}

impl System for RealSystem {
    fn launch(
        &mut self,
        context: &mut ExecContext,
        next_stdin: Option<&mut StdioTarget>,
        working_dir: Option<&Path>,
    ) -> Result<(), LaunchError> {
        ProcessLauncher::new(&self.config).launch(context, next_stdin, working_dir)
    }

    fn try_wait(&mut self, process: &ChildProcess) -> nix::Result<Option<ExitStatus>> {
        loop {
            match waitpid(process.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    if let Some(exit_status) = ExitStatus::from_wait_status(status) {
                        return Ok(Some(exit_status));
                    }
                    // Stopped or continued: keep waiting for termination
                    return Ok(None);
                }
                Err(Errno::EINTR) => (),
                Err(errno) => return Err(errno),
            }
        }
    }

    fn signal(&mut self, process: &ChildProcess, signal: Signal) -> nix::Result<()> {
        let group = Pid::from_raw(-process.pid.as_raw());
        match kill(group, signal) {
            Err(Errno::ESRCH) => kill(process.pid, signal),
            result => result,
        }
    }
}
