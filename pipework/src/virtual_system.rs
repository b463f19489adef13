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

//! System simulated in Rust
//!
//! [`VirtualSystem`] is an implementation of [`System`] that simulates
//! processes without creating any. It is used for testing how plans are
//! orchestrated: which stages are launched, in what order, what their exit
//! statuses are and which signals they receive.
//!
//! Programs are registered by name with a [`VirtualProgram`] describing how
//! they behave. Launching a name that is not registered fails with `ENOENT`.
//! Like the real launcher, the system applies redirections before looking
//! up the program, so a standard input file that does not exist is reported
//! as a redirection error even for an unknown program.
//!
//! Pipes between stages are real pipes: when a stage with a piped standard
//! output is launched, the read end is handed to the next stage as the real
//! launcher does, and the write end is kept in the system so that tests can
//! observe whether anybody reads from the pipe.

use crate::cmdline::CmdLineError;
use crate::context::ExecContext;
use crate::image::Subsystem;
use crate::launch::LaunchError;
use crate::redir::{RedirError, RedirErrorCause};
use crate::status::ExitStatus;
use crate::stdio::{StdioTarget, Stream};
use crate::sys;
use crate::system::{ChildProcess, System};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::Path;

/// Behavior of a simulated program
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VirtualProgram {
    /// Exit status the program exits with as soon as it is launched, or
    /// `None` if it runs until signaled
    pub exit_status: Option<ExitStatus>,
    /// Kind of image the program appears to be
    pub subsystem: Subsystem,
    /// Error number with which launching the program fails
    pub launch_error: Option<Errno>,
}

impl VirtualProgram {
    /// Program that exits immediately with the status
    #[must_use]
    pub fn exiting(exit_status: ExitStatus) -> Self {
        VirtualProgram {
            exit_status: Some(exit_status),
            ..VirtualProgram::default()
        }
    }

    /// Program that runs until it is signaled
    #[must_use]
    pub fn running() -> Self {
        VirtualProgram::default()
    }

    /// Program that cannot be launched
    #[must_use]
    pub fn failing(errno: Errno) -> Self {
        VirtualProgram {
            launch_error: Some(errno),
            ..VirtualProgram::default()
        }
    }
}

/// State of a simulated process
#[derive(Clone, Debug, Eq, PartialEq)]
struct VirtualProcess {
    exit_status: Option<ExitStatus>,
}

/// Simulated [`System`]
#[derive(Debug)]
pub struct VirtualSystem {
    programs: HashMap<String, VirtualProgram>,
    processes: HashMap<Pid, VirtualProcess>,
    launches: Vec<String>,
    signals: Vec<(Pid, Signal)>,
    pipe_writers: Vec<OwnedFd>,
    next_pid: i32,
}

impl Default for VirtualSystem {
    fn default() -> Self {
        VirtualSystem {
            programs: HashMap::new(),
            processes: HashMap::new(),
            launches: Vec::new(),
            signals: Vec::new(),
            pipe_writers: Vec::new(),
            next_pid: 100,
        }
    }
}

impl VirtualSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a program.
    pub fn add_program<S: Into<String>>(&mut self, name: S, program: VirtualProgram) {
        self.programs.insert(name.into(), program);
    }

    /// Names of the programs launched so far, in launch order
    #[must_use]
    pub fn launches(&self) -> &[String] {
        &self.launches
    }

    /// Signals sent so far, in order
    #[must_use]
    pub fn signals(&self) -> &[(Pid, Signal)] {
        &self.signals
    }

    /// Takes the write ends of the pipes created for piped stages.
    pub fn take_pipe_writers(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.pipe_writers)
    }

    /// Makes a running process exit.
    pub fn exit(&mut self, pid: Pid, exit_status: ExitStatus) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.exit_status.get_or_insert(exit_status);
        }
    }

    /// Whether the process has been launched and not yet waited for
    #[must_use]
    pub fn is_alive(&self, pid: Pid) -> bool {
        self.processes
            .get(&pid)
            .is_some_and(|process| process.exit_status.is_none())
    }
}

impl System for VirtualSystem {
    fn launch(
        &mut self,
        context: &mut ExecContext,
        next_stdin: Option<&mut StdioTarget>,
        _working_dir: Option<&Path>,
    ) -> Result<(), LaunchError> {
        // Redirection comes first, as in the real launcher. Of the input
        // targets, only missing files are simulated as failing.
        match &mut context.stdin_target {
            StdioTarget::Pipe(reader) => drop(reader.take()),
            StdioTarget::File(path) | StdioTarget::Append(path) if !path.exists() => {
                return Err(RedirError {
                    stream: Stream::Stdin,
                    cause: RedirErrorCause::OpenFile(path.clone(), Errno::ENOENT),
                }
                .into());
            }
            _ => (),
        }
        let pipes_output = context.stdout_target.is_pipe() || context.stderr_target.is_pipe();
        if let (true, Some(StdioTarget::Pipe(slot))) = (pipes_output, next_stdin) {
            let (reader, writer) = sys::pipe().map_err(|errno| RedirError {
                stream: Stream::Stdout,
                cause: RedirErrorCause::Pipe(errno),
            })?;
            *slot = Some(reader);
            self.pipe_writers.push(writer);
        }

        let name = context.command.program().ok_or(CmdLineError::Empty)?.to_owned();
        let program = self.programs.get(&name).cloned();
        let errno = match &program {
            None => Some(Errno::ENOENT),
            Some(program) => program.launch_error,
        };
        if let Some(errno) = errno {
            return Err(LaunchError::ProcessCreation {
                program: name,
                errno,
            });
        }
        let program = program.unwrap_or_default();

        let pid = Pid::from_raw(self.next_pid);
        self.next_pid += 1;
        let terminate_gracefully =
            !context.run_detached && program.subsystem.allows_graceful_termination();
        context.set_process(ChildProcess::new(pid, terminate_gracefully));
        self.processes.insert(
            pid,
            VirtualProcess {
                exit_status: program.exit_status,
            },
        );
        self.launches.push(name);
        Ok(())
    }

    fn try_wait(&mut self, process: &ChildProcess) -> nix::Result<Option<ExitStatus>> {
        let pid = process.pid();
        let exit_status = self.processes.get(&pid).ok_or(Errno::ECHILD)?.exit_status;
        if exit_status.is_some() {
            self.processes.remove(&pid);
        }
        Ok(exit_status)
    }

    fn signal(&mut self, process: &ChildProcess, signal: Signal) -> nix::Result<()> {
        let pid = process.pid();
        let state = self.processes.get_mut(&pid).ok_or(Errno::ESRCH)?;
        self.signals.push((pid, signal));
        state.exit_status.get_or_insert(ExitStatus::from(signal));
        Ok(())
    }
}
