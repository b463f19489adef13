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

//! Execution context of a single stage

use crate::cmdline::CommandLine;
use crate::pump::BufferHandle;
use crate::stdio::StdioTarget;
use crate::system::ChildProcess;
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

/// Condition under which the stage following a stage runs
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChainCondition {
    /// Run the next stage after this one, whatever its result.
    Always,
    /// Run the next stage if this one succeeds.
    OnSuccess,
    /// Run the next stage if this one fails.
    OnFailure,
    /// Run the next stage without waiting for this one.
    ///
    /// Stages of a pipeline are linked this way.
    Concurrent,
    /// Do not run the next stage.
    Never,
}

/// Description and runtime state of one stage of an [`ExecPlan`](crate::ExecPlan)
///
/// The public fields describe what to run and how. They are consumed when
/// the stage is launched: a pipe passed in
/// [`stdin_target`](Self::stdin_target) is taken over by the process, for
/// example. The process handle and the captured environment are filled in by
/// the engine.
#[derive(Debug)]
pub struct ExecContext {
    pub command: CommandLine,
    pub stdin_target: StdioTarget,
    pub stdout_target: StdioTarget,
    pub stderr_target: StdioTarget,
    /// How the following stage of the plan is chained to this one
    ///
    /// `None` if this is the last stage.
    pub next: Option<ChainCondition>,
    /// Whether the plan waits for this stage to exit
    ///
    /// A stage that is not waited for is reported as a background process in
    /// the plan outcome.
    pub wait_for_completion: bool,
    /// Whether the stage runs in a new session, detached from the terminal
    pub run_detached: bool,
    /// Whether the stage reports its environment when it exits
    pub capture_environment_on_exit: bool,
    /// Whether the command line already contains the escapes it needs when
    /// rendered
    pub literal_escapes: bool,
    process: Option<ChildProcess>,
    env_channel: Option<BufferHandle>,
    captured_environment: Option<Vec<(OsString, OsString)>>,
}

impl ExecContext {
    /// Creates a context that runs the command with inherited streams.
    #[must_use]
    pub fn new(command: CommandLine) -> Self {
        ExecContext {
            command,
            stdin_target: StdioTarget::Default,
            stdout_target: StdioTarget::Default,
            stderr_target: StdioTarget::Default,
            next: None,
            wait_for_completion: true,
            run_detached: false,
            capture_environment_on_exit: false,
            literal_escapes: false,
            process: None,
            env_channel: None,
            captured_environment: None,
        }
    }

    /// Creates a context from unquoted words.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandLine::from_words(words))
    }

    #[must_use]
    pub fn stdin(mut self, target: StdioTarget) -> Self {
        self.stdin_target = target;
        self
    }

    #[must_use]
    pub fn stdout(mut self, target: StdioTarget) -> Self {
        self.stdout_target = target;
        self
    }

    #[must_use]
    pub fn stderr(mut self, target: StdioTarget) -> Self {
        self.stderr_target = target;
        self
    }

    /// Returns the process running this stage, if launched.
    #[must_use]
    pub fn process(&self) -> Option<&ChildProcess> {
        self.process.as_ref()
    }

    /// Records the process started for this stage.
    ///
    /// # Panics
    ///
    /// If a process has already been recorded. A stage is launched at most
    /// once.
    pub fn set_process(&mut self, process: ChildProcess) {
        assert!(
            self.process.is_none(),
            "stage `{}` launched twice",
            self.command
        );
        self.process = Some(process);
    }

    /// Returns the environment the stage reported on exit.
    ///
    /// This is `None` until the stage has been waited for, and stays `None`
    /// if the stage was not asked to report its environment.
    #[must_use]
    pub fn captured_environment(&self) -> Option<&[(OsString, OsString)]> {
        self.captured_environment.as_deref()
    }

    /// Sets the buffer collecting the stage's environment report.
    pub(crate) fn set_env_channel(&mut self, channel: BufferHandle) {
        self.env_channel = Some(channel);
    }

    /// Parses the environment report after the stage has exited.
    ///
    /// Does nothing if the stage has no environment channel.
    pub(crate) fn finish_environment_capture(&mut self) {
        if let Some(channel) = self.env_channel.take() {
            // The channel may have been inherited by processes that outlive
            // the stage, so collect what is there instead of waiting for EOF.
            channel.stop();
            channel.wait_for_eof();
            self.captured_environment = Some(parse_environment(&channel.contents()));
        }
    }

    /// Releases resources prepared for this stage by a previous stage that
    /// did not launch it.
    ///
    /// Returns true if the standard input was connected to a pipe from the
    /// previous stage. The pipe is closed.
    pub fn cleanup_failed_launch(&mut self) -> bool {
        match &mut self.stdin_target {
            StdioTarget::Pipe(upstream) => upstream.take().is_some(),
            _ => false,
        }
    }
}

/// Parses nul-terminated `NAME=value` records.
///
/// Records without `=` or with an empty name are ignored.
pub(crate) fn parse_environment(bytes: &[u8]) -> Vec<(OsString, OsString)> {
    bytes
        .split(|&b| b == 0)
        .filter_map(|record| {
            let equal = record.iter().position(|&b| b == b'=')?;
            if equal == 0 {
                return None;
            }
            let name = OsString::from_vec(record[..equal].to_vec());
            let value = OsString::from_vec(record[equal + 1..].to_vec());
            Some((name, value))
        })
        .collect()
}
