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

//! Plans of chained stages and their orchestration
//!
//! An [`ExecPlan`] is an ordered list of stages. Each stage except the last
//! has a [`ChainCondition`] in its [`next`](ExecContext::next) field that
//! decides whether and when the following stage runs:
//!
//! | Condition    | Shell syntax | The next stage runs                       |
//! |--------------|--------------|-------------------------------------------|
//! | `Always`     | `a; b`       | after this stage, whatever its result     |
//! | `OnSuccess`  | `a && b`     | after this stage if it succeeded          |
//! | `OnFailure`  | `a \|\| b`   | after this stage if it failed             |
//! | `Concurrent` | `a \| b`     | right away, alongside this stage          |
//! | `Never`      |              | never; the plan ends here                 |
//!
//! A stage is waited for before the next one is considered, unless it is
//! linked to the next stage by `Concurrent` (it is then waited for after all
//! stages have been launched) or it does not
//! [wait for completion](ExecContext::wait_for_completion) (it is then handed
//! to the caller as a background process).
//!
//! A stage that is skipped by its condition passes the exit status of the
//! previous stage on, so in `a && b || c`, `c` runs if `a` fails. The stages
//! of a pipeline after a skipped stage are skipped too. If a stage fails to
//! launch, the exit status of the failure counts as its result, its input
//! pipe is closed so that the writer upstream sees a broken pipe, and a stage
//! reading from its output pipe is not launched, whether or not the pipe had
//! been created when the launch failed.
//!
//! The [status](PlanOutcome::status) of the plan is that of the last stage
//! that ran or failed to launch.

use crate::cancel::CancelToken;
use crate::cmdline::{CmdLineError, CommandLine};
use crate::config::{CancelAction, Config};
use crate::context::{ChainCondition, ExecContext};
use crate::launch::LaunchError;
use crate::redir::{RedirError, RedirErrorCause};
use crate::status::ExitStatus;
use crate::stdio::{StdioTarget, Stream};
use crate::system::{ChildProcess, System};
use nix::sys::signal::Signal;
use std::fmt::Write;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Ordered list of stages to run
#[derive(Debug, Default)]
pub struct ExecPlan {
    stages: Vec<ExecContext>,
    command_line: Option<String>,
}

/// Result of running an [`ExecPlan`]
#[derive(Debug)]
#[must_use]
pub struct PlanOutcome {
    /// Exit status of the last stage that ran
    pub status: ExitStatus,
    /// Whether the plan was cancelled before all stages finished
    pub cancelled: bool,
    /// Processes still running that the caller is responsible for
    pub background: Vec<ChildProcess>,
    /// Errors that prevented stages from launching
    pub errors: Vec<LaunchError>,
    /// The stages, with their process handles and captured environments
    pub stages: Vec<ExecContext>,
}

/// Marker for a wait interrupted by cancellation
struct Cancelled;

impl ExecPlan {
    /// Creates a plan with a single stage.
    #[must_use]
    pub fn new(first: ExecContext) -> Self {
        ExecPlan {
            stages: vec![first],
            command_line: None,
        }
    }

    /// Appends a stage that runs after the current last stage under the
    /// condition.
    pub fn push(&mut self, condition: ChainCondition, stage: ExecContext) {
        if let Some(last) = self.stages.last_mut() {
            last.next = Some(condition);
        }
        self.stages.push(stage);
    }

    #[must_use]
    pub fn stages(&self) -> &[ExecContext] {
        &self.stages
    }

    pub fn stages_mut(&mut self) -> &mut [ExecContext] {
        &mut self.stages
    }

    /// Sets the command line this plan was parsed from.
    pub fn set_command_line<S: Into<String>>(&mut self, command_line: S) {
        self.command_line = Some(command_line.into());
    }

    /// Returns the whole plan as a single command line.
    ///
    /// If a command line has been [set](Self::set_command_line), it is
    /// returned. Otherwise, one is rendered from the stages, including their
    /// file redirections and the operators between them.
    #[must_use]
    pub fn entire_command_line(&self) -> String {
        if let Some(command_line) = &self.command_line {
            return command_line.clone();
        }
        let mut result = String::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if index > 0 {
                let previous = &self.stages[index - 1];
                let operator = match previous.next.unwrap_or(ChainCondition::Never) {
                    ChainCondition::Never => break,
                    ChainCondition::Always if previous.wait_for_completion => " ; ",
                    ChainCondition::Always => " & ",
                    ChainCondition::OnSuccess => " && ",
                    ChainCondition::OnFailure => " || ",
                    ChainCondition::Concurrent
                        if previous.stdout_target.is_pipe() || previous.stderr_target.is_pipe() =>
                    {
                        " | "
                    }
                    ChainCondition::Concurrent => " & ",
                };
                result.push_str(operator);
            }
            result.push_str(&stage.command.render(stage.literal_escapes));
            render_redirections(&mut result, stage);
        }
        if self.stages.last().is_some_and(|last| !last.wait_for_completion) {
            result.push_str(" &");
        }
        result
    }

    /// Converts the plan into one that runs the entire command line in a
    /// secondary shell.
    ///
    /// The new plan has a single stage running
    /// [`entire_command_line`](Self::entire_command_line) with the
    /// interpreter found by [`CommandLine::wrap_for_secondary_shell`]. File
    /// redirections are part of the command line. Pipes and buffers
    /// attached to the first stage's input and the last stage's outputs are
    /// moved to the new stage.
    pub fn into_secondary_shell(mut self, config: &Config) -> Result<ExecPlan, CmdLineError> {
        let command_line = self.entire_command_line();
        let mut stage = ExecContext::new(CommandLine::wrap_for_secondary_shell(
            command_line.clone(),
            config,
        )?);
        if let Some(first) = self.stages.first_mut() {
            if first.stdin_target.is_pipe() {
                stage.stdin_target = std::mem::take(&mut first.stdin_target);
            }
        }
        if let Some(last) = self.stages.last_mut() {
            if matches!(last.stdout_target, StdioTarget::Pipe(_) | StdioTarget::Buffer(_)) {
                stage.stdout_target = std::mem::take(&mut last.stdout_target);
            }
            if matches!(last.stderr_target, StdioTarget::Pipe(_) | StdioTarget::Buffer(_)) {
                stage.stderr_target = std::mem::take(&mut last.stderr_target);
            }
            stage.run_detached = last.run_detached;
            stage.capture_environment_on_exit = last.capture_environment_on_exit;
        }
        stage.literal_escapes = true;
        debug!(%command_line, "delegating plan to a secondary shell");
        Ok(ExecPlan {
            stages: vec![stage],
            command_line: Some(command_line),
        })
    }

    /// Checks the stages for errors that can be detected before launching.
    pub fn validate(&self) -> Result<(), RedirError> {
        for stage in &self.stages {
            if stage.stdout_target.is_merge() && stage.stderr_target.is_merge() {
                return Err(RedirError {
                    stream: Stream::Stderr,
                    cause: RedirErrorCause::MutualMerge,
                });
            }
        }
        Ok(())
    }

    /// Runs the plan.
    ///
    /// Stages are launched with `system` and waited for as described in the
    /// [module documentation](self). If `cancel` is set while a stage is
    /// being waited for, the plan stops and the stages still running are
    /// handled according to [`Config::cancel_action`].
    pub fn run<S: System + ?Sized>(
        self,
        system: &mut S,
        config: &Config,
        cancel: &CancelToken,
    ) -> PlanOutcome {
        let validation = self.validate();
        let mut outcome = PlanOutcome {
            status: ExitStatus::SUCCESS,
            cancelled: false,
            background: Vec::new(),
            errors: Vec::new(),
            stages: self.stages,
        };
        if let Err(error) = validation {
            warn!(%error, "plan rejected");
            outcome.status = ExitStatus::ERROR;
            outcome.errors.push(error.into());
            return outcome;
        }

        let stages = &mut outcome.stages;
        let mut statuses: Vec<Option<ExitStatus>> = vec![None; stages.len()];
        let mut deferred: Vec<(usize, ChildProcess)> = Vec::new();
        let mut last_run = None;
        let mut previous_status = ExitStatus::SUCCESS;
        let mut previous_ran = true;
        let mut stdin_orphaned = false;

        for index in 0..stages.len() {
            if index > 0 {
                let condition = stages[index - 1].next.unwrap_or(ChainCondition::Never);
                let runs = match condition {
                    ChainCondition::Never => {
                        trace!(index, "plan ends");
                        break;
                    }
                    ChainCondition::Always => true,
                    ChainCondition::Concurrent => previous_ran,
                    ChainCondition::OnSuccess => previous_status.is_successful(),
                    ChainCondition::OnFailure => !previous_status.is_successful(),
                };
                if !runs || stdin_orphaned {
                    trace!(index, ?condition, "skipping stage");
                    stages[index].cleanup_failed_launch();
                    previous_ran = false;
                    stdin_orphaned = false;
                    continue;
                }
            }
            previous_ran = true;
            last_run = Some(index);

            let link = stages[index].next.filter(|_| index + 1 < stages.len());
            let (head, tail) = stages.split_at_mut(index + 1);
            let stage = &mut head[index];
            let next_stdin = match link {
                Some(ChainCondition::Never) | None => None,
                Some(_) => tail.first_mut().map(|next| &mut next.stdin_target),
            };
            if let Err(error) = system.launch(stage, next_stdin, config.working_dir.as_deref()) {
                let status = error.exit_status();
                warn!(%error, index, "cannot launch stage");
                statuses[index] = Some(status);
                previous_status = status;
                stage.cleanup_failed_launch();
                let pipes_output = link == Some(ChainCondition::Concurrent)
                    && (stage.stdout_target.is_pipe() || stage.stderr_target.is_pipe());
                if let Some(next) = tail.first_mut() {
                    let reads_pipe = next.stdin_target.is_pipe();
                    stdin_orphaned = next.cleanup_failed_launch() || (pipes_output && reads_pipe);
                }
                outcome.errors.push(error);
                continue;
            }
            let Some(&process) = stage.process() else {
                warn!(index, "launched stage has no process");
                statuses[index] = Some(ExitStatus::ERROR);
                previous_status = ExitStatus::ERROR;
                continue;
            };

            if !stage.wait_for_completion {
                debug!(index, pid = %process.pid(), "stage runs in the background");
                outcome.background.push(process);
                statuses[index] = Some(ExitStatus::SUCCESS);
                previous_status = ExitStatus::SUCCESS;
            } else if link == Some(ChainCondition::Concurrent) {
                deferred.push((index, process));
            } else {
                match wait_any(system, &[process], config, cancel) {
                    Ok((_, status)) => {
                        stage.finish_environment_capture();
                        statuses[index] = Some(status);
                        previous_status = status;
                    }
                    Err(Cancelled) => {
                        deferred.push((index, process));
                        abandon(system, deferred, config, &mut outcome);
                        return outcome;
                    }
                }
            }
        }

        while !deferred.is_empty() {
            let processes: Vec<ChildProcess> = deferred.iter().map(|&(_, p)| p).collect();
            match wait_any(system, &processes, config, cancel) {
                Ok((position, status)) => {
                    let (index, _) = deferred.swap_remove(position);
                    stages[index].finish_environment_capture();
                    statuses[index] = Some(status);
                }
                Err(Cancelled) => {
                    abandon(system, deferred, config, &mut outcome);
                    return outcome;
                }
            }
        }

        outcome.status = last_run
            .and_then(|index| statuses[index])
            .unwrap_or(ExitStatus::SUCCESS);
        debug!(status = %outcome.status, "plan finished");
        outcome
    }
}

fn render_redirections(result: &mut String, stage: &ExecContext) {
    let targets = [
        (Stream::Stdin, &stage.stdin_target),
        (Stream::Stdout, &stage.stdout_target),
        (Stream::Stderr, &stage.stderr_target),
    ];
    for (stream, target) in targets {
        let (operator, path) = match (stream, target) {
            (Stream::Stdin, StdioTarget::File(path) | StdioTarget::Append(path)) => {
                ("<", path.to_string_lossy())
            }
            (Stream::Stdin, StdioTarget::Null) => ("<", "/dev/null".into()),
            (Stream::Stdout, StdioTarget::File(path)) => (">", path.to_string_lossy()),
            (Stream::Stdout, StdioTarget::Append(path)) => (">>", path.to_string_lossy()),
            (Stream::Stdout, StdioTarget::Null) => (">", "/dev/null".into()),
            (Stream::Stdout, StdioTarget::MergeToSibling) => (">&2", "".into()),
            (Stream::Stderr, StdioTarget::File(path)) => ("2>", path.to_string_lossy()),
            (Stream::Stderr, StdioTarget::Append(path)) => ("2>>", path.to_string_lossy()),
            (Stream::Stderr, StdioTarget::Null) => ("2>", "/dev/null".into()),
            (Stream::Stderr, StdioTarget::MergeToSibling) => ("2>&1", "".into()),
            _ => continue,
        };
        result.push(' ');
        result.push_str(operator);
        if !path.is_empty() {
            let word = crate::cmdline::Argument::new(path);
            let _ = write!(result, " {}", word.display(false));
        }
    }
}

/// Waits until one of the processes terminates.
///
/// Returns the position of the terminated process in `processes` and its
/// exit status.
fn wait_any<S: System + ?Sized>(
    system: &mut S,
    processes: &[ChildProcess],
    config: &Config,
    cancel: &CancelToken,
) -> Result<(usize, ExitStatus), Cancelled> {
    loop {
        for (position, process) in processes.iter().enumerate() {
            match system.try_wait(process) {
                Ok(Some(status)) => {
                    trace!(pid = %process.pid(), %status, "stage exited");
                    return Ok((position, status));
                }
                Ok(None) => (),
                Err(errno) => {
                    warn!(pid = %process.pid(), %errno, "cannot wait for stage");
                    return Ok((position, ExitStatus::ERROR));
                }
            }
        }
        if cancel.wait_timeout(config.poll_interval) {
            return Err(Cancelled);
        }
    }
}

/// Handles the stages still running when the plan is cancelled.
fn abandon<S: System + ?Sized>(
    system: &mut S,
    running: Vec<(usize, ChildProcess)>,
    config: &Config,
    outcome: &mut PlanOutcome,
) {
    debug!(running = running.len(), action = ?config.cancel_action, "plan cancelled");
    outcome.cancelled = true;
    outcome.status = ExitStatus::from(Signal::SIGINT);
    for (_, process) in running {
        match config.cancel_action {
            CancelAction::LeaveRunning => outcome.background.push(process),
            CancelAction::Terminate => terminate_and_reap(system, &process, config),
        }
    }
}

/// Terminates the process and waits for it, killing it if it does not exit
/// within the grace period.
fn terminate_and_reap<S: System + ?Sized>(system: &mut S, process: &ChildProcess, config: &Config) {
    if let Err(errno) = process.terminate(system) {
        warn!(pid = %process.pid(), %errno, "cannot terminate stage");
    }
    let deadline = Instant::now() + config.kill_grace;
    let mut killed = !process.terminate_gracefully();
    loop {
        match system.try_wait(process) {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => (),
        }
        if !killed && Instant::now() >= deadline {
            debug!(pid = %process.pid(), "stage ignored the interrupt; killing it");
            let _ = system.signal(process, Signal::SIGKILL);
            killed = true;
        }
        std::thread::sleep(config.poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::BufferHandle;
    use crate::system::RealSystem;
    use crate::virtual_system::{VirtualProgram, VirtualSystem};
    use assert_matches::assert_matches;
    use nix::errno::Errno;
    use std::ffi::OsString;
    use std::io::Write as _;
    use std::path::PathBuf;
    use std::time::Duration;

    fn system_with_programs() -> VirtualSystem {
        let mut system = VirtualSystem::new();
        system.add_program("true", VirtualProgram::exiting(ExitStatus::SUCCESS));
        system.add_program("false", VirtualProgram::exiting(ExitStatus::FAILURE));
        system.add_program("three", VirtualProgram::exiting(ExitStatus(3)));
        system.add_program("server", VirtualProgram::running());
        system.add_program("broken", VirtualProgram::failing(Errno::EACCES));
        system
    }

    fn plan(first: &str, rest: &[(ChainCondition, &str)]) -> ExecPlan {
        let mut plan = ExecPlan::new(ExecContext::from_words([first]));
        for &(condition, name) in rest {
            plan.push(condition, ExecContext::from_words([name]));
        }
        plan
    }

    fn run(plan: ExecPlan, system: &mut VirtualSystem) -> PlanOutcome {
        plan.run(system, &Config::default(), &CancelToken::new())
    }

    #[test]
    fn sequential_stages_run_in_order() {
        let mut system = system_with_programs();
        let plan = plan("false", &[(ChainCondition::Always, "three")]);
        let outcome = run(plan, &mut system);
        assert_eq!(system.launches(), ["false", "three"]);
        assert_eq!(outcome.status, ExitStatus(3));
        assert!(!outcome.cancelled);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn on_success_skips_after_failure() {
        let mut system = system_with_programs();
        let plan = plan("false", &[(ChainCondition::OnSuccess, "three")]);
        let outcome = run(plan, &mut system);
        assert_eq!(system.launches(), ["false"]);
        assert_eq!(outcome.status, ExitStatus::FAILURE);
    }

    #[test]
    fn on_failure_runs_after_failure_only() {
        let mut system = system_with_programs();
        let plan1 = plan("false", &[(ChainCondition::OnFailure, "three")]);
        let outcome = run(plan1, &mut system);
        assert_eq!(system.launches(), ["false", "three"]);
        assert_eq!(outcome.status, ExitStatus(3));

        let mut system = system_with_programs();
        let plan2 = plan("true", &[(ChainCondition::OnFailure, "three")]);
        let outcome = run(plan2, &mut system);
        assert_eq!(system.launches(), ["true"]);
        assert_eq!(outcome.status, ExitStatus::SUCCESS);
    }

    #[test]
    fn skipped_stage_passes_status_on() {
        let mut system = system_with_programs();
        let plan = plan(
            "false",
            &[
                (ChainCondition::OnSuccess, "true"),
                (ChainCondition::OnFailure, "three"),
            ],
        );
        let outcome = run(plan, &mut system);
        assert_eq!(system.launches(), ["false", "three"]);
        assert_eq!(outcome.status, ExitStatus(3));
    }

    #[test]
    fn never_ends_plan() {
        let mut system = system_with_programs();
        let plan = plan(
            "three",
            &[(ChainCondition::Never, "true"), (ChainCondition::Always, "false")],
        );
        let outcome = run(plan, &mut system);
        assert_eq!(system.launches(), ["three"]);
        assert_eq!(outcome.status, ExitStatus(3));
    }

    #[test]
    fn pipeline_status_is_that_of_last_stage() {
        let mut system = system_with_programs();
        let first = ExecContext::from_words(["three"]).stdout(StdioTarget::Pipe(None));
        let mut plan = ExecPlan::new(first);
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["true"]).stdin(StdioTarget::Pipe(None)),
        );
        let outcome = run(plan, &mut system);
        assert_eq!(system.launches(), ["three", "true"]);
        assert_eq!(outcome.status, ExitStatus::SUCCESS);
    }

    #[test]
    fn concurrent_stages_are_launched_before_waiting() {
        let mut system = system_with_programs();
        let first = ExecContext::from_words(["server"]).stdout(StdioTarget::Pipe(None));
        let mut plan = ExecPlan::new(first);
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["true"]).stdin(StdioTarget::Pipe(None)),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = plan.run(&mut system, &Config::default(), &cancel);

        // Both stages were launched although the first never exits.
        assert_eq!(system.launches(), ["server", "true"]);
        assert!(outcome.cancelled);
        assert_eq!(outcome.status, ExitStatus::from(Signal::SIGINT));
        let server = *outcome.stages[0].process().unwrap();
        assert_eq!(system.signals(), [(server.pid(), Signal::SIGINT)]);
        assert!(!system.is_alive(server.pid()));
    }

    #[test]
    fn failed_launch_closes_pipe_and_skips_reader() {
        let mut system = system_with_programs();
        let first = ExecContext::from_words(["broken"]).stdout(StdioTarget::Pipe(None));
        let mut plan = ExecPlan::new(first);
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["true"]).stdin(StdioTarget::Pipe(None)),
        );
        let outcome = run(plan, &mut system);

        assert!(system.launches().is_empty());
        assert_eq!(outcome.status, ExitStatus::NOEXEC);
        assert_matches!(&outcome.errors[..], [LaunchError::ProcessCreation { program, errno }] => {
            assert_eq!(program, "broken");
            assert_eq!(*errno, Errno::EACCES);
        });
        assert_eq!(outcome.stages[1].process(), None);

        // Nobody holds the read end any more.
        let writers = system.take_pipe_writers();
        assert_eq!(writers.len(), 1);
        let mut writer = std::fs::File::from(writers.into_iter().next().unwrap());
        let error = writer.write(b"x").unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn reader_is_skipped_when_pipe_was_never_created() {
        let mut system = system_with_programs();
        let first = ExecContext::from_words(["true"])
            .stdin(StdioTarget::File("/no/such/input".into()))
            .stdout(StdioTarget::Pipe(None));
        let mut plan = ExecPlan::new(first);
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["true"]).stdin(StdioTarget::Pipe(None)),
        );
        let outcome = run(plan, &mut system);

        assert!(system.launches().is_empty());
        assert!(system.take_pipe_writers().is_empty());
        assert_eq!(outcome.status, ExitStatus::ERROR);
        assert_matches!(&outcome.errors[..], [error] if error.failed_during_redirection());
        assert_eq!(outcome.stages[1].process(), None);
    }

    #[test]
    fn failed_middle_stage_breaks_both_pipes() {
        let mut system = system_with_programs();
        let first = ExecContext::from_words(["true"]).stdout(StdioTarget::Pipe(None));
        let mut plan = ExecPlan::new(first);
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["missing"])
                .stdin(StdioTarget::Pipe(None))
                .stdout(StdioTarget::Pipe(None)),
        );
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["true"]).stdin(StdioTarget::Pipe(None)),
        );
        let outcome = run(plan, &mut system);

        assert_eq!(system.launches(), ["true"]);
        assert_eq!(outcome.status, ExitStatus::NOT_FOUND);
        assert_eq!(outcome.stages[2].process(), None);
        let writers = system.take_pipe_writers();
        assert_eq!(writers.len(), 2);
        for writer in writers {
            let mut writer = std::fs::File::from(writer);
            let error = writer.write(b"x").unwrap_err();
            assert_eq!(error.kind(), std::io::ErrorKind::BrokenPipe);
        }
    }

    #[test]
    fn failed_launch_status_drives_conditions() {
        let mut system = system_with_programs();
        let plan = plan("missing", &[(ChainCondition::OnFailure, "three")]);
        let outcome = run(plan, &mut system);
        assert_eq!(system.launches(), ["three"]);
        assert_eq!(outcome.status, ExitStatus(3));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].exit_status(), ExitStatus::NOT_FOUND);
    }

    #[test]
    fn background_stage_is_handed_to_caller() {
        let mut system = system_with_programs();
        let mut first = ExecContext::from_words(["server"]);
        first.wait_for_completion = false;
        let mut plan = ExecPlan::new(first);
        plan.push(ChainCondition::Always, ExecContext::from_words(["false"]));
        let outcome = run(plan, &mut system);

        assert_eq!(system.launches(), ["server", "false"]);
        assert_eq!(outcome.status, ExitStatus::FAILURE);
        let server = *outcome.stages[0].process().unwrap();
        assert_eq!(outcome.background, [server]);
        assert!(system.is_alive(server.pid()));
        assert!(system.signals().is_empty());
    }

    #[test]
    fn cancelled_plan_leaves_stages_running_if_configured() {
        let mut system = system_with_programs();
        let config = Config {
            cancel_action: CancelAction::LeaveRunning,
            ..Config::default()
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let plan = plan("server", &[(ChainCondition::Always, "true")]);
        let outcome = plan.run(&mut system, &config, &cancel);

        assert_eq!(system.launches(), ["server"]);
        assert!(outcome.cancelled);
        assert_eq!(outcome.background.len(), 1);
        assert!(system.signals().is_empty());
    }

    #[test]
    fn detached_stage_is_killed_on_cancellation() {
        let mut system = system_with_programs();
        let mut context = ExecContext::from_words(["server"]);
        context.run_detached = true;
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = ExecPlan::new(context).run(&mut system, &Config::default(), &cancel);

        let server = *outcome.stages[0].process().unwrap();
        assert!(!server.terminate_gracefully());
        assert_eq!(system.signals(), [(server.pid(), Signal::SIGKILL)]);
    }

    #[test]
    fn mutual_merge_is_rejected_before_launch() {
        let mut system = system_with_programs();
        let mut plan = plan("true", &[]);
        plan.push(
            ChainCondition::Always,
            ExecContext::from_words(["false"])
                .stdout(StdioTarget::MergeToSibling)
                .stderr(StdioTarget::MergeToSibling),
        );
        let outcome = run(plan, &mut system);
        assert!(system.launches().is_empty());
        assert_eq!(outcome.status, ExitStatus::ERROR);
        assert_matches!(&outcome.errors[..], [LaunchError::Redirection(error)] => {
            assert_eq!(error.cause, RedirErrorCause::MutualMerge);
        });
    }

    #[test]
    fn entire_command_line_renders_operators_and_redirections() {
        let mut plan = ExecPlan::new(
            ExecContext::from_words(["echo", "hi"]).stdout(StdioTarget::Pipe(None)),
        );
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["tr", "a-z", "A-Z"])
                .stdin(StdioTarget::Pipe(None))
                .stdout(StdioTarget::File(PathBuf::from("out file")))
                .stderr(StdioTarget::MergeToSibling),
        );
        plan.push(
            ChainCondition::OnSuccess,
            ExecContext::from_words(["cat"]).stdin(StdioTarget::Null),
        );
        let mut last = ExecContext::from_words(["sleep", "1"]);
        last.wait_for_completion = false;
        plan.push(ChainCondition::Always, last);

        assert_eq!(
            plan.entire_command_line(),
            r#"echo hi | tr a-z A-Z > "out file" 2>&1 && cat < /dev/null ; sleep 1 &"#
        );

        plan.set_command_line("original text");
        assert_eq!(plan.entire_command_line(), "original text");
    }

    #[test]
    fn secondary_shell_plan_keeps_buffers() {
        let buffer = BufferHandle::new();
        let mut plan = ExecPlan::new(
            ExecContext::from_words(["echo", "$HOME"]).stdout(StdioTarget::Pipe(None)),
        );
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["cat"])
                .stdin(StdioTarget::Pipe(None))
                .stdout(StdioTarget::Buffer(buffer.clone())),
        );
        let delegated = plan.into_secondary_shell(&Config::default()).unwrap();

        assert_eq!(delegated.stages().len(), 1);
        let stage = &delegated.stages()[0];
        let args = stage.command.args();
        assert_eq!(args[1].value, "-c");
        assert_eq!(args[2].value, "echo $HOME | cat");
        assert!(stage.literal_escapes);
        assert_matches!(&stage.stdout_target, StdioTarget::Buffer(handle) => {
            assert!(handle.ptr_eq(&buffer));
        });
        assert_matches!(stage.stdin_target, StdioTarget::Default);
        assert_eq!(delegated.entire_command_line(), "echo $HOME | cat");
    }

    #[test]
    fn real_stages_report_status_and_environment() {
        let mut system = RealSystem::default();
        let mut first = ExecContext::from_words(["sh", "-c", "exit 4"]);
        first.capture_environment_on_exit = false;
        let mut plan = ExecPlan::new(first);
        let mut second = ExecContext::from_words([
            "sh",
            "-c",
            r#"printf 'RESULT=%s\0' "$1" > "/dev/fd/$PIPEWORK_ENV_FD""#,
            "sh",
            "done",
        ]);
        second.capture_environment_on_exit = true;
        plan.push(ChainCondition::OnFailure, second);

        let outcome = plan.run(&mut system, &Config::default(), &CancelToken::new());
        assert_eq!(outcome.status, ExitStatus::SUCCESS);
        assert_eq!(outcome.stages[0].captured_environment(), None);
        assert_eq!(
            outcome.stages[1].captured_environment(),
            Some(&[(OsString::from("RESULT"), OsString::from("done"))][..])
        );
    }

    #[test]
    fn real_pipeline_waits_for_all_stages() {
        let mut system = RealSystem::default();
        let first = ExecContext::from_words(["sh", "-c", "echo data; exit 5"])
            .stdout(StdioTarget::Pipe(None));
        let mut plan = ExecPlan::new(first);
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["sh", "-c", "read line; test \"$line\" = data"])
                .stdin(StdioTarget::Pipe(None)),
        );
        let outcome = plan.run(&mut system, &Config::default(), &CancelToken::new());
        assert_eq!(outcome.status, ExitStatus::SUCCESS);
        for stage in &outcome.stages {
            let process = stage.process().unwrap();
            assert_eq!(system.try_wait(process), Err(Errno::ECHILD));
        }
    }

    #[test]
    fn real_stage_is_interrupted_on_cancellation() {
        let mut system = RealSystem::default();
        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                cancel.cancel();
            })
        };
        let plan = ExecPlan::new(ExecContext::from_words(["sleep", "60"]));
        let outcome = plan.run(&mut system, &Config::default(), &cancel);
        canceller.join().unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.status, ExitStatus::from(Signal::SIGINT));
        let process = outcome.stages[0].process().unwrap();
        assert_eq!(system.try_wait(process), Err(Errno::ECHILD));
    }

    #[test]
    fn real_reader_of_missing_producer_is_not_started() {
        let mut system = RealSystem::default();
        let first = ExecContext::from_words(["pipework-no-such-command"])
            .stdout(StdioTarget::Pipe(None));
        let mut plan = ExecPlan::new(first);
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["true"]).stdin(StdioTarget::Pipe(None)),
        );
        let outcome = plan.run(&mut system, &Config::default(), &CancelToken::new());

        assert_eq!(outcome.status, ExitStatus::NOT_FOUND);
        assert_eq!(outcome.stages[0].process(), None);
        assert_eq!(outcome.stages[1].process(), None);
    }

    #[test]
    fn real_producer_is_not_blocked_by_missing_middle_stage() {
        let mut system = RealSystem::default();
        let cancel = CancelToken::new();
        {
            // Only fires if the producer hangs on a pipe nobody reads.
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_secs(10));
                cancel.cancel();
            });
        }
        let first = ExecContext::from_words(["sh", "-c", "head -c 1000000 /dev/zero"])
            .stdout(StdioTarget::Pipe(None));
        let mut plan = ExecPlan::new(first);
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["pipework-no-such-command"])
                .stdin(StdioTarget::Pipe(None))
                .stdout(StdioTarget::Pipe(None)),
        );
        plan.push(
            ChainCondition::Concurrent,
            ExecContext::from_words(["cat"])
                .stdin(StdioTarget::Pipe(None))
                .stdout(StdioTarget::Null),
        );
        let outcome = plan.run(&mut system, &Config::default(), &cancel);

        assert!(!outcome.cancelled);
        assert_eq!(outcome.status, ExitStatus::NOT_FOUND);
        assert_ne!(outcome.stages[0].process(), None);
        assert_eq!(outcome.stages[2].process(), None);
    }
}
