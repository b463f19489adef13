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

//! This is an internal library crate for the `pipework` command. No part of
//! this crate is covered by semantic versioning.
//!
//! The entry point is the [`main`] function, which is to be used as the
//! `main` function in the binary crate. The function parses the command line
//! into an [`ExecPlan`], runs it, and exits with the resulting status.

pub mod args;
pub mod chain;

use self::args::{Parse, Run};
use nix::sys::signal::{SigSet, Signal};
use pipework::{
    BufferHandle, CancelAction, CancelToken, Config, ExecPlan, ExitStatus, PlanOutcome, RealSystem,
};
use std::io::Write as _;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable that selects which log records are printed
pub const LOG_VAR: &str = "PIPEWORK_LOG";

const HELP: &str = "\
Usage: pipework [options] [--] word...

Runs a chain of commands. The words are split into commands by the operators
`|`, `&&`, `||`, `;`, and `&`, each given as a separate word. The redirection
operators `<`, `>`, `>>`, `2>`, `2>>`, `2>&1`, and `>&2` apply to the command
they appear in.

Options:
  -C, --directory DIR    run the commands in DIR
  --capture              collect the output and print it after the commands finish
  --capture-stderr       collect the standard error as well
  --delegate             run the whole chain with the shell named by $PIPEWORK_SHELL
  --detach               start the commands in new sessions
  --dry-run              print the chain instead of running it
  --keep-running         leave the commands running when interrupted
  --report-environment   print the variables the commands report on exit
  -h, --help             print this help
  -V, --version          print version information
";

fn init_logging() {
    let default_level = "warn";
    let filter = EnvFilter::try_from_env(LOG_VAR)
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    // Another subscriber may only have been set by an embedding program.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Starts a thread that cancels the plan on SIGINT or SIGTERM.
///
/// The signals are blocked in the calling thread, so this function must be
/// called before any other thread is started for the mask to be inherited.
fn handle_signals(cancel: &CancelToken) -> std::io::Result<()> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;
    let cancel = cancel.clone();
    std::thread::Builder::new()
        .name("pipework-signals".to_owned())
        .spawn(move || {
            while let Ok(signal) = signals.wait() {
                info!(%signal, "cancelling");
                cancel.cancel();
            }
        })?;
    Ok(())
}

/// Applies the command line options to the plan.
fn prepare(run: &Run, config: &Config) -> Result<(ExecPlan, Option<BufferHandle>), String> {
    let mut plan = chain::build_plan(run.words.iter().cloned()).map_err(|e| e.to_string())?;
    for stage in plan.stages_mut() {
        stage.run_detached = run.detach;
        stage.capture_environment_on_exit = run.report_environment;
    }
    let buffer = (run.capture || run.capture_stderr).then(|| {
        let buffer = BufferHandle::with_limit(config.buffer_limit);
        chain::capture_outputs(&mut plan, &buffer, run.capture_stderr);
        buffer
    });
    if run.delegate {
        plan = plan.into_secondary_shell(config).map_err(|e| e.to_string())?;
    }
    Ok((plan, buffer))
}

/// Prints what the plan left behind.
fn report(outcome: &PlanOutcome, buffer: Option<BufferHandle>, run: &Run, arg0: &str) {
    for error in &outcome.errors {
        eprintln!("{arg0}: {error}");
    }

    let mut stdout = std::io::stdout().lock();
    if let Some(buffer) = buffer {
        if !outcome.background.is_empty() {
            // Background stages may keep the buffer open indefinitely.
            buffer.stop();
        }
        buffer.wait_for_eof();
        if buffer.is_discarded() {
            eprintln!("{arg0}: output discarded as it exceeded the buffer limit");
        } else if let Err(error) = stdout.write_all(&buffer.contents()) {
            warn!(%error, "cannot print captured output");
        }
    }

    if run.report_environment {
        for stage in &outcome.stages {
            for (name, value) in stage.captured_environment().unwrap_or_default() {
                let _ = writeln!(
                    stdout,
                    "{}={}",
                    name.to_string_lossy(),
                    value.to_string_lossy()
                );
            }
        }
    }

    for process in &outcome.background {
        debug!(pid = %process.pid(), "left running");
    }
    let _ = stdout.flush();
}

fn run_as_front_end() -> ExitStatus {
    let arg0 = std::env::args().next().unwrap_or_else(|| "pipework".to_owned());
    let run = match args::parse(std::env::args()) {
        Ok(Parse::Help) => {
            print!("{HELP}");
            return ExitStatus::SUCCESS;
        }
        Ok(Parse::Version) => {
            println!("pipework {}", env!("CARGO_PKG_VERSION"));
            return ExitStatus::SUCCESS;
        }
        Ok(Parse::Run(run)) => run,
        Err(e) => {
            eprintln!("{arg0}: {e}");
            return ExitStatus::ERROR;
        }
    };

    let mut config = Config::from_env();
    if let Some(dir) = &run.working_dir {
        config.working_dir = Some(dir.clone());
    }
    if run.keep_running {
        config.cancel_action = CancelAction::LeaveRunning;
    }
    debug!(?config, "configured");

    let (plan, buffer) = match prepare(&run, &config) {
        Ok(prepared) => prepared,
        Err(message) => {
            eprintln!("{arg0}: {message}");
            return ExitStatus::ERROR;
        }
    };
    if run.dry_run {
        println!("{}", plan.entire_command_line());
        return ExitStatus::SUCCESS;
    }

    let cancel = CancelToken::new();
    if let Err(error) = handle_signals(&cancel) {
        warn!(%error, "interrupts will not cancel the commands");
    }
    let mut system = RealSystem::new(config.clone());
    let outcome = plan.run(&mut system, &config, &cancel);
    report(&outcome, buffer, &run, &arg0);
    outcome.status
}

pub fn main() -> ! {
    init_logging();
    let status = run_as_front_end();
    std::process::exit(status.0)
}
