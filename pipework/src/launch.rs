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

//! Starting processes for stages
//!
//! [`ProcessLauncher`] starts the process of a stage in these steps:
//!
//! 1. With the [`StdioLock`](crate::redir::StdioLock) held, the standard
//!    streams are [redirected](crate::redir) for the stage and the read end of
//!    an output pipe is handed to the next stage. Redirection errors are
//!    therefore reported even if the command does not exist.
//! 2. The command is resolved and everything the child needs (argument and
//!    environment vectors, paths) is converted to C strings, so that the
//!    child does not allocate memory after forking. The process is forked and
//!    the streams are restored immediately in the parent.
//! 3. The child puts itself in a new process group (or session), restores
//!    default signal handling and waits at a start gate.
//! 4. Meanwhile, the parent reads the header of the program image to decide
//!    how the stage should be [terminated](crate::ChildProcess::terminate),
//!    and then opens the gate.
//! 5. The child executes the program. If the kernel does not recognize the
//!    file format, the file is run as a script by the fallback shell. If
//!    execution fails, the child reports the error number through a
//!    close-on-exec pipe; the parent learns that the execution succeeded when
//!    the pipe is closed without data.

use crate::cmdline::CmdLineError;
use crate::config::{Config, ENV_FD_VAR};
use crate::context::ExecContext;
use crate::image;
use crate::pump;
use crate::redir::{self, RedirError, lock_stdio};
use crate::search::search_path;
use crate::status::ExitStatus;
use crate::stdio::StdioTarget;
use crate::sys;
use crate::system::ChildProcess;
use bitflags::bitflags;
use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::ffi::{CString, OsStr, c_char, c_int};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

bitflags! {
    /// Options for creating the process of a stage
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct CreationFlags: u8 {
        /// Hold the child at the start gate until the parent opens it.
        const SUSPENDED = 1 << 0;
        /// Make the child the leader of a new process group.
        const NEW_PROCESS_GROUP = 1 << 1;
        /// Make the child the leader of a new session without a terminal.
        const NEW_SESSION = 1 << 2;
        /// Restore default signal dispositions and an empty signal mask.
        const DEFAULT_SIGNALS = 1 << 3;
        /// Pass an environment channel to the child.
        const REPORT_ENVIRONMENT = 1 << 4;
    }
}

impl CreationFlags {
    /// Computes the flags for launching the stage.
    #[must_use]
    pub fn for_context(context: &ExecContext) -> Self {
        let mut flags = CreationFlags::SUSPENDED | CreationFlags::DEFAULT_SIGNALS;
        if context.run_detached {
            flags |= CreationFlags::NEW_SESSION;
        } else {
            flags |= CreationFlags::NEW_PROCESS_GROUP;
        }
        if context.capture_environment_on_exit {
            flags |= CreationFlags::REPORT_ENVIRONMENT;
        }
        flags
    }
}

/// Error in launching a stage
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LaunchError {
    #[error(transparent)]
    CommandLine(#[from] CmdLineError),
    /// The standard streams could not be redirected.
    ///
    /// No process has been created.
    #[error(transparent)]
    Redirection(#[from] RedirError),
    /// The process could not be created or the program could not be
    /// executed.
    #[error("cannot execute `{program}`: {errno}")]
    ProcessCreation { program: String, errno: Errno },
}

impl LaunchError {
    /// Whether the error occurred while redirecting the standard streams
    #[must_use]
    pub fn failed_during_redirection(&self) -> bool {
        matches!(self, LaunchError::Redirection(_))
    }

    /// Exit status that represents the failure
    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            LaunchError::CommandLine(_) | LaunchError::Redirection(_) => ExitStatus::ERROR,
            LaunchError::ProcessCreation {
                errno: Errno::ENOENT | Errno::ENOTDIR,
                ..
            } => ExitStatus::NOT_FOUND,
            LaunchError::ProcessCreation { .. } => ExitStatus::NOEXEC,
        }
    }
}

/// Everything the child needs to execute the program
#[derive(Debug)]
struct Image {
    path: CString,
    argv: Vec<CString>,
    fallback_path: CString,
    fallback_argv: Vec<CString>,
    envp: Vec<CString>,
    working_dir: Option<CString>,
}

/// Null-terminated pointer arrays into an [`Image`]
struct ImagePointers {
    argv: Vec<*const c_char>,
    fallback_argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
}

fn pointers(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn path_to_c_string(path: &Path) -> Result<CString, CmdLineError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CmdLineError::NulByte(path.to_string_lossy().into_owned()))
}

impl Image {
    fn new(
        path: &Path,
        argv: Vec<CString>,
        env_fd: Option<RawFd>,
        working_dir: Option<&Path>,
        config: &Config,
    ) -> Result<Self, CmdLineError> {
        let path = path_to_c_string(path)?;
        let fallback_path = path_to_c_string(&config.fallback_shell)?;
        let fallback_argv = fallback_arguments(&path, &argv);
        let working_dir = working_dir.map(path_to_c_string).transpose()?;
        Ok(Image {
            path,
            argv,
            fallback_path,
            fallback_argv,
            envp: environment(env_fd),
            working_dir,
        })
    }

    fn pointers(&self) -> ImagePointers {
        ImagePointers {
            argv: pointers(&self.argv),
            fallback_argv: pointers(&self.fallback_argv),
            envp: pointers(&self.envp),
        }
    }
}

/// Arguments for running `script` with the fallback shell
fn fallback_arguments(script: &CString, argv: &[CString]) -> Vec<CString> {
    // Prevent the path from being regarded as an option
    let script = if script.as_bytes().starts_with(b"-") {
        CString::new([b"./", script.as_bytes()].concat()).unwrap_or_default()
    } else {
        script.clone()
    };
    // Some shells change their behavior depending on argv[0].
    let mut args = vec![c"sh".to_owned(), script];
    args.extend(argv.iter().skip(1).cloned());
    args
}

/// Environment of the child
///
/// An environment channel inherited from the parent is not passed on.
fn environment(env_fd: Option<RawFd>) -> Vec<CString> {
    let mut envp: Vec<CString> = std::env::vars_os()
        .filter(|(name, _)| name.as_os_str() != OsStr::new(ENV_FD_VAR))
        .filter_map(|(name, value)| {
            let mut var = name.into_vec();
            var.push(b'=');
            var.extend(value.into_vec());
            CString::new(var).ok()
        })
        .collect();
    if let Some(fd) = env_fd {
        if let Ok(var) = CString::new(format!("{ENV_FD_VAR}={fd}")) {
            envp.push(var);
        }
    }
    envp
}

/// File descriptors the child operates on
#[derive(Clone, Copy, Debug)]
struct ChildFds {
    gate_reader: RawFd,
    gate_writer: RawFd,
    error_reader: RawFd,
    error_writer: RawFd,
    env_writer: Option<RawFd>,
}

/// Launcher of real processes
#[derive(Debug)]
pub struct ProcessLauncher<'c> {
    config: &'c Config,
}

impl<'c> ProcessLauncher<'c> {
    #[must_use]
    pub fn new(config: &'c Config) -> Self {
        ProcessLauncher { config }
    }

    /// Starts the process of a stage.
    ///
    /// See the [module documentation](self) for the steps. On success, the
    /// process is recorded in `context`. If the stage pipes its output and
    /// `next_stdin` is a [`Pipe`](StdioTarget::Pipe) target, the read end of
    /// the pipe is stored in it, also when a later step fails.
    pub fn launch(
        &self,
        context: &mut ExecContext,
        next_stdin: Option<&mut StdioTarget>,
        working_dir: Option<&Path>,
    ) -> Result<(), LaunchError> {
        let program = context.command.program().unwrap_or_default().to_owned();
        let creation_error = |errno| LaunchError::ProcessCreation {
            program: program.clone(),
            errno,
        };

        // Redirection comes first so that its errors take precedence and
        // its files are created even if the command cannot be found.
        let lock = lock_stdio();
        let mut redirection = redir::initialize(&lock, context, false)?;
        if let Some(reader) = redirection.take_pipe_for_next() {
            if let Some(StdioTarget::Pipe(slot)) = next_stdin {
                *slot = Some(reader);
            }
        }

        let argv = context.command.to_c_strings()?;
        let path_var = std::env::var_os("PATH");
        let resolved = search_path(OsStr::new(&program), path_var.as_deref())
            .ok_or_else(|| creation_error(Errno::ENOENT))?;
        let flags = CreationFlags::for_context(context);

        let env_channel = if flags.contains(CreationFlags::REPORT_ENVIRONMENT) {
            Some(sys::pipe().map_err(creation_error)?)
        } else {
            None
        };
        let (env_reader, env_writer) = env_channel.unzip();
        let env_fd = env_writer.as_ref().map(AsRawFd::as_raw_fd);
        let image = Image::new(&resolved, argv, env_fd, working_dir, self.config)?;
        let image_pointers = image.pointers();
        let (gate_reader, gate_writer) = sys::pipe().map_err(creation_error)?;
        let (error_reader, error_writer) = sys::pipe().map_err(creation_error)?;
        let fds = ChildFds {
            gate_reader: gate_reader.as_raw_fd(),
            gate_writer: gate_writer.as_raw_fd(),
            error_reader: error_reader.as_raw_fd(),
            error_writer: error_writer.as_raw_fd(),
            env_writer: env_fd,
        };

        let child = unsafe { libc::fork() };
        if child == 0 {
            unsafe { exec_child(&image, &image_pointers, flags, fds) }
        }
        let fork_errno = Errno::last();
        redirection.revert();
        drop(lock);
        drop(gate_reader);
        drop(error_writer);
        drop(env_writer);
        if child == -1 {
            return Err(creation_error(fork_errno));
        }

        let pid = Pid::from_raw(child);
        if !flags.contains(CreationFlags::NEW_SESSION) {
            // The child does the same; whichever runs first wins.
            unsafe { libc::setpgid(child, child) };
        }
        let terminate_gracefully = terminates_gracefully(&resolved, working_dir, flags);

        if let Err(errno) = sys::write_all(gate_writer.as_raw_fd(), &[0]) {
            debug!(pid = child, %errno, "cannot open the start gate");
        }
        drop(gate_writer);
        if let Some(errno) = read_exec_error(&error_reader) {
            let _ = waitpid(pid, None);
            return Err(creation_error(errno));
        }

        context.set_process(ChildProcess::new(pid, terminate_gracefully));
        if let Some(reader) = env_reader {
            match pump::start(reader) {
                Ok(channel) => context.set_env_channel(channel),
                Err(error) => warn!(%error, "environment of the stage will not be captured"),
            }
        }
        debug!(
            pid = child,
            command = %context.command.render(context.literal_escapes),
            terminate_gracefully,
            "launched stage"
        );
        Ok(())
    }
}

/// Decides whether the process running the image should be interrupted
/// rather than killed.
fn terminates_gracefully(image: &Path, working_dir: Option<&Path>, flags: CreationFlags) -> bool {
    if flags.contains(CreationFlags::NEW_SESSION) {
        return false;
    }
    let path = match working_dir {
        Some(dir) if image.is_relative() => dir.join(image),
        _ => image.to_owned(),
    };
    match image::inspect(&path) {
        Ok(subsystem) => subsystem.allows_graceful_termination(),
        Err(error) => {
            debug!(%error, "assuming the stage must be killed");
            false
        }
    }
}

/// Reads the error number reported by a child that failed to execute.
///
/// Returns `None` if the pipe is closed without data, which means the
/// program has been executed.
fn read_exec_error(reader: &OwnedFd) -> Option<Errno> {
    let mut bytes = [0; size_of::<c_int>()];
    let mut filled = 0;
    while filled < bytes.len() {
        match sys::read(reader.as_raw_fd(), &mut bytes[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(count) => filled += count,
        }
    }
    (filled == bytes.len()).then(|| Errno::from_raw(c_int::from_ne_bytes(bytes)))
}

/// Body of the forked child
///
/// Only async-signal-safe functions may be called here since the parent may
/// have other threads.
unsafe fn exec_child(
    image: &Image,
    pointers: &ImagePointers,
    flags: CreationFlags,
    fds: ChildFds,
) -> ! {
    unsafe {
        libc::close(fds.gate_writer);
        libc::close(fds.error_reader);

        if flags.contains(CreationFlags::NEW_SESSION) {
            libc::setsid();
        } else if flags.contains(CreationFlags::NEW_PROCESS_GROUP) {
            libc::setpgid(0, 0);
        }
        if flags.contains(CreationFlags::DEFAULT_SIGNALS) {
            reset_signals();
        }
        if let Some(fd) = fds.env_writer {
            libc::fcntl(fd, libc::F_SETFD, 0);
        }
        if let Some(dir) = &image.working_dir {
            if libc::chdir(dir.as_ptr()) == -1 {
                report_and_exit(fds.error_writer);
            }
        }

        if flags.contains(CreationFlags::SUSPENDED) {
            let mut byte = 0u8;
            loop {
                match libc::read(fds.gate_reader, (&mut byte as *mut u8).cast(), 1) {
                    1 => break,
                    -1 if Errno::last() == Errno::EINTR => continue,
                    // The parent gave up on us
                    _ => libc::_exit(ExitStatus::NOT_FOUND.0),
                }
            }
        }
        libc::close(fds.gate_reader);

        libc::execve(image.path.as_ptr(), pointers.argv.as_ptr(), pointers.envp.as_ptr());
        if Errno::last() == Errno::ENOEXEC {
            libc::execve(
                image.fallback_path.as_ptr(),
                pointers.fallback_argv.as_ptr(),
                pointers.envp.as_ptr(),
            );
        }
        report_and_exit(fds.error_writer)
    }
}

const RESET_SIGNALS: [c_int; 8] = [
    libc::SIGPIPE,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGCHLD,
];

unsafe fn reset_signals() {
    unsafe {
        for signal in RESET_SIGNALS {
            libc::signal(signal, libc::SIG_DFL);
        }
        let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigprocmask(libc::SIG_SETMASK, set.as_ptr(), std::ptr::null_mut());
    }
}

unsafe fn report_and_exit(error_writer: RawFd) -> ! {
    let bytes = (Errno::last() as c_int).to_ne_bytes();
    unsafe {
        libc::write(error_writer, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(ExitStatus::NOEXEC.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::Stream;
    use crate::system::{RealSystem, System};
    use assert_matches::assert_matches;
    use std::ffi::OsString;
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn wait(system: &mut RealSystem, context: &ExecContext) -> ExitStatus {
        let process = context.process().unwrap();
        loop {
            if let Some(status) = system.try_wait(process).unwrap() {
                return status;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn write_script(dir: &Path, name: &str, contents: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_owned()
    }

    #[test]
    fn flags_for_contexts() {
        let mut context = ExecContext::from_words(["ls"]);
        assert_eq!(
            CreationFlags::for_context(&context),
            CreationFlags::SUSPENDED
                | CreationFlags::DEFAULT_SIGNALS
                | CreationFlags::NEW_PROCESS_GROUP
        );

        context.run_detached = true;
        context.capture_environment_on_exit = true;
        let flags = CreationFlags::for_context(&context);
        assert!(flags.contains(CreationFlags::NEW_SESSION));
        assert!(flags.contains(CreationFlags::REPORT_ENVIRONMENT));
        assert!(!flags.contains(CreationFlags::NEW_PROCESS_GROUP));
    }

    #[test]
    fn fallback_arguments_prepend_script_path() {
        let argv = [c"foo".to_owned(), c"-x".to_owned()];
        let args = fallback_arguments(&c"/tmp/foo".to_owned(), &argv);
        assert_eq!(args, [c"sh".to_owned(), c"/tmp/foo".to_owned(), c"-x".to_owned()]);

        let args = fallback_arguments(&c"-foo/bar".to_owned(), &argv[..1]);
        assert_eq!(args, [c"sh".to_owned(), c"./-foo/bar".to_owned()]);
    }

    #[test]
    fn environment_channel_variable_is_replaced() {
        let envp = environment(Some(42));
        let prefix = format!("{ENV_FD_VAR}=");
        let vars: Vec<_> = envp
            .iter()
            .filter(|var| var.to_bytes().starts_with(prefix.as_bytes()))
            .collect();
        assert_eq!(vars, [&CString::new(format!("{ENV_FD_VAR}=42")).unwrap()]);

        let envp = environment(None);
        assert!(!envp.iter().any(|var| var.to_bytes().starts_with(prefix.as_bytes())));
    }

    #[test]
    fn exec_error_is_read_from_pipe() {
        let (reader, writer) = sys::pipe().unwrap();
        sys::write_all(writer.as_raw_fd(), &(libc::EACCES as c_int).to_ne_bytes()).unwrap();
        drop(writer);
        assert_eq!(read_exec_error(&reader), Some(Errno::EACCES));

        let (reader, writer) = sys::pipe().unwrap();
        drop(writer);
        assert_eq!(read_exec_error(&reader), None);
    }

    #[test]
    fn script_without_shebang_runs_in_fallback_shell() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "script", "exit 7\n");
        let mut system = RealSystem::default();
        let mut context = ExecContext::from_words([script]);
        system.launch(&mut context, None, None).unwrap();
        assert!(!context.process().unwrap().terminate_gracefully());
        assert_eq!(wait(&mut system, &context), ExitStatus(7));
    }

    #[test]
    fn script_with_shebang_is_terminated_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "script", "#!/bin/sh\nexit 0\n");
        let mut system = RealSystem::default();
        let mut context = ExecContext::from_words([script]);
        system.launch(&mut context, None, None).unwrap();
        assert!(context.process().unwrap().terminate_gracefully());
        assert_eq!(wait(&mut system, &context), ExitStatus::SUCCESS);
    }

    #[test]
    fn unexecutable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let directory = dir.path().to_str().unwrap().to_owned();
        let mut system = RealSystem::default();
        let mut context = ExecContext::from_words([directory.clone()]);
        let error = system.launch(&mut context, None, None).unwrap_err();
        assert_eq!(
            error,
            LaunchError::ProcessCreation {
                program: directory,
                errno: Errno::EACCES,
            }
        );
        assert_eq!(error.exit_status(), ExitStatus::NOEXEC);
        assert_eq!(context.process(), None);
    }

    #[test]
    fn stage_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut system = RealSystem::default();
        let mut context = ExecContext::from_words(["sh", "-c", "pwd > here"]);
        system.launch(&mut context, None, Some(dir.path())).unwrap();
        assert_eq!(wait(&mut system, &context), ExitStatus::SUCCESS);

        let reported = std::fs::read_to_string(dir.path().join("here")).unwrap();
        let reported = std::fs::canonicalize(reported.trim_end()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn environment_is_reported_through_channel() {
        let mut system = RealSystem::default();
        let mut context = ExecContext::from_words([
            "sh",
            "-c",
            r#"FOO=bar; export FOO; printf 'FOO=%s\0' "$FOO" > "/dev/fd/$PIPEWORK_ENV_FD""#,
        ]);
        context.capture_environment_on_exit = true;
        system.launch(&mut context, None, None).unwrap();
        assert_eq!(wait(&mut system, &context), ExitStatus::SUCCESS);
        context.finish_environment_capture();
        assert_eq!(
            context.captured_environment(),
            Some(&[(OsString::from("FOO"), OsString::from("bar"))][..])
        );
    }

    #[test]
    fn output_pipe_is_threaded_to_next_stdin() {
        let mut system = RealSystem::default();
        let mut producer = ExecContext::from_words(["sh", "-c", "echo piped"])
            .stdout(StdioTarget::Pipe(None));
        let mut next_stdin = StdioTarget::Pipe(None);
        system
            .launch(&mut producer, Some(&mut next_stdin), None)
            .unwrap();
        assert_eq!(wait(&mut system, &producer), ExitStatus::SUCCESS);

        let StdioTarget::Pipe(Some(reader)) = next_stdin else {
            panic!("pipe not handed over: {next_stdin:?}");
        };
        let mut contents = String::new();
        std::io::Read::read_to_string(&mut std::fs::File::from(reader), &mut contents).unwrap();
        assert!(contents.contains("piped\n"), "{contents:?}");
    }

    #[test]
    fn files_are_created_for_missing_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut system = RealSystem::default();
        let mut context = ExecContext::from_words(["pipework-no-such-command"])
            .stdout(StdioTarget::File(out.clone()));
        let error = system.launch(&mut context, None, None).unwrap_err();
        assert_matches!(error, LaunchError::ProcessCreation { errno: Errno::ENOENT, .. });
        assert!(!error.failed_during_redirection());
        assert!(out.exists());
    }

    #[test]
    fn redirection_error_takes_precedence_over_missing_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut system = RealSystem::default();
        let mut context = ExecContext::from_words(["pipework-no-such-command"])
            .stdin(StdioTarget::File(dir.path().join("missing")))
            .stdout(StdioTarget::File(dir.path().join("out.txt")));
        let error = system.launch(&mut context, None, None).unwrap_err();
        assert!(error.failed_during_redirection());
        assert_matches!(&error, LaunchError::Redirection(error) => {
            assert_eq!(error.stream, Stream::Stdin);
        });
        assert_eq!(error.exit_status(), ExitStatus::ERROR);
    }

    #[test]
    fn missing_command_hands_closed_pipe_to_next_stage() {
        let mut system = RealSystem::default();
        let mut producer =
            ExecContext::from_words(["pipework-no-such-command"]).stdout(StdioTarget::Pipe(None));
        let mut next_stdin = StdioTarget::Pipe(None);
        let error = system
            .launch(&mut producer, Some(&mut next_stdin), None)
            .unwrap_err();
        assert_eq!(error.exit_status(), ExitStatus::NOT_FOUND);

        let StdioTarget::Pipe(Some(reader)) = next_stdin else {
            panic!("pipe not handed over: {next_stdin:?}");
        };
        let mut buffer = [0; 8];
        assert_eq!(sys::read(reader.as_raw_fd(), &mut buffer), Ok(0));
    }
}
