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

//! This crate runs chains of external commands with their standard streams
//! redirected, the way a command shell runs pipelines and lists.
//!
//! A stage of a chain is an [`ExecContext`]: a [`CommandLine`] to run, a
//! [`StdioTarget`] for each of the three standard streams, and the
//! [`ChainCondition`] that links it to the following stage. An [`ExecPlan`]
//! is an ordered list of stages, which [`ExecPlan::run`] launches and waits
//! for, producing a [`PlanOutcome`].
//!
//! Launching a stage involves redirecting the standard streams of the shell
//! process itself so that the child inherits them. The [`redir`] module does
//! this and restores the streams afterwards. The same module provides
//! [`with_redirection`](redir::with_redirection) for running in-process code
//! (such as a built-in command) with redirected streams.
//!
//! The [`System`] trait is the interface through which plans launch, wait
//! for, and signal processes. [`RealSystem`] interacts with the underlying
//! operating system. [`VirtualSystem`] simulates processes without creating
//! any, which is useful for testing the orchestration logic.
//!
//! Output that should be captured into memory rather than written to a file
//! goes to a [`BufferHandle`], which is filled by a background reader thread
//! (see the [`pump`] module).

pub mod cancel;
pub mod cmdline;
pub mod config;
pub mod context;
pub mod image;
pub mod launch;
pub mod plan;
pub mod pump;
pub mod redir;
pub mod search;
pub mod status;
pub mod stdio;
mod sys;
pub mod system;
pub mod virtual_system;

pub use self::cancel::CancelToken;
pub use self::cmdline::{Argument, CommandLine};
pub use self::config::{CancelAction, Config};
pub use self::context::{ChainCondition, ExecContext};
pub use self::launch::LaunchError;
pub use self::plan::{ExecPlan, PlanOutcome};
pub use self::pump::BufferHandle;
pub use self::redir::RedirError;
pub use self::status::ExitStatus;
pub use self::stdio::{StdioTarget, Stream};
pub use self::system::{ChildProcess, RealSystem, System};
pub use self::virtual_system::{VirtualProgram, VirtualSystem};
