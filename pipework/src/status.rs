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

//! Exit status of commands and stages.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::os::raw::c_int;

/// Number that summarizes the result of running a stage.
///
/// Programs usually return zero when successful and non-zero otherwise. The
/// pipeline engine uses the exit status of a stage to decide whether stages
/// linked by [`OnSuccess`](crate::ChainCondition::OnSuccess) or
/// [`OnFailure`](crate::ChainCondition::OnFailure) should run, and reports
/// the status of the last stage that ran as the result of the whole plan.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ExitStatus(pub c_int);

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<c_int> for ExitStatus {
    fn from(value: c_int) -> ExitStatus {
        ExitStatus(value)
    }
}

impl From<ExitStatus> for c_int {
    fn from(exit_status: ExitStatus) -> c_int {
        exit_status.0
    }
}

impl From<Signal> for ExitStatus {
    /// Converts a signal to the corresponding exit status.
    ///
    /// The result is `128 + signal_number`, which is what POSIX shells report
    /// for a process killed by a signal.
    fn from(signal: Signal) -> Self {
        Self(signal as c_int + 0x80)
    }
}

impl ExitStatus {
    /// Exit status of 0: success
    pub const SUCCESS: ExitStatus = ExitStatus(0);

    /// Exit status of 1: failure
    pub const FAILURE: ExitStatus = ExitStatus(1);

    /// Exit status of 2: error severer than failure
    ///
    /// This is the status of a stage whose redirections could not be
    /// performed.
    pub const ERROR: ExitStatus = ExitStatus(2);

    /// Exit status of 126: command found but not executable
    pub const NOEXEC: ExitStatus = ExitStatus(126);

    /// Exit status of 127: command not found
    pub const NOT_FOUND: ExitStatus = ExitStatus(127);

    /// Returns true if and only if `self` is zero.
    pub const fn is_successful(&self) -> bool {
        self.0 == 0
    }

    /// Converts a wait status reported by the kernel.
    ///
    /// Returns `None` if the status does not describe a terminated process.
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self(code)),
            WaitStatus::Signaled(_, signal, _) => Some(signal.into()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn signal_exit_status_exceeds_128() {
        assert_eq!(ExitStatus::from(Signal::SIGINT), ExitStatus(130));
        assert_eq!(ExitStatus::from(Signal::SIGKILL), ExitStatus(137));
    }

    #[test]
    fn wait_status_conversion() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some(ExitStatus(3))
        );
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(ExitStatus(143))
        );
        assert_eq!(ExitStatus::from_wait_status(WaitStatus::StillAlive), None);
    }
}
