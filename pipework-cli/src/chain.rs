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

//! Building a plan from words
//!
//! The words given on the command line are split into stages by the
//! operators `|`, `&&`, `||`, `;`, and `&`, each of which must be a word of
//! its own. Within a stage, the following words are redirections:
//!
//! - `<` *file*: read standard input from *file*
//! - `>` *file*, `1>` *file*: write standard output to *file*
//! - `>>` *file*, `1>>` *file*: append standard output to *file*
//! - `2>` *file*: write standard error to *file*
//! - `2>>` *file*: append standard error to *file*
//! - `2>&1`: write standard error where standard output goes
//! - `>&2`, `1>&2`: write standard output where standard error goes
//!
//! The file name may also be attached to the operator, as in `>out.txt`.
//! Any other word is an argument of the command.

use pipework::{BufferHandle, ChainCondition, CommandLine, ExecContext, ExecPlan, StdioTarget};
use thiserror::Error;

/// Error in building a plan
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// An operator not preceded by a command
    #[error("missing command before `{0}`")]
    MissingCommandBefore(String),

    /// An operator not followed by a command
    #[error("missing command after `{0}`")]
    MissingCommandAfter(String),

    /// A redirection operator not followed by a file name
    #[error("missing file name after `{0}`")]
    MissingFileName(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Operator {
    Pipe,
    And,
    Or,
    Sequence,
    Background,
}

impl Operator {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "|" => Some(Operator::Pipe),
            "&&" => Some(Operator::And),
            "||" => Some(Operator::Or),
            ";" => Some(Operator::Sequence),
            "&" => Some(Operator::Background),
            _ => None,
        }
    }

    fn condition(self) -> ChainCondition {
        match self {
            Operator::Pipe => ChainCondition::Concurrent,
            Operator::And => ChainCondition::OnSuccess,
            Operator::Or => ChainCondition::OnFailure,
            Operator::Sequence | Operator::Background => ChainCondition::Always,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Operator::Pipe => "|",
            Operator::And => "&&",
            Operator::Or => "||",
            Operator::Sequence => ";",
            Operator::Background => "&",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Redir {
    Input,
    Output,
    AppendOutput,
    Error,
    AppendError,
    ErrorToOutput,
    OutputToError,
}

/// Redirection operators, longer ones first
const REDIRECTIONS: [(&str, Redir); 11] = [
    ("2>&1", Redir::ErrorToOutput),
    ("1>&2", Redir::OutputToError),
    (">&2", Redir::OutputToError),
    ("2>>", Redir::AppendError),
    ("1>>", Redir::AppendOutput),
    ("2>", Redir::Error),
    ("1>", Redir::Output),
    (">>", Redir::AppendOutput),
    (">", Redir::Output),
    ("0<", Redir::Input),
    ("<", Redir::Input),
];

/// Splits a redirection word into the operator and the attached operand.
fn parse_redirection(word: &str) -> Option<(&'static str, Redir, &str)> {
    REDIRECTIONS.iter().find_map(|&(operator, redir)| {
        let operand = word.strip_prefix(operator)?;
        let takes_operand = !matches!(redir, Redir::ErrorToOutput | Redir::OutputToError);
        (takes_operand || operand.is_empty()).then_some((operator, redir, operand))
    })
}

/// Stage being built
#[derive(Debug, Default)]
struct Stage {
    words: Vec<String>,
    stdin: StdioTarget,
    stdout: StdioTarget,
    stderr: StdioTarget,
}

impl Stage {
    fn into_context(self) -> ExecContext {
        ExecContext::new(CommandLine::from_words(self.words))
            .stdin(self.stdin)
            .stdout(self.stdout)
            .stderr(self.stderr)
    }
}

/// Builds a plan from the words.
pub fn build_plan<I, S>(words: I) -> Result<ExecPlan, Error>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut words = words.into_iter().map(Into::into);
    let mut plan: Option<ExecPlan> = None;
    let mut stage = Stage::default();
    let mut pending: Option<Operator> = None;

    while let Some(word) = words.next() {
        if let Some(operator) = Operator::parse(&word) {
            if stage.words.is_empty() {
                return Err(Error::MissingCommandBefore(word));
            }
            let mut next = Stage::default();
            if operator == Operator::Pipe && matches!(stage.stdout, StdioTarget::Default) {
                stage.stdout = StdioTarget::Pipe(None);
                next.stdin = StdioTarget::Pipe(None);
            }
            let mut context = std::mem::replace(&mut stage, next).into_context();
            context.wait_for_completion = operator != Operator::Background;
            append(&mut plan, pending, context);
            pending = Some(operator);
            continue;
        }

        let Some((operator, redir, operand)) = parse_redirection(&word) else {
            stage.words.push(word);
            continue;
        };
        let mut file = || {
            if operand.is_empty() {
                words
                    .next()
                    .ok_or_else(|| Error::MissingFileName(operator.to_owned()))
            } else {
                Ok(operand.to_owned())
            }
        };
        match redir {
            Redir::Input => stage.stdin = StdioTarget::file(file()?),
            Redir::Output => stage.stdout = StdioTarget::file(file()?),
            Redir::AppendOutput => stage.stdout = StdioTarget::append(file()?),
            Redir::Error => stage.stderr = StdioTarget::file(file()?),
            Redir::AppendError => stage.stderr = StdioTarget::append(file()?),
            Redir::ErrorToOutput => stage.stderr = StdioTarget::MergeToSibling,
            Redir::OutputToError => stage.stdout = StdioTarget::MergeToSibling,
        }
    }

    if stage.words.is_empty() {
        return match (plan, pending) {
            (Some(plan), Some(Operator::Sequence | Operator::Background)) => Ok(plan),
            (_, Some(operator)) => Err(Error::MissingCommandAfter(operator.as_str().to_owned())),
            (_, None) => Err(Error::MissingCommandBefore("end of input".to_owned())),
        };
    }
    append(&mut plan, pending, stage.into_context());
    plan.ok_or_else(|| Error::MissingCommandBefore("end of input".to_owned()))
}

fn append(plan: &mut Option<ExecPlan>, pending: Option<Operator>, context: ExecContext) {
    match (plan.as_mut(), pending) {
        (Some(plan), Some(operator)) => plan.push(operator.condition(), context),
        (Some(plan), None) => plan.push(ChainCondition::Always, context),
        (None, _) => *plan = Some(ExecPlan::new(context)),
    }
}

/// Directs the outputs of the stages that are not redirected otherwise to
/// the buffer.
pub fn capture_outputs(plan: &mut ExecPlan, buffer: &BufferHandle, stderr: bool) {
    for stage in plan.stages_mut() {
        if matches!(stage.stdout_target, StdioTarget::Default) {
            stage.stdout_target = StdioTarget::Buffer(buffer.clone());
        }
        if stderr && matches!(stage.stderr_target, StdioTarget::Default) {
            stage.stderr_target = StdioTarget::Buffer(buffer.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::path::Path;

    fn program_names(plan: &ExecPlan) -> Vec<&str> {
        plan.stages()
            .iter()
            .map(|stage| stage.command.program().unwrap_or_default())
            .collect()
    }

    #[test]
    fn single_command() {
        let plan = build_plan(["echo", "hello", "world"]).unwrap();
        assert_eq!(plan.stages().len(), 1);
        let stage = &plan.stages()[0];
        assert_eq!(stage.command.render(false), "echo hello world");
        assert_eq!(stage.next, None);
        assert!(stage.wait_for_completion);
    }

    #[test]
    fn operators_link_stages() {
        let plan = build_plan(["a", "&&", "b", "||", "c", ";", "d", "|", "e"]).unwrap();
        assert_eq!(program_names(&plan), ["a", "b", "c", "d", "e"]);
        let links: Vec<_> = plan.stages().iter().map(|stage| stage.next).collect();
        assert_eq!(
            links,
            [
                Some(ChainCondition::OnSuccess),
                Some(ChainCondition::OnFailure),
                Some(ChainCondition::Always),
                Some(ChainCondition::Concurrent),
                None,
            ]
        );
    }

    #[test]
    fn pipe_connects_output_to_input() {
        let plan = build_plan(["ls", "|", "sort", "|", "head"]).unwrap();
        let stages = plan.stages();
        assert_matches!(stages[0].stdin_target, StdioTarget::Default);
        assert_matches!(stages[0].stdout_target, StdioTarget::Pipe(None));
        assert_matches!(stages[1].stdin_target, StdioTarget::Pipe(None));
        assert_matches!(stages[1].stdout_target, StdioTarget::Pipe(None));
        assert_matches!(stages[2].stdin_target, StdioTarget::Pipe(None));
        assert_matches!(stages[2].stdout_target, StdioTarget::Default);
    }

    #[test]
    fn redirected_output_is_not_piped() {
        let plan = build_plan(["ls", ">", "out", "|", "cat"]).unwrap();
        let stages = plan.stages();
        assert_matches!(&stages[0].stdout_target, StdioTarget::File(path) => {
            assert_eq!(path, Path::new("out"));
        });
        assert_matches!(stages[1].stdin_target, StdioTarget::Default);
    }

    #[test]
    fn background_stages() {
        let plan = build_plan(["server", "&", "client"]).unwrap();
        assert!(!plan.stages()[0].wait_for_completion);
        assert_eq!(plan.stages()[0].next, Some(ChainCondition::Always));
        assert!(plan.stages()[1].wait_for_completion);

        let plan = build_plan(["server", "&"]).unwrap();
        assert_eq!(plan.stages().len(), 1);
        assert!(!plan.stages()[0].wait_for_completion);
    }

    #[test]
    fn trailing_semicolon_is_allowed() {
        let plan = build_plan(["true", ";"]).unwrap();
        assert_eq!(program_names(&plan), ["true"]);
    }

    #[test]
    fn file_redirections() {
        let plan = build_plan(["sort", "<", "in", ">>out", "2>", "err", "extra"]).unwrap();
        let stage = &plan.stages()[0];
        assert_eq!(stage.command.render(false), "sort extra");
        assert_matches!(&stage.stdin_target, StdioTarget::File(path) => {
            assert_eq!(path, Path::new("in"));
        });
        assert_matches!(&stage.stdout_target, StdioTarget::Append(path) => {
            assert_eq!(path, Path::new("out"));
        });
        assert_matches!(&stage.stderr_target, StdioTarget::File(path) => {
            assert_eq!(path, Path::new("err"));
        });
    }

    #[test]
    fn null_device_redirections() {
        let plan = build_plan(["cmd", "2>/dev/null", "<", "/dev/null"]).unwrap();
        let stage = &plan.stages()[0];
        assert_matches!(stage.stdin_target, StdioTarget::Null);
        assert_matches!(stage.stderr_target, StdioTarget::Null);
    }

    #[test]
    fn merge_redirections() {
        let plan = build_plan(["cmd", "2>&1", ";", "cmd", ">&2"]).unwrap();
        assert_matches!(plan.stages()[0].stderr_target, StdioTarget::MergeToSibling);
        assert_matches!(plan.stages()[1].stdout_target, StdioTarget::MergeToSibling);
    }

    #[test]
    fn merge_operator_with_suffix_is_file_redirection() {
        let plan = build_plan(["cmd", "2>&1x"]).unwrap();
        assert_matches!(&plan.stages()[0].stderr_target, StdioTarget::File(path) => {
            assert_eq!(path, Path::new("&1x"));
        });
    }

    #[test]
    fn errors() {
        assert_eq!(
            build_plan(["|", "cat"]).unwrap_err(),
            Error::MissingCommandBefore("|".to_owned())
        );
        assert_eq!(
            build_plan(["a", ";", ";", "b"]).unwrap_err(),
            Error::MissingCommandBefore(";".to_owned())
        );
        assert_eq!(
            build_plan(["a", "&&"]).unwrap_err(),
            Error::MissingCommandAfter("&&".to_owned())
        );
        assert_eq!(
            build_plan(["cat", "<"]).unwrap_err(),
            Error::MissingFileName("<".to_owned())
        );
        assert_eq!(
            build_plan(["<", "in"]).unwrap_err(),
            Error::MissingCommandBefore("end of input".to_owned())
        );
    }

    #[test]
    fn outputs_are_captured_unless_redirected() {
        let mut plan = build_plan(["a", "|", "b", "2>", "err", ";", "c", ">", "out"]).unwrap();
        let buffer = BufferHandle::new();
        capture_outputs(&mut plan, &buffer, true);
        let stages = plan.stages();
        assert_matches!(stages[0].stdout_target, StdioTarget::Pipe(None));
        assert_matches!(&stages[0].stderr_target, StdioTarget::Buffer(handle) => {
            assert!(handle.ptr_eq(&buffer));
        });
        assert_matches!(&stages[1].stdout_target, StdioTarget::Buffer(handle) => {
            assert!(handle.ptr_eq(&buffer));
        });
        assert_matches!(stages[1].stderr_target, StdioTarget::File(_));
        assert_matches!(stages[2].stdout_target, StdioTarget::File(_));
        assert_matches!(stages[2].stderr_target, StdioTarget::Buffer(_));
    }
}
