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

//! Command line argument parser

use std::path::PathBuf;
use thiserror::Error;

/// Configuration for running a chain
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Run {
    /// Collect the standard output of the stages and print it after the
    /// chain finishes (`--capture`)
    pub capture: bool,
    /// Collect the standard error as well (`--capture-stderr`)
    pub capture_stderr: bool,
    /// Run the whole chain in a secondary shell (`--delegate`)
    pub delegate: bool,
    /// Start the stages in new sessions (`--detach`)
    pub detach: bool,
    /// Print the environment reported by the stages (`--report-environment`)
    pub report_environment: bool,
    /// Leave the stages running when interrupted (`--keep-running`)
    pub keep_running: bool,
    /// Print the chain instead of running it (`--dry-run`)
    pub dry_run: bool,
    /// Working directory of the stages (`-C`)
    pub working_dir: Option<PathBuf>,
    /// Words making up the chain
    pub words: Vec<String>,
}

/// Parse result
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Parse {
    /// Runs the chain
    Run(Run),
    /// Prints help message and exit
    Help,
    /// Prints version information and exit
    Version,
}

impl From<Run> for Parse {
    fn from(run: Run) -> Self {
        Parse::Run(run)
    }
}

/// Error in command line parsing
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// Option that is not defined
    #[error("unknown option `{0}`")]
    UnknownOption(String),

    /// Option missing an argument
    #[error("option `{0}` missing an argument")]
    MissingOptionArgument(String),

    /// Argument specified to an option that does not take an argument
    #[error("option `{0}` does not take an argument")]
    UnexpectedOptionArgument(String),

    /// No command to run
    #[error("missing command")]
    MissingCommand,
}

/// Parses command line arguments.
///
/// The first argument is the command name and is ignored. Options must
/// precede the words of the chain. The first argument that does not start
/// with a hyphen, or the argument following `--`, begins the chain.
pub fn parse<I, S>(args: I) -> Result<Parse, Error>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut args = args.into_iter().map(Into::into).skip(1).peekable();
    let mut run = Run::default();

    while let Some(arg) = args.next_if(|arg| arg.starts_with('-') && arg != "-") {
        if arg == "--" {
            break;
        }
        if let Some(long) = arg.strip_prefix("--") {
            let (name, value) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value.to_owned())),
                None => (long, None),
            };
            match (name, value) {
                ("help", None) => return Ok(Parse::Help),
                ("version", None) => return Ok(Parse::Version),
                ("help" | "version", Some(_)) => {
                    return Err(Error::UnexpectedOptionArgument(format!("--{name}")));
                }
                ("directory", Some(value)) => run.working_dir = Some(value.into()),
                ("directory", None) => {
                    let value = args
                        .next()
                        .ok_or_else(|| Error::MissingOptionArgument(arg.clone()))?;
                    run.working_dir = Some(value.into());
                }
                (name, value) => {
                    let Some(flag) = flag_mut(&mut run, name) else {
                        return Err(Error::UnknownOption(arg));
                    };
                    if value.is_some() {
                        return Err(Error::UnexpectedOptionArgument(format!("--{name}")));
                    }
                    *flag = true;
                }
            }
            continue;
        }

        for (index, c) in arg[1..].char_indices() {
            match c {
                'h' => return Ok(Parse::Help),
                'V' => return Ok(Parse::Version),
                'C' => {
                    let rest = &arg[index + 2..];
                    let value = if rest.is_empty() {
                        args.next()
                            .ok_or_else(|| Error::MissingOptionArgument("-C".to_owned()))?
                    } else {
                        rest.to_owned()
                    };
                    run.working_dir = Some(value.into());
                    break;
                }
                _ => return Err(Error::UnknownOption(format!("-{c}"))),
            }
        }
    }

    run.words.extend(args);
    if run.words.is_empty() {
        return Err(Error::MissingCommand);
    }
    Ok(Parse::Run(run))
}

/// Returns the field of the long option that takes no argument.
fn flag_mut<'a>(run: &'a mut Run, name: &str) -> Option<&'a mut bool> {
    match name {
        "capture" => Some(&mut run.capture),
        "capture-stderr" => Some(&mut run.capture_stderr),
        "delegate" => Some(&mut run.delegate),
        "detach" => Some(&mut run.detach),
        "dry-run" => Some(&mut run.dry_run),
        "keep-running" => Some(&mut run.keep_running),
        "report-environment" => Some(&mut run.report_environment),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(words: &[&str]) -> Vec<String> {
        words.iter().map(|&word| word.to_owned()).collect()
    }

    #[test]
    fn no_arguments() {
        assert_eq!(parse(["pipework"]), Err(Error::MissingCommand));
    }

    #[test]
    fn plain_words() {
        let result = parse(["pipework", "echo", "-n", "hello"]);
        assert_eq!(
            result,
            Ok(Parse::Run(Run {
                words: words(&["echo", "-n", "hello"]),
                ..Run::default()
            }))
        );
    }

    #[test]
    fn help_and_version() {
        assert_eq!(parse(["pipework", "--help"]), Ok(Parse::Help));
        assert_eq!(parse(["pipework", "-h"]), Ok(Parse::Help));
        assert_eq!(parse(["pipework", "--version"]), Ok(Parse::Version));
        assert_eq!(parse(["pipework", "-V", "ls"]), Ok(Parse::Version));
    }

    #[test]
    fn flags() {
        let result = parse([
            "pipework",
            "--capture",
            "--capture-stderr",
            "--delegate",
            "--detach",
            "--dry-run",
            "--keep-running",
            "--report-environment",
            "true",
        ]);
        assert_eq!(
            result,
            Ok(Parse::Run(Run {
                capture: true,
                capture_stderr: true,
                delegate: true,
                detach: true,
                dry_run: true,
                keep_running: true,
                report_environment: true,
                working_dir: None,
                words: words(&["true"]),
            }))
        );
    }

    #[test]
    fn working_directory() {
        let expected = Ok(Parse::Run(Run {
            working_dir: Some("/tmp".into()),
            words: words(&["pwd"]),
            ..Run::default()
        }));
        assert_eq!(parse(["pipework", "-C", "/tmp", "pwd"]), expected);
        assert_eq!(parse(["pipework", "-C/tmp", "pwd"]), expected);
        assert_eq!(parse(["pipework", "--directory", "/tmp", "pwd"]), expected);
        assert_eq!(parse(["pipework", "--directory=/tmp", "pwd"]), expected);
    }

    #[test]
    fn missing_option_argument() {
        assert_eq!(
            parse(["pipework", "-C"]),
            Err(Error::MissingOptionArgument("-C".to_owned()))
        );
        assert_eq!(
            parse(["pipework", "--directory"]),
            Err(Error::MissingOptionArgument("--directory".to_owned()))
        );
    }

    #[test]
    fn unexpected_option_argument() {
        assert_eq!(
            parse(["pipework", "--capture=yes", "ls"]),
            Err(Error::UnexpectedOptionArgument("--capture".to_owned()))
        );
    }

    #[test]
    fn unknown_options() {
        assert_eq!(
            parse(["pipework", "--frobnicate", "ls"]),
            Err(Error::UnknownOption("--frobnicate".to_owned()))
        );
        assert_eq!(
            parse(["pipework", "-x", "ls"]),
            Err(Error::UnknownOption("-x".to_owned()))
        );
    }

    #[test]
    fn double_hyphen_separator() {
        let result = parse(["pipework", "--capture", "--", "--capture", "x"]);
        assert_eq!(
            result,
            Ok(Parse::Run(Run {
                capture: true,
                words: words(&["--capture", "x"]),
                ..Run::default()
            }))
        );
    }
}
