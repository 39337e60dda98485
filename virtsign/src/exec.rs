// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsStr,
    io,
    process::{Command, Stdio},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to execute: {0}")]
    Spawn(String, #[source] io::Error),
    #[error("{command} terminated by signal")]
    Killed { command: String },
    #[error("{command} exited with unexpected status {code}; output:\n{output}")]
    UnexpectedStatus {
        command: String,
        code: i32,
        output: String,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Captured result of an external invocation.
#[derive(Clone, Debug)]
pub struct Output {
    /// Combined stdout/stderr text.
    pub text: String,
    pub code: i32,
}

fn render<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> String {
    let mut rendered = program.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.as_ref().to_string_lossy());
    }
    rendered
}

/// Run an external program and capture its output, requiring a zero exit
/// status.
pub fn run<S: AsRef<OsStr>>(program: impl AsRef<OsStr>, args: &[S]) -> Result<Output> {
    run_with(program, args, &[], &[0])
}

/// Run an external program with environment overrides (merged over the
/// ambient environment) and capture its combined output. Exiting with a
/// status outside of `allowed` is an error that carries the output.
pub fn run_with<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    env: &[(&str, &str)],
    allowed: &[i32],
) -> Result<Output> {
    let program = program.as_ref();
    let command = render(program, args);

    debug!("Running: {command}");

    let output = Command::new(program)
        .args(args)
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| Error::Spawn(command.clone(), e))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !text.is_empty() {
        debug!("Output of {command}:\n{}", text.trim_end());
    }

    let Some(code) = output.status.code() else {
        return Err(Error::Killed { command });
    };

    if !allowed.contains(&code) {
        return Err(Error::UnexpectedStatus {
            command,
            code,
            output: text.trim_end().to_owned(),
        });
    }

    Ok(Output { text, code })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn captures_output_and_allowed_status() {
        let output = run_with("sh", &["-c", "echo first; exit 3"], &[], &[0, 3]).unwrap();
        assert_eq!(output.code, 3);
        assert!(output.text.contains("first"));
    }

    #[test]
    fn unexpected_status_carries_output() {
        let result = run("sh", &["-c", "echo oops >&2; exit 1"]);
        assert_matches!(
            result,
            Err(Error::UnexpectedStatus { code: 1, ref output, .. }) if output.contains("oops")
        );
    }

    #[test]
    fn env_overrides_ambient() {
        let output = run_with(
            "sh",
            &["-c", "printf %s \"$VIRTSIGN_TEST_VAR\""],
            &[("VIRTSIGN_TEST_VAR", "value")],
            &[0],
        )
        .unwrap();
        assert_eq!(output.text, "value");
    }

    #[test]
    fn merges_stdout_and_stderr() {
        let output = run("sh", &["-c", "echo out; echo err >&2"]).unwrap();
        assert!(output.text.contains("out"));
        assert!(output.text.contains("err"));
    }
}
