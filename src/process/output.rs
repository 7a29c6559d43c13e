//! Output truncation and failure rendering for engine commands.

use std::borrow::Cow;
use std::process::ExitStatus;

use color_eyre::Report;
use color_eyre::eyre::eyre;

pub(super) const OUTPUT_CHAR_LIMIT: usize = 2_048;
pub(super) const TRUNCATION_SUFFIX: &str = "… [truncated]";

/// Output captured from a finished command, one entry per line.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub(crate) struct CapturedOutput {
    pub(crate) stdout: Vec<String>,
    pub(crate) stderr: Vec<String>,
}

impl CapturedOutput {
    pub(crate) fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub(crate) fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Renders a nonzero exit as a report carrying the command line and both
/// output streams.
pub(super) fn render_failure(
    command_line: &str,
    status: ExitStatus,
    output: &CapturedOutput,
) -> Report {
    let stdout = truncate_output(Cow::Owned(output.stdout_text()));
    let stderr = truncate_output(Cow::Owned(output.stderr_text()));
    eyre!("`{command_line}` exited with {status}\nstdout: {stdout}\nstderr: {stderr}")
}

pub(super) fn render_timeout(command_line: &str, secs: u64, output: &CapturedOutput) -> Report {
    let stderr = truncate_output(Cow::Owned(output.stderr_text()));
    eyre!("`{command_line}` timed out after {secs}s and was terminated\nstderr: {stderr}")
}

pub(super) fn truncate_output(text: Cow<'_, str>) -> String {
    let mut out = String::with_capacity(OUTPUT_CHAR_LIMIT + TRUNCATION_SUFFIX.len());
    let mut chars = text.chars();
    for _ in 0..OUTPUT_CHAR_LIMIT {
        match chars.next() {
            Some(ch) => out.push(ch),
            None => return text.into_owned(),
        }
    }

    if chars.next().is_none() {
        return text.into_owned();
    }

    out.push_str(TRUNCATION_SUFFIX);
    out
}

/// Formats a program and its arguments for diagnostics, quoting arguments
/// that contain whitespace.
pub(super) fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        if arg.chars().any(char::is_whitespace) {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}
