//! Runs the engine's command-line tools as child processes.
//!
//! Each command's stdout and stderr are drained continuously by dedicated
//! reader threads, so a chatty child never stalls on a full pipe. Lines are
//! logged as they arrive and collected for failure diagnostics. A detached
//! grandchild (the engine itself, once `pg_ctl start` daemonises) may keep
//! the pipes open after the launcher exits; collection therefore stops a
//! short grace period after the child exits rather than waiting for EOF.

mod output;

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tracing::{debug, info, info_span, warn};
use wait_timeout::ChildExt;

pub(crate) use self::output::CapturedOutput;
use self::output::{command_line, render_failure, render_timeout};
use crate::error::{EmbedError, EmbedErrorKind, EmbedResult};
use crate::observability::PROCESS_TARGET;

/// How long to keep collecting output after the child exits.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Describes one invocation of an engine tool.
#[derive(Debug, Clone)]
pub(crate) struct CommandSpec {
    program: Utf8PathBuf,
    args: Vec<String>,
    label: String,
    timeout: Option<Duration>,
}

impl CommandSpec {
    pub(crate) fn new(program: Utf8PathBuf, label: impl Into<String>) -> Self {
        Self {
            program,
            args: Vec::new(),
            label: label.into(),
            timeout: None,
        }
    }

    #[must_use]
    pub(crate) fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kills the child when it runs longer than `timeout`.
    #[must_use]
    pub(crate) const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn program(&self) -> &Utf8Path {
        &self.program
    }

    pub(crate) fn args_slice(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn command_line(&self) -> String {
        command_line(self.program.as_str(), &self.args)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Runs `spec` to completion.
///
/// # Errors
/// Returns an [`EmbedErrorKind::ProcessFailed`] error when the program cannot
/// be spawned, exceeds its timeout, or exits unsuccessfully. The error names
/// the full command line and carries the captured output, truncated.
pub(crate) fn run(spec: &CommandSpec) -> EmbedResult<CapturedOutput> {
    let span = info_span!(target: PROCESS_TARGET, "command", label = spec.label());
    let _entered = span.enter();
    let line = spec.command_line();
    debug!(target: PROCESS_TARGET, command = %line, "launching command");

    let mut child = Command::new(spec.program.as_std_path())
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn `{line}`"))
        .map_err(EmbedError::with_kind(EmbedErrorKind::ProcessFailed))?;

    let receiver = attach_readers(&mut child, spec.label())?;
    let waited = wait_for_exit(&mut child, spec.timeout);
    let output = drain(&receiver, Instant::now() + DRAIN_GRACE);

    match waited {
        Ok(Some(status)) if status.success() => {
            debug!(target: PROCESS_TARGET, command = %line, "command completed");
            Ok(output)
        }
        Ok(Some(status)) => Err(EmbedError::new(
            EmbedErrorKind::ProcessFailed,
            render_failure(&line, status, &output),
        )),
        Ok(None) => {
            let secs = spec.timeout.map_or(0, |timeout| timeout.as_secs());
            warn!(target: PROCESS_TARGET, command = %line, timeout_secs = secs, "command timed out");
            Err(EmbedError::new(
                EmbedErrorKind::ProcessFailed,
                render_timeout(&line, secs, &output),
            ))
        }
        Err(err) => Err(EmbedError::new(
            EmbedErrorKind::ProcessFailed,
            err.wrap_err(format!("failed to wait for `{line}`")),
        )),
    }
}

fn attach_readers(child: &mut Child, label: &str) -> EmbedResult<Receiver<(Stream, String)>> {
    let (sender, receiver) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(label, Stream::Stdout, stdout, sender.clone())?;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(label, Stream::Stderr, stderr, sender)?;
    }
    Ok(receiver)
}

fn spawn_reader(
    label: &str,
    stream: Stream,
    source: impl Read + Send + 'static,
    sender: Sender<(Stream, String)>,
) -> EmbedResult<()> {
    let command = label.to_owned();
    thread::Builder::new()
        .name(format!("{label}-{stream:?}").to_lowercase().replace(' ', "-"))
        .spawn(move || forward_lines(&command, stream, source, &sender))
        .context("failed to spawn output reader thread")
        .map_err(EmbedError::with_kind(EmbedErrorKind::ProcessFailed))?;
    Ok(())
}

fn forward_lines(command: &str, stream: Stream, source: impl Read, sender: &Sender<(Stream, String)>) {
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(target: PROCESS_TARGET, command, error = %err, "output reader stopped");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf).trim_end().to_owned();
        match stream {
            Stream::Stdout => info!(target: PROCESS_TARGET, command, "{line}"),
            Stream::Stderr => warn!(target: PROCESS_TARGET, command, "{line}"),
        }
        // The receiver is gone once collection has finished; keep draining
        // so the writer never blocks.
        drop(sender.send((stream, line)));
    }
}

/// Waits for the child, returning `None` when it was killed after exceeding
/// `timeout`.
fn wait_for_exit(
    child: &mut Child,
    timeout: Option<Duration>,
) -> color_eyre::Result<Option<ExitStatus>> {
    let Some(limit) = timeout else {
        return Ok(Some(child.wait()?));
    };
    if let Some(status) = child.wait_timeout(limit)? {
        return Ok(Some(status));
    }
    match child.kill() {
        Ok(()) => {}
        // `InvalidInput` indicates the child has already exited; ignore it.
        Err(err) if err.kind() == ErrorKind::InvalidInput => {}
        Err(err) => return Err(eyre!(err).wrap_err("failed to terminate timed-out command")),
    }
    child.wait()?;
    Ok(None)
}

fn drain(receiver: &Receiver<(Stream, String)>, deadline: Instant) -> CapturedOutput {
    let mut output = CapturedOutput::default();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok((Stream::Stdout, line)) => output.stdout.push(line),
            Ok((Stream::Stderr, line)) => output.stderr.push(line),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
        }
    }
    output
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandSpec {
        CommandSpec::new(Utf8PathBuf::from("/bin/sh"), "sh").args(["-c", script])
    }

    #[test]
    fn captures_both_streams() {
        let output = run(&shell("echo hello; echo oops >&2")).expect("command succeeds");

        assert_eq!(output.stdout, vec!["hello"]);
        assert_eq!(output.stderr, vec!["oops"]);
    }

    #[test]
    fn nonzero_exit_reports_command_line_and_stderr() {
        let err = run(&shell("echo broken >&2; exit 3")).expect_err("exit 3 fails");

        assert_eq!(err.kind(), EmbedErrorKind::ProcessFailed);
        let message = err.to_string();
        assert!(message.contains("/bin/sh -c"), "{message}");
        assert!(message.contains("stderr: broken"), "{message}");
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let spec = CommandSpec::new(Utf8PathBuf::from("/nonexistent/pg_ctl"), "pg_ctl");
        let err = run(&spec).expect_err("spawn fails");

        assert_eq!(err.kind(), EmbedErrorKind::ProcessFailed);
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn timeout_kills_the_child() {
        let spec = shell("sleep 10").timeout(Duration::from_millis(100));
        let started = Instant::now();

        let err = run(&spec).expect_err("timeout fails");

        assert_eq!(err.kind(), EmbedErrorKind::ProcessFailed);
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn large_output_does_not_stall_the_child() {
        let script = "i=0; while [ $i -lt 3000 ]; do echo line $i; echo err $i >&2; i=$((i+1)); done";
        let output = run(&shell(script)).expect("command succeeds");

        assert_eq!(output.stdout.len(), 3000);
        assert_eq!(output.stderr.len(), 3000);
    }

    #[test]
    fn detached_grandchild_does_not_block_return() {
        let started = Instant::now();
        let output = run(&shell("sleep 5 & echo launched")).expect("command succeeds");

        assert_eq!(output.stdout, vec!["launched"]);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
