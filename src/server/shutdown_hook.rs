//! Process-exit hook that stops running engines on `atexit`.
//!
//! Servers started with the shutdown hook enabled add themselves to a
//! process-wide registry and remove themselves on `close`. The first
//! registration installs an `extern "C"` callback via [`libc::atexit`]; when
//! the process exits, the callback runs the recorded stop command for every
//! engine still registered.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use color_eyre::eyre::eyre;
use tracing::debug;

use crate::error::{EmbedError, EmbedErrorKind, EmbedResult};
use crate::observability::SERVER_TARGET;
use crate::process::CommandSpec;

/// Engine still running at exit, as recorded at registration time.
#[derive(Debug, Clone)]
struct HookEntry {
    id: u64,
    stop: CommandSpec,
}

static REGISTRY: Mutex<Vec<HookEntry>> = Mutex::new(Vec::new());

/// Outcome of the one-time `atexit` registration.
static ATEXIT_INSTALLED: OnceLock<bool> = OnceLock::new();

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Registers `stop` to run at process exit and returns the token used to
/// deregister it.
///
/// # Errors
/// Returns an error if `libc::atexit` reports failure (non-zero return).
pub(crate) fn register(stop: CommandSpec) -> EmbedResult<u64> {
    if !*ATEXIT_INSTALLED.get_or_init(install_atexit) {
        return Err(EmbedError::new(
            EmbedErrorKind::Other,
            eyre!("libc::atexit registration failed"),
        ));
    }
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    debug!(target: SERVER_TARGET, id, command = %stop.command_line(), "registered shutdown hook entry");
    registry().push(HookEntry { id, stop });
    Ok(id)
}

/// Removes a registration; unknown tokens are ignored.
pub(crate) fn deregister(id: u64) {
    registry().retain(|entry| entry.id != id);
}

#[cfg(test)]
pub(crate) fn registered_command(id: u64) -> Option<String> {
    registry()
        .iter()
        .find(|entry| entry.id == id)
        .map(|entry| entry.stop.command_line())
}

fn registry() -> std::sync::MutexGuard<'static, Vec<HookEntry>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

fn install_atexit() -> bool {
    // SAFETY: `shutdown_callback` is an `extern "C"` function with no parameters
    // and no return value, matching the signature required by `atexit(3)`.
    // It only touches the `REGISTRY` static, which lives for the whole process.
    let rc = unsafe { libc::atexit(shutdown_callback) };
    if rc == 0 {
        debug!(target: SERVER_TARGET, "registered atexit shutdown hook");
    }
    rc == 0
}

/// Callback invoked by the C runtime during process exit.
extern "C" fn shutdown_callback() {
    let entries = std::mem::take(&mut *registry());
    for entry in entries {
        stop_engine(&entry);
    }
}

/// Best-effort stop; output and failures are discarded because the logging
/// stack may already be torn down.
fn stop_engine(entry: &HookEntry) {
    drop(
        Command::new(entry.stop.program().as_std_path())
            .args(entry.stop.args_slice())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    );
}
