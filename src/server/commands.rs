//! Command lines for the engine's `initdb` and `pg_ctl` tools.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8Path;

use crate::platform::{binary_path, locale_options, start_options};
use crate::process::CommandSpec;

/// File whose presence marks an initialised data directory.
pub(crate) const INIT_MARKER: &str = "postgresql.conf";

/// Engine server log inside the data directory.
pub(crate) const SERVER_LOG: &str = "postmaster.log";

/// Superuser created by `initdb`.
pub(crate) const SUPERUSER: &str = "postgres";

/// Database created by `initdb` and used by the readiness probe.
pub(crate) const MAINTENANCE_DB: &str = "postgres";

/// Controller-side bound on `pg_ctl stop`.
const STOP_KILL_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn initdb(
    engine_dir: &Utf8Path,
    data_dir: &Utf8Path,
    locale: &BTreeMap<String, String>,
) -> CommandSpec {
    CommandSpec::new(binary_path(engine_dir, "initdb"), "initdb")
        .args(["-A", "trust", "-U", SUPERUSER, "-E", "UTF-8"])
        .args(locale_options(locale))
        .arg("-D")
        .arg(data_dir.as_str())
}

/// `pg_ctl start` with the engine's own log redirected into the data
/// directory, so the daemonised engine does not inherit the controller's
/// pipes.
pub(crate) fn start(
    engine_dir: &Utf8Path,
    data_dir: &Utf8Path,
    port: u16,
    parameters: &BTreeMap<String, String>,
) -> CommandSpec {
    CommandSpec::new(binary_path(engine_dir, "pg_ctl"), "pg_ctl start")
        .args(["start", "-D", data_dir.as_str(), "-l"])
        .arg(data_dir.join(SERVER_LOG).as_str())
        .arg("-o")
        .arg(start_options(port, parameters).join(" "))
}

pub(crate) fn stop(engine_dir: &Utf8Path, data_dir: &Utf8Path) -> CommandSpec {
    CommandSpec::new(binary_path(engine_dir, "pg_ctl"), "pg_ctl stop")
        .args(["stop", "-D", data_dir.as_str(), "-m", "fast", "-t", "5", "-w"])
        .timeout(STOP_KILL_TIMEOUT)
}
