//! Readiness probing for a freshly launched engine.
//!
//! A probe is a short TCP connect to the port followed by `SELECT 1`, which
//! must return exactly one row holding `1`. The wait loop repeats the probe
//! until it succeeds or the startup timeout elapses.

use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use color_eyre::Report;
use thiserror::Error;
use tracing::{debug, trace};

use super::handle::connection_config;
use crate::error::{EmbedError, EmbedErrorKind, EmbedResult};
use crate::observability::SERVER_TARGET;

/// Bound on each TCP connect and engine handshake.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Delay between probes.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Why a readiness probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Nothing accepted the TCP connection.
    #[error("could not connect to port {port}: {source}")]
    Connect {
        /// Port that was probed.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
    /// The engine refused the session or the query failed.
    #[error("readiness query failed: {0}")]
    Query(#[from] postgres::Error),
    /// `SELECT 1` returned other than one row.
    #[error("readiness query returned {0} rows, expected 1")]
    UnexpectedRowCount(usize),
    /// `SELECT 1` returned a value other than 1.
    #[error("readiness query returned {0}, expected 1")]
    UnexpectedValue(i32),
}

/// Runs one probe against the engine on `port`.
///
/// `properties` are applied to the probe connection the same way
/// [`ServerHandle::connect_as`](crate::ServerHandle::connect_as) applies
/// them.
///
/// # Errors
/// Returns the [`ProbeError`] describing the first step that failed.
pub fn verify_ready(
    port: u16,
    user: &str,
    database: &str,
    properties: &BTreeMap<String, String>,
) -> Result<(), ProbeError> {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let socket = TcpStream::connect_timeout(&address, PROBE_CONNECT_TIMEOUT)
        .map_err(|source| ProbeError::Connect { port, source })?;
    drop(socket);

    let mut config = connection_config(port, user, database, None, properties);
    config.connect_timeout(PROBE_CONNECT_TIMEOUT);
    let mut client = config.connect(postgres::NoTls)?;
    let rows = client.query("SELECT 1", &[])?;
    let [row] = rows.as_slice() else {
        return Err(ProbeError::UnexpectedRowCount(rows.len()));
    };
    let value: i32 = row.try_get(0)?;
    if value != 1 {
        return Err(ProbeError::UnexpectedValue(value));
    }
    client.close()?;
    Ok(())
}

/// Repeats `probe` every `interval` until it succeeds or `timeout` elapses.
///
/// # Errors
/// Returns an [`EmbedErrorKind::ReadinessTimeout`] error whose source is the
/// last [`ProbeError`] observed.
pub(crate) fn wait_until_ready(
    port: u16,
    timeout: Duration,
    interval: Duration,
    mut probe: impl FnMut() -> Result<(), ProbeError>,
) -> EmbedResult<Duration> {
    let started = Instant::now();
    let mut attempts = 0_u32;
    loop {
        attempts += 1;
        let last = match probe() {
            Ok(()) => {
                debug!(target: SERVER_TARGET, port, attempts, "readiness probe succeeded");
                return Ok(started.elapsed());
            }
            Err(err) => err,
        };
        trace!(target: SERVER_TARGET, port, error = %last, "engine not ready yet");
        if started.elapsed() >= timeout {
            let report = Report::new(last).wrap_err(format!(
                "engine on port {port} did not accept connections within {timeout:?} ({attempts} probes)"
            ));
            return Err(EmbedError::new(EmbedErrorKind::ReadinessTimeout, report));
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::detect_port;

    #[test]
    fn probe_against_closed_port_is_a_connect_error() {
        let port = detect_port().expect("ephemeral port");
        let err = verify_ready(port, "postgres", "postgres", &BTreeMap::new())
            .expect_err("nothing listens");
        assert!(matches!(err, ProbeError::Connect { port: p, .. } if p == port));
    }

    #[test]
    fn wait_returns_once_probe_succeeds() {
        let mut remaining_failures = 3;
        let waited = wait_until_ready(1, Duration::from_secs(5), Duration::from_millis(1), || {
            if remaining_failures == 0 {
                return Ok(());
            }
            remaining_failures -= 1;
            Err(ProbeError::UnexpectedRowCount(0))
        })
        .expect("probe eventually succeeds");

        assert_eq!(remaining_failures, 0);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn timeout_wraps_last_probe_error() {
        let mut value = 40;
        let err = wait_until_ready(7, Duration::from_millis(30), Duration::from_millis(5), || {
            value += 1;
            Err(ProbeError::UnexpectedValue(value))
        })
        .expect_err("probe never succeeds");

        assert_eq!(err.kind(), EmbedErrorKind::ReadinessTimeout);
        let source = err
            .report()
            .downcast_ref::<ProbeError>()
            .expect("probe error in chain");
        assert!(matches!(source, ProbeError::UnexpectedValue(v) if *v == value));
        assert!(err.to_string().contains("port 7"));
    }
}
