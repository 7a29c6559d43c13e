//! Lifecycle management for one embedded engine instance.
//!
//! An [`EmbeddedServer`] prepares the engine binaries when it is built, then
//! drives `NotStarted → Starting → Running → Stopped`. Starting initialises
//! the data directory on first use, takes the data-directory lock, launches
//! the engine through `pg_ctl`, and blocks until a readiness probe succeeds.
//! Closing is best-effort: stop failures are logged, and the lock is always
//! released.

mod commands;
mod config;
mod handle;
mod readiness;
mod shutdown_hook;
mod state;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

pub use self::config::{ServerConfig, ServerConfigBuilder};
pub use self::handle::ServerHandle;
pub use self::readiness::{ProbeError, verify_ready};
pub use self::state::ServerState;
use crate::cache::BinaryPreparer;
use crate::cleanup_helpers::{RemovalOutcome, try_remove_dir_all};
use crate::error::{EmbedError, EmbedErrorKind, EmbedResult};
use crate::fs::ensure_dir_exists;
use crate::lock::{FileLock, LOCK_FILE_NAME};
use crate::observability::SERVER_TARGET;
use crate::process;
use crate::resolver::{BinaryResolver, BundledBinaryResolver};

/// Mutable lifecycle data guarded by one mutex.
#[derive(Debug)]
struct Lifecycle {
    state: ServerState,
    data_lock: Option<FileLock>,
    hook: Option<u64>,
}

/// One throwaway engine instance bound to a data directory and port.
///
/// The instance is `Send + Sync`; only one caller wins `start`, and every
/// other `start` fails immediately with [`EmbedErrorKind::AlreadyStarted`].
/// Dropping a started instance closes it.
///
/// # Examples
/// ```no_run
/// use pg_embed_local::{EmbeddedServer, ServerConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfig::builder()
///     .data_dir("/tmp/epg-example")
///     .clean_after_stop(true)
///     .build()?;
/// let server = EmbeddedServer::new(config)?;
/// let handle = server.start()?;
/// println!("{}", handle.database_url());
/// server.close();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EmbeddedServer {
    id: String,
    config: ServerConfig,
    engine_dir: Utf8PathBuf,
    lifecycle: Mutex<Lifecycle>,
}

/// Chooses the resolver and preparer used to obtain engine binaries.
pub struct EmbeddedServerBuilder {
    config: ServerConfig,
    resolver: Option<Arc<dyn BinaryResolver>>,
    preparer: Option<Arc<BinaryPreparer>>,
}

impl EmbeddedServerBuilder {
    /// Uses `resolver` instead of the bundled-resource resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: impl BinaryResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Uses `preparer` instead of [`BinaryPreparer::process_shared`].
    #[must_use]
    pub fn preparer(mut self, preparer: Arc<BinaryPreparer>) -> Self {
        self.preparer = Some(preparer);
        self
    }

    /// Prepares the engine binaries and returns a `NotStarted` server.
    ///
    /// # Errors
    /// Propagates [`BinaryPreparer::prepare`] failures.
    pub fn build(self) -> EmbedResult<EmbeddedServer> {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(BundledBinaryResolver::from_env()));
        let preparer = self.preparer.unwrap_or_else(BinaryPreparer::process_shared);
        let engine_dir = preparer.prepare(resolver.as_ref(), self.config.working_dir())?;
        let id = Uuid::new_v4().to_string();
        info!(
            target: SERVER_TARGET,
            id = %id,
            engine_dir = %engine_dir,
            port = self.config.port(),
            "embedded server created"
        );
        Ok(EmbeddedServer {
            id,
            config: self.config,
            engine_dir,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::NotStarted,
                data_lock: None,
                hook: None,
            }),
        })
    }
}

impl EmbeddedServer {
    /// Creates a server using the bundled resolver and the process-wide
    /// preparer.
    ///
    /// # Errors
    /// Propagates [`BinaryPreparer::prepare`] failures.
    pub fn new(config: ServerConfig) -> EmbedResult<Self> {
        Self::builder(config).build()
    }

    /// Starts building a server with custom binary sourcing.
    #[must_use]
    pub fn builder(config: ServerConfig) -> EmbeddedServerBuilder {
        EmbeddedServerBuilder {
            config,
            resolver: None,
            preparer: None,
        }
    }

    /// Returns the identity token used in log records.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.lifecycle().state
    }

    /// Returns the configuration this server was built with.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the engine's TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.config.port()
    }

    /// Returns the extraction directory holding the engine binaries.
    #[must_use]
    pub fn engine_dir(&self) -> &Utf8Path {
        &self.engine_dir
    }

    /// Starts the engine and waits until it accepts connections.
    ///
    /// # Errors
    /// See [`EmbeddedServer::start_with`].
    pub fn start(&self) -> EmbedResult<ServerHandle> {
        self.start_with(&BTreeMap::new())
    }

    /// Starts the engine, applying `properties` to the readiness probe
    /// connection.
    ///
    /// A failed start leaves the instance in [`ServerState::Starting`];
    /// [`EmbeddedServer::close`] still releases everything it acquired. A
    /// `close` from another thread waits while the engine is being launched
    /// and makes this call fail with [`EmbedErrorKind::Closed`].
    ///
    /// # Errors
    /// - [`EmbedErrorKind::AlreadyStarted`] or [`EmbedErrorKind::Closed`]
    ///   when the instance is not `NotStarted`, or [`EmbedErrorKind::Closed`]
    ///   when it was closed before the start completed.
    /// - [`EmbedErrorKind::LockContention`] when another instance holds the
    ///   data directory.
    /// - [`EmbedErrorKind::ProcessFailed`] when `initdb` or `pg_ctl start`
    ///   fails.
    /// - [`EmbedErrorKind::ReadinessTimeout`] when the engine does not
    ///   answer within the startup timeout.
    pub fn start_with(&self, properties: &BTreeMap<String, String>) -> EmbedResult<ServerHandle> {
        self.lifecycle().state.begin_start()?;
        let span = info_span!(target: SERVER_TARGET, "start", id = %self.id, port = self.port());
        let _entered = span.enter();
        let started = Instant::now();

        self.clean_before_start()?;
        self.initialise_if_needed()?;
        self.launch()?;

        readiness::wait_until_ready(
            self.port(),
            self.config.startup_timeout(),
            readiness::PROBE_INTERVAL,
            || verify_ready(self.port(), commands::SUPERUSER, commands::MAINTENANCE_DB, properties),
        )?;
        self.lifecycle().state.finish_start()?;
        info!(
            target: SERVER_TARGET,
            id = %self.id,
            elapsed_ms = started.elapsed().as_millis(),
            "postmaster startup finished"
        );
        Ok(ServerHandle::new(&self.config, &self.engine_dir))
    }

    /// Stops the engine and releases the data directory.
    ///
    /// Idempotent: closing a stopped instance only logs a warning. Closing an
    /// instance that was never started marks it stopped without running
    /// `pg_ctl`. An instance that never acquired the data-directory lock
    /// leaves the directory and any engine running in it untouched. Stop
    /// failures are logged; the lock is released and the post-stop cleanup
    /// runs regardless.
    pub fn close(&self) {
        let (data_lock, hook) = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                ServerState::Stopped => {
                    warn!(target: SERVER_TARGET, id = %self.id, "server already stopped");
                    return;
                }
                ServerState::NotStarted => {
                    lifecycle.state = ServerState::Stopped;
                    info!(target: SERVER_TARGET, id = %self.id, "closed before start");
                    return;
                }
                ServerState::Starting | ServerState::Running => {}
            }
            lifecycle.state = ServerState::Stopped;
            (lifecycle.data_lock.take(), lifecycle.hook.take())
        };
        if let Some(id) = hook {
            shutdown_hook::deregister(id);
        }
        let Some(data_lock) = data_lock else {
            info!(
                target: SERVER_TARGET,
                id = %self.id,
                path = %self.config.data_dir(),
                "closed without owning the data directory; leaving it untouched"
            );
            return;
        };

        let started = Instant::now();
        match process::run(&self.stop_command()) {
            Ok(_) => info!(
                target: SERVER_TARGET,
                id = %self.id,
                elapsed_ms = started.elapsed().as_millis(),
                "postmaster stopped"
            ),
            Err(err) => error!(
                target: SERVER_TARGET,
                id = %self.id,
                error = %err,
                "could not stop postmaster"
            ),
        }
        data_lock.release();
        if self.config.clean_after_stop() {
            self.remove_data_dir("after stop");
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_command(&self) -> process::CommandSpec {
        commands::stop(&self.engine_dir, self.config.data_dir())
    }

    /// Locks the data directory and launches the engine while holding the
    /// lifecycle mutex, so a concurrent `close` either prevents the launch
    /// or observes the lock and stops what was launched.
    fn launch(&self) -> EmbedResult<()> {
        let mut lifecycle = self.lifecycle();
        lifecycle.state.ensure_starting()?;
        lifecycle.data_lock = Some(self.lock_data_dir()?);

        process::run(&commands::start(
            &self.engine_dir,
            self.config.data_dir(),
            self.port(),
            self.config.parameters(),
        ))?;
        info!(
            target: SERVER_TARGET,
            id = %self.id,
            port = self.port(),
            timeout_ms = self.config.startup_timeout().as_millis(),
            "postmaster launched; waiting for startup to finish"
        );
        if self.config.shutdown_hook() {
            lifecycle.hook = Some(shutdown_hook::register(self.stop_command())?);
        }
        Ok(())
    }

    fn clean_before_start(&self) -> EmbedResult<()> {
        if !self.config.clean_before_start() {
            info!(
                target: SERVER_TARGET,
                path = %self.config.data_dir(),
                "did not clean up data directory"
            );
            return Ok(());
        }
        try_remove_dir_all(self.config.data_dir().as_std_path())
            .with_context(|| format!("could not clean up directory {}", self.config.data_dir()))?;
        ensure_dir_exists(self.config.data_dir())?;
        Ok(())
    }

    fn initialise_if_needed(&self) -> EmbedResult<()> {
        let data_dir = self.config.data_dir();
        if data_dir.join(commands::INIT_MARKER).exists() {
            info!(target: SERVER_TARGET, path = %data_dir, "data directory already initialised");
            return Ok(());
        }
        let started = Instant::now();
        process::run(&commands::initdb(
            &self.engine_dir,
            data_dir,
            self.config.locale(),
        ))?;
        info!(
            target: SERVER_TARGET,
            id = %self.id,
            path = %data_dir,
            elapsed_ms = started.elapsed().as_millis(),
            "initdb completed"
        );
        Ok(())
    }

    fn lock_data_dir(&self) -> EmbedResult<FileLock> {
        let data_dir = self.config.data_dir();
        ensure_dir_exists(data_dir)?;
        let lock_path = data_dir.join(LOCK_FILE_NAME);
        let acquired = FileLock::try_acquire(&lock_path)
            .with_context(|| format!("failed to open data directory lock {lock_path}"))
            .map_err(EmbedError::with_kind(EmbedErrorKind::Other))?;
        acquired.ok_or_else(|| {
            EmbedError::new(
                EmbedErrorKind::LockContention,
                eyre!("could not lock {lock_path}: another instance is using {data_dir}"),
            )
        })
    }

    fn remove_data_dir(&self, phase: &str) {
        let data_dir = self.config.data_dir();
        match try_remove_dir_all(data_dir.as_std_path()) {
            Ok(RemovalOutcome::Removed) => {
                info!(target: SERVER_TARGET, path = %data_dir, phase, "removed data directory");
            }
            Ok(RemovalOutcome::Missing) => {}
            Err(err) => warn!(
                target: SERVER_TARGET,
                path = %data_dir,
                phase,
                error = %err,
                "could not clean up data directory"
            ),
        }
    }
}

impl Drop for EmbeddedServer {
    fn drop(&mut self) {
        if self.lifecycle().state.was_launched() {
            self.close();
        }
    }
}
