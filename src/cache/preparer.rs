//! Prepares engine binaries exactly once per process and per machine.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tracing::{debug, info, info_span, warn};

use super::archive::EngineArchive;
use super::config::resolve_working_dir;
use super::extract::extract_archive;
use crate::error::{EmbedError, EmbedErrorKind, EmbedResult};
use crate::fs::ensure_dir_exists;
use crate::lock::{FileLock, LOCK_FILE_NAME};
use crate::observability::CACHE_TARGET;
use crate::platform::Platform;
use crate::resolver::BinaryResolver;

/// Marker file written once an extraction directory is fully populated.
pub(crate) const EXISTS_MARKER: &str = ".exists";

const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_WAIT_ATTEMPTS: u32 = 60;

/// (resolver identity, cache root)
type PreparedKey = (String, Utf8PathBuf);

static SHARED: OnceLock<Arc<BinaryPreparer>> = OnceLock::new();

/// Bound on how long to wait for another process to finish unpacking.
#[derive(Debug, Clone, Copy)]
struct UnpackWait {
    interval: Duration,
    attempts: u32,
}

impl UnpackWait {
    fn total(self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }
}

/// Unpacks engine archives into a content-addressed cache.
///
/// A preparer owns the in-memory record of directories it has already
/// prepared, keyed by resolver identity and cache root. The record is
/// guarded by one mutex held across the whole lookup-or-populate sequence,
/// so concurrent servers in one process never race on it. Separate
/// processes coordinate through a lock file and an `.exists` marker inside
/// each extraction directory.
///
/// Most callers share [`BinaryPreparer::process_shared`], which lives for the
/// rest of the process.
///
/// # Examples
///
/// ```no_run
/// use pg_embed_local::{BinaryPreparer, BundledBinaryResolver};
///
/// let preparer = BinaryPreparer::process_shared();
/// let engine_dir = preparer.prepare(&BundledBinaryResolver::from_env(), None)?;
/// assert!(engine_dir.join("bin").exists());
/// # Ok::<(), pg_embed_local::EmbedError>(())
/// ```
#[derive(Debug)]
pub struct BinaryPreparer {
    prepared: Mutex<HashMap<PreparedKey, Utf8PathBuf>>,
    platform: Option<Platform>,
    wait: UnpackWait,
}

impl Default for BinaryPreparer {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryPreparer {
    /// Creates a preparer with an empty in-memory record.
    #[must_use]
    pub fn new() -> Self {
        Self {
            prepared: Mutex::new(HashMap::new()),
            platform: None,
            wait: UnpackWait {
                interval: DEFAULT_WAIT_INTERVAL,
                attempts: DEFAULT_WAIT_ATTEMPTS,
            },
        }
    }

    /// Returns the preparer shared by every server in this process.
    #[must_use]
    pub fn process_shared() -> Arc<Self> {
        Arc::clone(SHARED.get_or_init(|| Arc::new(Self::new())))
    }

    /// Resolves archives for `platform` instead of the detected host.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Overrides how often and how many times to poll for another
    /// process's `.exists` marker before giving up.
    #[must_use]
    pub const fn with_unpack_wait(mut self, interval: Duration, attempts: u32) -> Self {
        self.wait = UnpackWait { interval, attempts };
        self
    }

    /// Guarantees the archive served by `resolver` is unpacked beneath the
    /// cache root and returns its extraction directory.
    ///
    /// `working_dir` overrides the cache root; otherwise
    /// [`resolve_working_dir`](crate::resolve_working_dir) supplies it.
    ///
    /// # Errors
    /// - [`EmbedErrorKind::Resolution`] when the resolver fails or has no
    ///   archive for the platform.
    /// - [`EmbedErrorKind::Extraction`] when reading, digesting, or unpacking
    ///   the archive fails. Failures are not recorded, so a later call
    ///   retries.
    /// - [`EmbedErrorKind::LockContention`] when another process holds the
    ///   unpack lock for longer than the wait bound.
    pub fn prepare(
        &self,
        resolver: &dyn BinaryResolver,
        working_dir: Option<&Utf8Path>,
    ) -> EmbedResult<Utf8PathBuf> {
        let mut prepared = self
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let root = working_dir.map_or_else(resolve_working_dir, Utf8Path::to_path_buf);
        let key = (resolver.identity(), root);
        if let Some(dir) = prepared.get(&key) {
            debug!(target: CACHE_TARGET, identity = %key.0, path = %dir, "engine already prepared");
            return Ok(dir.clone());
        }

        let span = info_span!(target: CACHE_TARGET, "prepare", identity = %key.0, root = %key.1);
        let _entered = span.enter();
        let started = Instant::now();

        let platform = match &self.platform {
            Some(platform) => platform.clone(),
            None => Platform::detect()?,
        };
        let stream = resolver
            .resolve(platform.os().as_str(), platform.arch())
            .with_context(|| format!("binary resolver failed for {platform}"))
            .map_err(EmbedError::with_kind(EmbedErrorKind::Resolution))?
            .ok_or_else(|| {
                EmbedError::new(
                    EmbedErrorKind::Resolution,
                    eyre!("no engine binary is available for {platform}"),
                )
            })?;
        let archive = EngineArchive::read_from(stream)
            .context("failed to read engine archive")
            .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?;

        let dir = key.1.join(archive.directory_name());
        ensure_dir_exists(&dir)
            .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?;
        self.unpack_once(&archive, &dir)?;

        info!(
            target: CACHE_TARGET,
            path = %dir,
            digest = archive.digest(),
            elapsed_ms = started.elapsed().as_millis(),
            "engine binaries ready"
        );
        prepared.insert(key, dir.clone());
        Ok(dir)
    }

    /// Runs the lock-or-wait protocol for one extraction directory.
    fn unpack_once(&self, archive: &EngineArchive, dir: &Utf8Path) -> EmbedResult<()> {
        let marker = dir.join(EXISTS_MARKER);
        if marker.exists() {
            debug!(target: CACHE_TARGET, path = %dir, "extraction directory already complete");
            return Ok(());
        }

        let lock_path = dir.join(LOCK_FILE_NAME);
        let acquired = FileLock::try_acquire(&lock_path)
            .with_context(|| format!("failed to open unpack lock {lock_path}"))
            .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?;
        match acquired {
            Some(lock) => {
                let result = unpack_locked(archive, dir, &marker);
                lock.release();
                result
            }
            None => self.wait_for_marker(dir, &marker),
        }
    }

    fn wait_for_marker(&self, dir: &Utf8Path, marker: &Utf8Path) -> EmbedResult<()> {
        info!(
            target: CACHE_TARGET,
            path = %dir,
            "another process is unpacking engine binaries; waiting"
        );
        for _ in 0..self.wait.attempts {
            thread::sleep(self.wait.interval);
            if marker.exists() {
                return Ok(());
            }
        }
        Err(EmbedError::new(
            EmbedErrorKind::LockContention,
            eyre!(
                "timed out after {:?} waiting for another process to unpack {dir}",
                self.wait.total()
            ),
        ))
    }
}

fn unpack_locked(archive: &EngineArchive, dir: &Utf8Path, marker: &Utf8Path) -> EmbedResult<()> {
    if marker.exists() {
        warn!(
            target: CACHE_TARGET,
            path = %dir,
            "extraction directory completed by another process while acquiring the lock"
        );
        return Ok(());
    }

    let summary = extract_archive(archive.bytes(), dir)?;
    match OpenOptions::new().write(true).create_new(true).open(marker) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(EmbedError::new(
                EmbedErrorKind::Extraction,
                eyre!(err).wrap_err(format!("failed to write completion marker {marker}")),
            ));
        }
    }
    debug!(
        target: CACHE_TARGET,
        path = %dir,
        files = summary.files,
        "extraction completed"
    );
    Ok(())
}
