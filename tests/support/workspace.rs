//! Scratch directories and server wiring for tests that drive the fake
//! engine.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Result, eyre};
use pg_embed_local::test_support::{FakeEngine, read_invocations};
use pg_embed_local::{
    BinaryPreparer, EmbeddedServer, InMemoryBinaryResolver, ServerConfig, ServerConfigBuilder,
};
use tempfile::TempDir;

/// Startup timeout short enough that readiness failures end quickly.
pub const FAKE_STARTUP_TIMEOUT: Duration = Duration::from_millis(300);

/// Temporary root holding the invocation log, the data directory, and the
/// binary cache for one test.
pub struct Workspace {
    _temp: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .map_err(|path| eyre!("temporary directory {} is not UTF-8", path.display()))?;
        Ok(Self { _temp: temp, root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn data_dir(&self) -> Utf8PathBuf {
        self.root.join("data")
    }

    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.root.join("cache")
    }

    pub fn engine(&self) -> FakeEngine {
        FakeEngine::new(self.root.join("invocations.log"))
    }

    /// Configuration pointing at this workspace with an auto-selected port.
    pub fn config(&self) -> ServerConfigBuilder {
        ServerConfig::builder()
            .port(0)
            .data_dir(self.data_dir())
            .working_dir(self.cache_dir())
            .startup_timeout(FAKE_STARTUP_TIMEOUT)
    }

    /// Builds a server that unpacks `engine` through a fresh preparer.
    pub fn server(&self, engine: &FakeEngine, config: ServerConfigBuilder) -> Result<EmbeddedServer> {
        let resolver = InMemoryBinaryResolver::new(format!("fake:{}", self.root))
            .with_fallback(engine.archive()?);
        let server = EmbeddedServer::builder(config.build()?)
            .resolver(resolver)
            .preparer(Arc::new(BinaryPreparer::new()))
            .build()?;
        Ok(server)
    }
}

/// Returns the recorded `initdb`/`pg_ctl` calls of `engine`.
pub fn invocations(engine: &FakeEngine) -> Vec<String> {
    read_invocations(engine.log_path())
}
