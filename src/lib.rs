//! Provisions and supervises a throwaway local PostgreSQL engine.
//!
//! The library obtains platform-specific engine binaries from a pluggable
//! [`BinaryResolver`], unpacks each distinct archive exactly once into a
//! content-addressed cache shared by every process on the machine, and
//! drives an [`EmbeddedServer`] through `initdb`, `pg_ctl start`, a readiness
//! wait, and `pg_ctl stop`.
//!
//! # Examples
//! ```no_run
//! use pg_embed_local::{EmbeddedServer, ServerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::builder().port(0).clean_after_stop(true).build()?;
//! let server = EmbeddedServer::new(config)?;
//! let handle = server.start()?;
//! let mut client = handle.connect()?;
//! client.batch_execute("CREATE TABLE t (id int)")?;
//! server.close();
//! # Ok(())
//! # }
//! ```

mod cache;
mod cleanup_helpers;
mod error;
mod fs;
mod lock;
mod observability;
mod platform;
mod process;
mod resolver;
mod server;
#[doc(hidden)]
pub mod test_support;

pub use cache::{BinaryPreparer, WORKING_DIR_ENV, resolve_working_dir};
pub use error::{ConfigError, ConfigResult, EmbedError, EmbedErrorKind, EmbedResult};
pub use platform::{OsFamily, Platform, detect_port};
pub use resolver::{
    ArchiveFileResolver, ArchiveStream, BUNDLE_DIR_ENV, BinaryResolver, BundledBinaryResolver,
    InMemoryBinaryResolver,
};
pub use server::{
    EmbeddedServer, EmbeddedServerBuilder, ProbeError, ServerConfig, ServerConfigBuilder,
    ServerHandle, ServerState, verify_ready,
};

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

/// Captures server settings supplied via `EPG_*` environment variables.
///
/// Every field is optional; unset fields keep the [`ServerConfigBuilder`]
/// defaults.
///
/// # Examples
/// ```
/// use pg_embed_local::EmbeddedPgCfg;
///
/// let cfg = EmbeddedPgCfg::default();
/// assert!(cfg.port.is_none());
/// assert!(!cfg.skip_requested());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, OrthoConfig, Default)]
#[ortho_config(prefix = "EPG")]
pub struct EmbeddedPgCfg {
    /// Port for the engine; `0` selects a free ephemeral port.
    pub port: Option<u16>,
    /// Storage directory for the engine's data files.
    pub data_dir: Option<Utf8PathBuf>,
    /// Root of the shared binary cache.
    pub working_dir: Option<Utf8PathBuf>,
    /// Resource directory holding bundled engine archives.
    pub bundle_dir: Option<Utf8PathBuf>,
    /// Seconds to wait for the engine to accept connections.
    pub startup_timeout_secs: Option<u64>,
    /// Wipe the data directory before starting.
    pub clean_before_start: Option<bool>,
    /// Remove the data directory after stopping.
    pub clean_after_stop: Option<bool>,
    /// Keep directories regardless of the cleanup flags.
    pub no_cleanup: Option<bool>,
    /// Database name exposed to clients.
    pub database: Option<String>,
    /// User name exposed to clients.
    pub user: Option<String>,
    /// Password exposed to clients.
    pub password: Option<String>,
    /// Schema exposed to clients.
    pub schema: Option<String>,
    /// `initdb` locale, for example `C` or `en_US.UTF-8`.
    pub locale: Option<String>,
    /// Skip provisioning entirely.
    pub skip: Option<bool>,
    /// Stop the engine from a process-exit hook.
    pub shutdown_hook: Option<bool>,
}

impl EmbeddedPgCfg {
    /// Loads configuration from environment variables without parsing CLI
    /// arguments.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when a variable cannot be parsed.
    pub fn load() -> ConfigResult<Self> {
        let args = [OsString::from("pg-embed-local")];
        Self::load_from_iter(args).map_err(|err| ConfigError::from(eyre!(err)))
    }

    /// Whether the caller asked to skip provisioning.
    #[must_use]
    pub fn skip_requested(&self) -> bool {
        self.skip.unwrap_or(false)
    }

    /// Returns the resolver for the configured bundle directory, falling
    /// back to [`BundledBinaryResolver::from_env`].
    #[must_use]
    pub fn resolver(&self) -> BundledBinaryResolver {
        self.bundle_dir
            .as_ref()
            .map_or_else(BundledBinaryResolver::from_env, |dir| {
                BundledBinaryResolver::new(dir.clone())
            })
    }

    /// Converts the configuration into a builder so callers can layer
    /// further settings on top.
    #[must_use]
    pub fn to_builder(&self) -> ServerConfigBuilder {
        let builder = ServerConfig::builder();
        let builder = self.apply_network(builder);
        let builder = self.apply_paths(builder);
        let builder = self.apply_cleanup(builder);
        let builder = self.apply_identity(builder);
        self.apply_locale(builder)
    }

    /// Converts the configuration into a validated [`ServerConfig`].
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when [`ServerConfigBuilder::build`] rejects
    /// the values.
    pub fn to_server_config(&self) -> ConfigResult<ServerConfig> {
        self.to_builder().build()
    }

    fn apply_network(&self, mut builder: ServerConfigBuilder) -> ServerConfigBuilder {
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(secs) = self.startup_timeout_secs {
            builder = builder.startup_timeout(Duration::from_secs(secs));
        }
        if let Some(enabled) = self.shutdown_hook {
            builder = builder.shutdown_hook(enabled);
        }
        builder
    }

    fn apply_paths(&self, mut builder: ServerConfigBuilder) -> ServerConfigBuilder {
        if let Some(ref dir) = self.data_dir {
            builder = builder.data_dir(dir.clone());
        }
        if let Some(ref dir) = self.working_dir {
            builder = builder.working_dir(dir.clone());
        }
        builder
    }

    fn apply_cleanup(&self, mut builder: ServerConfigBuilder) -> ServerConfigBuilder {
        if let Some(enabled) = self.clean_before_start {
            builder = builder.clean_before_start(enabled);
        }
        if let Some(enabled) = self.clean_after_stop {
            builder = builder.clean_after_stop(enabled);
        }
        if let Some(enabled) = self.no_cleanup {
            builder = builder.no_cleanup(enabled);
        }
        builder
    }

    fn apply_identity(&self, mut builder: ServerConfigBuilder) -> ServerConfigBuilder {
        if let Some(ref database) = self.database {
            builder = builder.database(database.clone());
        }
        if let Some(ref user) = self.user {
            builder = builder.user(user.clone());
        }
        if let Some(ref password) = self.password {
            builder = builder.password(password.clone());
        }
        if let Some(ref schema) = self.schema {
            builder = builder.schema(schema.clone());
        }
        builder
    }

    fn apply_locale(&self, mut builder: ServerConfigBuilder) -> ServerConfigBuilder {
        if let Some(ref locale) = self.locale {
            builder = builder.locale("locale", locale.clone());
        }
        builder
    }
}
