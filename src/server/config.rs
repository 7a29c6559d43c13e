//! Immutable server configuration and its validating builder.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::{ConfigError, ConfigResult};
use crate::platform::detect_port;

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_USER: &str = "postgres";
const DEFAULT_DATABASE: &str = "postgres";
const DEFAULT_SCHEMA: &str = "public";
const SCRATCH_DATA_PREFIX: &str = "embedded-pg-data-";

/// Settings for one embedded engine instance.
///
/// Produced by [`ServerConfigBuilder::build`] and never mutated afterwards.
/// A requested port of `0` has already been replaced by a free ephemeral
/// port, so [`ServerConfig::port`] is the port used both to launch the engine
/// and to probe it.
#[derive(Debug)]
pub struct ServerConfig {
    port: u16,
    data_dir: Utf8PathBuf,
    working_dir: Option<Utf8PathBuf>,
    startup_timeout: Duration,
    parameters: BTreeMap<String, String>,
    locale: BTreeMap<String, String>,
    clean_before_start: bool,
    clean_after_stop: bool,
    no_cleanup: bool,
    shutdown_hook: bool,
    database: String,
    user: String,
    password: SecretString,
    schema: String,
}

impl ServerConfig {
    /// Starts building a configuration.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Returns the engine's TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the storage directory handed to `initdb` and `pg_ctl`.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    /// Returns the binary cache root override, if any.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Utf8Path> {
        self.working_dir.as_deref()
    }

    /// Returns how long `start` waits for the engine to accept connections.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Returns engine parameters passed as `-c key=value` at launch.
    #[must_use]
    pub const fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Returns locale options passed to `initdb`.
    #[must_use]
    pub const fn locale(&self) -> &BTreeMap<String, String> {
        &self.locale
    }

    /// Whether the data directory is wiped before starting.
    #[must_use]
    pub const fn clean_before_start(&self) -> bool {
        self.clean_before_start && !self.no_cleanup
    }

    /// Whether the data directory is removed after stopping.
    #[must_use]
    pub const fn clean_after_stop(&self) -> bool {
        self.clean_after_stop && !self.no_cleanup
    }

    /// Whether a process-exit hook stops the engine on exit.
    #[must_use]
    pub const fn shutdown_hook(&self) -> bool {
        self.shutdown_hook
    }

    /// Returns the database name exposed through the connection handle.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the user name exposed through the connection handle.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the password exposed through the connection handle.
    #[must_use]
    pub const fn password(&self) -> &SecretString {
        &self.password
    }

    /// Returns the schema exposed through the connection handle.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }
}

/// Collects and validates [`ServerConfig`] inputs.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use pg_embed_local::ServerConfig;
///
/// let config = ServerConfig::builder()
///     .port(0)
///     .data_dir("/tmp/epg-doc-example")
///     .startup_timeout(Duration::from_secs(30))
///     .parameter("max_connections", "20")
///     .build()?;
/// assert_ne!(config.port(), 0);
/// # Ok::<(), pg_embed_local::ConfigError>(())
/// ```
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    port: u16,
    data_dir: Option<Utf8PathBuf>,
    working_dir: Option<Utf8PathBuf>,
    startup_timeout: Option<Duration>,
    parameters: BTreeMap<String, String>,
    locale: BTreeMap<String, String>,
    clean_before_start: bool,
    clean_after_stop: bool,
    no_cleanup: bool,
    shutdown_hook: bool,
    database: Option<String>,
    user: Option<String>,
    password: Option<SecretString>,
    schema: Option<String>,
}

impl ServerConfigBuilder {
    /// Sets the TCP port; `0` selects a free ephemeral port at build time.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the storage directory.
    ///
    /// When unset, a unique directory beneath the system temporary directory
    /// is used.
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Overrides the binary cache root.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the readiness bound; defaults to ten seconds.
    #[must_use]
    pub const fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Adds an engine parameter passed as `-c key=value`.
    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Adds an `initdb` locale option, for example `("locale", "C")`.
    #[must_use]
    pub fn locale(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.locale.insert(key.into(), value.into());
        self
    }

    /// Wipes the data directory before starting.
    #[must_use]
    pub const fn clean_before_start(mut self, enabled: bool) -> Self {
        self.clean_before_start = enabled;
        self
    }

    /// Removes the data directory after stopping.
    #[must_use]
    pub const fn clean_after_stop(mut self, enabled: bool) -> Self {
        self.clean_after_stop = enabled;
        self
    }

    /// Disables both cleanup flags, keeping directories for diagnosis.
    #[must_use]
    pub const fn no_cleanup(mut self, enabled: bool) -> Self {
        self.no_cleanup = enabled;
        self
    }

    /// Registers a process-exit hook that stops the engine.
    #[must_use]
    pub const fn shutdown_hook(mut self, enabled: bool) -> Self {
        self.shutdown_hook = enabled;
        self
    }

    /// Sets the database name; defaults to `postgres`.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the user name; defaults to `postgres`.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the password; the engine runs with `trust` authentication, so it
    /// is only carried through to connections.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Sets the schema; defaults to `public`.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Validates the inputs and produces an immutable configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the data directory, user, or database
    /// is blank, the startup timeout is zero, a parameter key is blank or
    /// contains `=`, or no ephemeral port can be bound.
    pub fn build(self) -> ConfigResult<ServerConfig> {
        let data_dir = match self.data_dir {
            Some(dir) if dir.as_str().trim().is_empty() => {
                return Err(ConfigError::from(eyre!("data directory must not be empty")));
            }
            Some(dir) => dir,
            None => scratch_data_dir(),
        };
        let startup_timeout = self.startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT);
        if startup_timeout.is_zero() {
            return Err(ConfigError::from(eyre!("startup timeout must be positive")));
        }
        for key in self.parameters.keys().chain(self.locale.keys()) {
            validate_key(key)?;
        }
        let user = non_blank("user", self.user, DEFAULT_USER)?;
        let database = non_blank("database", self.database, DEFAULT_DATABASE)?;
        let schema = non_blank("schema", self.schema, DEFAULT_SCHEMA)?;
        let port = if self.port == 0 {
            detect_port().context("failed to select an ephemeral port")?
        } else {
            self.port
        };

        Ok(ServerConfig {
            port,
            data_dir,
            working_dir: self.working_dir,
            startup_timeout,
            parameters: self.parameters,
            locale: self.locale,
            clean_before_start: self.clean_before_start,
            clean_after_stop: self.clean_after_stop,
            no_cleanup: self.no_cleanup,
            shutdown_hook: self.shutdown_hook,
            database,
            user,
            password: self
                .password
                .unwrap_or_else(|| SecretString::from(String::new())),
            schema,
        })
    }
}

fn scratch_data_dir() -> Utf8PathBuf {
    let name = format!("{SCRATCH_DATA_PREFIX}{}", Uuid::new_v4().simple());
    Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .map_or_else(|_| Utf8PathBuf::from("/tmp"), |dir| dir)
        .join(name)
}

fn validate_key(key: &str) -> ConfigResult<()> {
    if key.trim().is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
        return Err(ConfigError::from(eyre!("invalid parameter name {key:?}")));
    }
    Ok(())
}

fn non_blank(field: &str, value: Option<String>, default: &str) -> ConfigResult<String> {
    match value {
        Some(v) if v.trim().is_empty() => {
            Err(ConfigError::from(eyre!("{field} must not be blank")))
        }
        Some(v) => Ok(v),
        None => Ok(default.to_owned()),
    }
}
