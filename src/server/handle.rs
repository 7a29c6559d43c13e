//! Connection handle returned by a successful start.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use secrecy::{ExposeSecret, SecretString};

use super::config::ServerConfig;
use super::readiness::{ProbeError, verify_ready};
use crate::error::{EmbedError, EmbedResult};

const HOST: &str = "localhost";

/// Describes how to reach a running embedded engine.
///
/// Handles are cheap to clone and may be shared across threads. A handle
/// does not keep the engine alive; once the owning
/// [`EmbeddedServer`](crate::EmbeddedServer) closes, new connections fail.
///
/// # Examples
/// ```no_run
/// use pg_embed_local::{EmbeddedServer, ServerConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = EmbeddedServer::new(ServerConfig::builder().build()?)?;
/// let handle = server.start()?;
/// let mut client = handle.connect()?;
/// let row = client.query_one("SELECT 1", &[])?;
/// assert_eq!(row.get::<_, i32>(0), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    port: u16,
    user: String,
    database: String,
    schema: String,
    password: SecretString,
    data_dir: Utf8PathBuf,
    engine_dir: Utf8PathBuf,
}

impl ServerHandle {
    pub(crate) fn new(config: &ServerConfig, engine_dir: &Utf8Path) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                port: config.port(),
                user: config.user().to_owned(),
                database: config.database().to_owned(),
                schema: config.schema().to_owned(),
                password: SecretString::from(config.password().expose_secret().to_owned()),
                data_dir: config.data_dir().to_path_buf(),
                engine_dir: engine_dir.to_path_buf(),
            }),
        }
    }

    /// Returns the host name clients connect to.
    #[must_use]
    pub const fn host(&self) -> &'static str {
        HOST
    }

    /// Returns the engine's TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Returns the configured user name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.inner.user
    }

    /// Returns the configured database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.inner.database
    }

    /// Returns the configured schema, used as the connection `search_path`.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.inner.schema
    }

    /// Returns the configured password.
    #[must_use]
    pub fn password(&self) -> &SecretString {
        &self.inner.password
    }

    /// Returns the engine's data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        &self.inner.data_dir
    }

    /// Returns the extraction directory holding the engine binaries.
    #[must_use]
    pub fn engine_dir(&self) -> &Utf8Path {
        &self.inner.engine_dir
    }

    /// Builds a libpq URL for the configured user and database.
    #[must_use]
    pub fn database_url(&self) -> String {
        self.database_url_for(self.user(), self.database())
    }

    /// Builds a libpq URL for `user` and `database`.
    #[must_use]
    pub fn database_url_for(&self, user: &str, database: &str) -> String {
        format!("postgresql://{user}@{HOST}:{}/{database}", self.port())
    }

    /// Builds a `postgres` client configuration for the configured identity.
    #[must_use]
    pub fn postgres_config(&self) -> postgres::Config {
        let properties = self.schema_properties();
        connection_config(
            self.port(),
            self.user(),
            self.database(),
            Some(self.password()),
            &properties,
        )
    }

    /// Opens a connection as the configured user to the configured database.
    ///
    /// # Errors
    /// Returns an error when the engine refuses the connection.
    pub fn connect(&self) -> EmbedResult<postgres::Client> {
        self.connect_as(self.user(), self.database(), &self.schema_properties())
    }

    /// Opens a connection as `user` to `database` with extra connection
    /// properties.
    ///
    /// `application_name`, `options`, and `connect_timeout` (seconds) set the
    /// matching client options; every other property is forwarded as a
    /// runtime parameter (`-c key=value`).
    ///
    /// # Errors
    /// Returns an error when the engine refuses the connection.
    pub fn connect_as(
        &self,
        user: &str,
        database: &str,
        properties: &BTreeMap<String, String>,
    ) -> EmbedResult<postgres::Client> {
        connection_config(
            self.port(),
            user,
            database,
            Some(self.password()),
            properties,
        )
        .connect(postgres::NoTls)
        .with_context(|| format!("failed to connect to {}", self.database_url_for(user, database)))
        .map_err(EmbedError::from)
    }

    /// Runs the readiness probe once against this engine.
    ///
    /// # Errors
    /// Returns the [`ProbeError`] describing the step that failed.
    pub fn verify_ready(&self) -> Result<(), ProbeError> {
        verify_ready(self.port(), self.user(), self.database(), &self.schema_properties())
    }

    fn schema_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("search_path".to_owned(), self.schema().to_owned())])
    }
}

/// Builds a client configuration for the local engine.
pub(crate) fn connection_config(
    port: u16,
    user: &str,
    database: &str,
    password: Option<&SecretString>,
    properties: &BTreeMap<String, String>,
) -> postgres::Config {
    let mut config = postgres::Config::new();
    config.host(HOST).port(port).user(user).dbname(database);
    let secret = password.map_or("", |secret| secret.expose_secret());
    if !secret.is_empty() {
        config.password(secret);
    }

    let mut runtime_options = Vec::new();
    for (key, value) in properties {
        match key.as_str() {
            "application_name" => {
                config.application_name(value);
            }
            "options" => runtime_options.push(value.clone()),
            "connect_timeout" => {
                if let Ok(secs) = value.parse::<u64>() {
                    config.connect_timeout(Duration::from_secs(secs));
                }
            }
            _ => runtime_options.push(format!("-c {key}={value}")),
        }
    }
    if !runtime_options.is_empty() {
        config.options(&runtime_options.join(" "));
    }
    config
}
