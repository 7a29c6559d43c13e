//! Host platform detection and engine command-line conventions.
//!
//! Binary archives are published per (operating system, architecture) pair
//! using the names reported by `uname` on Unix hosts (`Linux`, `Darwin`,
//! `x86_64`, `aarch64`), so detection normalises Rust's target constants to
//! that vocabulary.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, TcpListener};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;

use crate::error::{EmbedError, EmbedErrorKind, EmbedResult};

/// Operating system families for which engine binaries are published.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum OsFamily {
    /// Linux distributions.
    Linux,
    /// macOS.
    Darwin,
    /// Microsoft Windows.
    Windows,
}

impl OsFamily {
    /// Returns the name used in archive lookups.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "Linux",
            Self::Darwin => "Darwin",
            Self::Windows => "Windows",
        }
    }

    fn from_target(os: &str) -> Option<Self> {
        match os {
            "linux" => Some(Self::Linux),
            "macos" => Some(Self::Darwin),
            "windows" => Some(Self::Windows),
            _ => None,
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (operating system, architecture) pair handed to binary resolvers.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Platform {
    os: OsFamily,
    arch: String,
}

impl Platform {
    /// Creates a platform description from explicit parts.
    #[must_use]
    pub fn new(os: OsFamily, arch: impl Into<String>) -> Self {
        Self {
            os,
            arch: normalise_arch(&arch.into()),
        }
    }

    /// Detects the platform this process is running on.
    ///
    /// # Errors
    /// Returns a [`EmbedErrorKind::Resolution`] error when the operating
    /// system has no published engine binaries.
    pub fn detect() -> EmbedResult<Self> {
        let os = OsFamily::from_target(std::env::consts::OS).ok_or_else(|| {
            EmbedError::new(
                EmbedErrorKind::Resolution,
                eyre!("unknown operating system {}", std::env::consts::OS),
            )
        })?;
        Ok(Self::new(os, std::env::consts::ARCH))
    }

    /// Returns the operating system family.
    #[must_use]
    pub const fn os(&self) -> OsFamily {
        self.os
    }

    /// Returns the normalised architecture name.
    #[must_use]
    pub fn arch(&self) -> &str {
        &self.arch
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.os, self.arch)
    }
}

fn normalise_arch(arch: &str) -> String {
    match arch {
        "amd64" => "x86_64".to_owned(),
        other => other.to_owned(),
    }
}

/// Returns the path of `name` inside the `bin/` directory of an extracted
/// engine, adding the `.exe` suffix on Windows.
#[must_use]
pub fn binary_path(engine_dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    let file_name = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_owned()
    };
    engine_dir.join("bin").join(file_name)
}

/// Binds an ephemeral loopback port, closes it, and returns its number.
///
/// # Errors
/// Returns the underlying I/O error when no port can be bound.
pub fn detect_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Builds the option string handed to the engine through `pg_ctl -o`.
///
/// `-F` disables `fsync`, which is safe for throwaway clusters.
#[must_use]
pub fn start_options(port: u16, parameters: &BTreeMap<String, String>) -> Vec<String> {
    let mut options = vec!["-p".to_owned(), port.to_string(), "-F".to_owned()];
    for (key, value) in parameters {
        options.push("-c".to_owned());
        options.push(format!("{key}={value}"));
    }
    options
}

/// Builds `initdb` locale arguments.
///
/// Unix builds take `--key value` pairs; the Windows build only accepts the
/// joined `--key=value` form.
#[must_use]
pub fn locale_options(locale: &BTreeMap<String, String>) -> Vec<String> {
    let mut options = Vec::with_capacity(locale.len() * 2);
    for (key, value) in locale {
        if cfg!(windows) {
            options.push(format!("--{key}={value}"));
        } else {
            options.push(format!("--{key}"));
            options.push(value.clone());
        }
    }
    options
}
