//! Strategies for locating engine binary archives.
//!
//! A [`BinaryResolver`] maps an (operating system, architecture) pair to a
//! byte stream holding a compressed tar archive of the engine's binaries. The
//! [`BinaryPreparer`](crate::BinaryPreparer) consumes the stream and unpacks
//! it into its content-addressed cache, so resolvers never touch the cache
//! themselves.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, ErrorKind, Read};
use std::path::PathBuf;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

/// Reader returned by resolvers.
pub type ArchiveStream = Box<dyn Read + Send>;

/// Environment variable naming the resource directory of the default resolver.
pub const BUNDLE_DIR_ENV: &str = "EPG_BUNDLE_DIR";

/// Directory used by [`BundledBinaryResolver::from_env`] when
/// [`BUNDLE_DIR_ENV`] is unset.
const DEFAULT_BUNDLE_DIR: &str = "resources";

/// Archive suffixes probed by [`BundledBinaryResolver`], in order.
const BUNDLE_EXTENSIONS: [&str; 5] = ["tar.gz", "tar.zst", "txz", "tar.xz", "tar"];

/// Locates the engine binary archive for a platform.
///
/// Implementations are selected by dependency injection when constructing an
/// [`EmbeddedServer`](crate::EmbeddedServer); the preparer never inspects the
/// concrete type.
#[cfg_attr(test, mockall::automock)]
pub trait BinaryResolver: Send + Sync {
    /// Stable identity used to key the in-process preparation cache.
    ///
    /// Two resolvers with the same identity must yield the same archive.
    fn identity(&self) -> String;

    /// Returns the archive stream for `os`/`arch`, or `None` when the
    /// resolver has nothing for that platform.
    ///
    /// # Errors
    /// Returns an I/O error when the archive exists but cannot be opened.
    fn resolve(&self, os: &str, arch: &str) -> io::Result<Option<ArchiveStream>>;
}

impl<R: BinaryResolver + ?Sized> BinaryResolver for Box<R> {
    fn identity(&self) -> String {
        (**self).identity()
    }

    fn resolve(&self, os: &str, arch: &str) -> io::Result<Option<ArchiveStream>> {
        (**self).resolve(os, arch)
    }
}

/// Default resolver reading archives bundled in a resource directory.
///
/// Archives are named `postgresql-<os>-<arch>.<ext>`, for example
/// `postgresql-Linux-x86_64.tar.gz`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BundledBinaryResolver {
    root: Utf8PathBuf,
}

impl BundledBinaryResolver {
    /// Creates a resolver reading from `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates a resolver reading from [`BUNDLE_DIR_ENV`] when set, falling
    /// back to `./resources`.
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var(BUNDLE_DIR_ENV)
            .ok()
            .map(|raw| raw.trim().to_owned())
            .filter(|raw| !raw.is_empty())
            .map_or_else(|| Utf8PathBuf::from(DEFAULT_BUNDLE_DIR), Utf8PathBuf::from);
        Self::new(root)
    }

    /// Returns the resource directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn candidates(&self, os: &str, arch: &str) -> impl Iterator<Item = Utf8PathBuf> + '_ {
        let stem = format!("postgresql-{os}-{arch}");
        BUNDLE_EXTENSIONS
            .iter()
            .map(move |ext| self.root.join(format!("{stem}.{ext}")))
    }
}

impl Default for BundledBinaryResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl BinaryResolver for BundledBinaryResolver {
    fn identity(&self) -> String {
        format!("bundled:{}", self.root)
    }

    fn resolve(&self, os: &str, arch: &str) -> io::Result<Option<ArchiveStream>> {
        for candidate in self.candidates(os, arch) {
            match File::open(&candidate) {
                Ok(file) => return Ok(Some(Box::new(file))),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

/// Resolver that always serves one archive file, whatever the platform.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ArchiveFileResolver {
    path: PathBuf,
}

impl ArchiveFileResolver {
    /// Creates a resolver serving `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BinaryResolver for ArchiveFileResolver {
    fn identity(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn resolve(&self, _os: &str, _arch: &str) -> io::Result<Option<ArchiveStream>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Resolver serving archives held in memory, for example through
/// `include_bytes!`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBinaryResolver {
    label: String,
    per_platform: HashMap<(String, String), Arc<[u8]>>,
    fallback: Option<Arc<[u8]>>,
}

impl InMemoryBinaryResolver {
    /// Creates an empty resolver identified by `label`.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Registers `archive` for one platform.
    #[must_use]
    pub fn with_platform(mut self, os: &str, arch: &str, archive: impl Into<Arc<[u8]>>) -> Self {
        self.per_platform
            .insert((os.to_owned(), arch.to_owned()), archive.into());
        self
    }

    /// Registers `archive` for every platform without a dedicated entry.
    #[must_use]
    pub fn with_fallback(mut self, archive: impl Into<Arc<[u8]>>) -> Self {
        self.fallback = Some(archive.into());
        self
    }
}

impl BinaryResolver for InMemoryBinaryResolver {
    fn identity(&self) -> String {
        format!("memory:{}", self.label)
    }

    fn resolve(&self, os: &str, arch: &str) -> io::Result<Option<ArchiveStream>> {
        let archive = self
            .per_platform
            .get(&(os.to_owned(), arch.to_owned()))
            .or(self.fallback.as_ref())
            .cloned();
        Ok(archive.map(|bytes| Box::new(Cursor::new(bytes)) as ArchiveStream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_all(stream: ArchiveStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut reader = stream;
        reader.read_to_end(&mut buf).expect("read stream");
        buf
    }

    #[test]
    fn bundled_resolver_finds_platform_archive() {
        let temp = tempdir().expect("tempdir");
        let root = Utf8Path::from_path(temp.path()).expect("utf8 path");
        std::fs::write(root.join("postgresql-Linux-x86_64.tar.gz"), b"archive").expect("write");

        let resolver = BundledBinaryResolver::new(root);
        let stream = resolver
            .resolve("Linux", "x86_64")
            .expect("resolve")
            .expect("archive present");

        assert_eq!(read_all(stream), b"archive");
    }

    #[test]
    fn bundled_resolver_finds_txz_archive() {
        let temp = tempdir().expect("tempdir");
        let root = Utf8Path::from_path(temp.path()).expect("utf8 path");
        std::fs::write(root.join("postgresql-Linux-aarch64.txz"), b"xz archive").expect("write");

        let resolver = BundledBinaryResolver::new(root);
        let stream = resolver
            .resolve("Linux", "aarch64")
            .expect("resolve")
            .expect("archive present");

        assert_eq!(read_all(stream), b"xz archive");
    }

    #[test]
    fn bundled_resolver_reports_absent_platform() {
        let temp = tempdir().expect("tempdir");
        let resolver = BundledBinaryResolver::new(
            Utf8Path::from_path(temp.path()).expect("utf8 path"),
        );
        assert!(resolver.resolve("Darwin", "aarch64").expect("resolve").is_none());
    }

    #[test]
    fn bundled_resolver_reads_bundle_dir_from_env() {
        let resolver = temp_env::with_var(BUNDLE_DIR_ENV, Some("/srv/pg-bundles"), || {
            BundledBinaryResolver::from_env()
        });
        assert_eq!(resolver.root(), Utf8Path::new("/srv/pg-bundles"));
        assert_eq!(resolver.identity(), "bundled:/srv/pg-bundles");
    }

    #[test]
    fn archive_file_resolver_ignores_platform() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("engine.tar");
        std::fs::write(&path, b"tar bytes").expect("write");

        let resolver = ArchiveFileResolver::new(&path);
        let stream = resolver
            .resolve("Windows", "x86_64")
            .expect("resolve")
            .expect("archive present");

        assert_eq!(read_all(stream), b"tar bytes");
    }

    #[test]
    fn in_memory_resolver_prefers_platform_entry() {
        let resolver = InMemoryBinaryResolver::new("fixture")
            .with_platform("Linux", "x86_64", b"linux".to_vec())
            .with_fallback(b"any".to_vec());

        let linux = resolver.resolve("Linux", "x86_64").expect("resolve");
        let darwin = resolver.resolve("Darwin", "aarch64").expect("resolve");

        assert_eq!(read_all(linux.expect("linux archive")), b"linux");
        assert_eq!(read_all(darwin.expect("fallback archive")), b"any");
    }

    #[test]
    fn in_memory_resolver_without_entries_returns_none() {
        let resolver = InMemoryBinaryResolver::new("empty");
        assert!(resolver.resolve("Linux", "x86_64").expect("resolve").is_none());
    }
}
