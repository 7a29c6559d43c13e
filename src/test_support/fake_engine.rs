//! Builds engine archives whose tools are recording shell scripts.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{Builder, EntryType, Header};

/// Fake engine whose `bin/initdb` and `bin/pg_ctl` append `"<tool> <args>"`
/// lines to an invocation log.
///
/// `initdb` creates the `-D` directory and its `postgresql.conf` marker.
/// Both tools succeed unless given a nonzero exit code, in which case they
/// print `boom` to stderr and exit with it. Nothing ever listens on the
/// port, so a start against a fake engine ends in a readiness timeout.
///
/// The scripts are archived without the executable bit; extraction must set
/// it for anything under `bin/`.
///
/// # Examples
/// ```no_run
/// use pg_embed_local::InMemoryBinaryResolver;
/// use pg_embed_local::test_support::FakeEngine;
///
/// let archive = FakeEngine::new("/tmp/fake-engine.log").archive()?;
/// let resolver = InMemoryBinaryResolver::new("fake").with_fallback(archive);
/// # let _ = resolver;
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct FakeEngine {
    log_path: PathBuf,
    initdb_exit: i32,
    initdb_delay: Duration,
    start_exit: i32,
    stop_exit: i32,
}

impl FakeEngine {
    /// Creates a fake engine logging to `log_path`, which must be absolute
    /// and free of single quotes.
    #[must_use]
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            initdb_exit: 0,
            initdb_delay: Duration::ZERO,
            start_exit: 0,
            stop_exit: 0,
        }
    }

    /// Makes `initdb` fail with `code`.
    #[must_use]
    pub const fn initdb_exit_code(mut self, code: i32) -> Self {
        self.initdb_exit = code;
        self
    }

    /// Makes `initdb` sleep for `delay` after logging its call.
    #[must_use]
    pub const fn initdb_delay(mut self, delay: Duration) -> Self {
        self.initdb_delay = delay;
        self
    }

    /// Makes `pg_ctl start` fail with `code`.
    #[must_use]
    pub const fn start_exit_code(mut self, code: i32) -> Self {
        self.start_exit = code;
        self
    }

    /// Makes `pg_ctl stop` fail with `code`.
    #[must_use]
    pub const fn stop_exit_code(mut self, code: i32) -> Self {
        self.stop_exit = code;
        self
    }

    /// Returns the invocation log path.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Produces a gzip-compressed tar archive of the fake engine.
    ///
    /// # Errors
    /// Returns an I/O error when the archive cannot be assembled.
    pub fn archive(&self) -> io::Result<Vec<u8>> {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        append_dir(&mut builder, "bin/")?;
        append_dir(&mut builder, "lib/")?;
        append_file(&mut builder, "bin/initdb", self.initdb_script().as_bytes())?;
        append_file(&mut builder, "bin/pg_ctl", self.pg_ctl_script().as_bytes())?;
        append_file(&mut builder, "lib/libpq.so.5", b"not really a library")?;
        let mut link = Header::new_ustar();
        link.set_entry_type(EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder.append_link(&mut link, "lib/libpq.so", "libpq.so.5")?;
        let mut encoder = builder.into_inner()?;
        encoder.flush()?;
        encoder.finish()
    }

    fn initdb_script(&self) -> String {
        format!(
            "#!/bin/sh\n\
             echo \"initdb $*\" >> '{log}'\n\
             sleep {delay:.3}\n\
             data=\"\"\n\
             while [ $# -gt 0 ]; do\n\
             \x20 if [ \"$1\" = \"-D\" ]; then data=\"$2\"; fi\n\
             \x20 shift\n\
             done\n\
             if [ {code} -ne 0 ]; then echo boom >&2; exit {code}; fi\n\
             mkdir -p \"$data\" && touch \"$data/postgresql.conf\"\n",
            log = self.log_path.display(),
            code = self.initdb_exit,
            delay = self.initdb_delay.as_secs_f64(),
        )
    }

    fn pg_ctl_script(&self) -> String {
        format!(
            "#!/bin/sh\n\
             echo \"pg_ctl $*\" >> '{log}'\n\
             case \"$1\" in\n\
             \x20 start) code={start} ;;\n\
             \x20 stop) code={stop} ;;\n\
             \x20 *) code=0 ;;\n\
             esac\n\
             if [ \"$code\" -ne 0 ]; then echo boom >&2; exit \"$code\"; fi\n\
             exit 0\n",
            log = self.log_path.display(),
            start = self.start_exit,
            stop = self.stop_exit,
        )
    }
}

/// Reads the invocation log, returning one entry per recorded call.
///
/// A missing log means nothing was invoked.
#[must_use]
pub fn read_invocations(log_path: &Path) -> Vec<String> {
    std::fs::read_to_string(log_path)
        .map(|content| content.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

fn append_dir<W: Write>(builder: &mut Builder<W>, path: &str) -> io::Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, path, io::empty())
}

fn append_file<W: Write>(builder: &mut Builder<W>, path: &str, body: &[u8]) -> io::Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, body)
}
