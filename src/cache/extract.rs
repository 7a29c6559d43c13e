//! Unpacks engine archives into an extraction directory.
//!
//! Regular files are written concurrently as blocking tasks on a dedicated
//! current-thread runtime and joined before returning. Directories and
//! symbolic links are created inline while walking the archive; hard links
//! are created after the join so their targets exist.

use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tar::{Archive, EntryType};
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{EmbedError, EmbedErrorKind, EmbedResult};
use crate::observability::CACHE_TARGET;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const USTAR_MAGIC: &[u8] = b"ustar";
const USTAR_MAGIC_OFFSET: usize = 257;
const EXECUTABLE_MODE: u32 = 0o755;

/// Compression wrapping the tar stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Compression {
    Gzip,
    Zstd,
    Xz,
    Uncompressed,
}

impl Compression {
    fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&GZIP_MAGIC) {
            return Some(Self::Gzip);
        }
        if bytes.starts_with(&ZSTD_MAGIC) {
            return Some(Self::Zstd);
        }
        if bytes.starts_with(&XZ_MAGIC) {
            return Some(Self::Xz);
        }
        let magic = bytes.get(USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + USTAR_MAGIC.len());
        (magic == Some(USTAR_MAGIC)).then_some(Self::Uncompressed)
    }
}

/// Summary of an extraction, used for logging.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub(crate) struct ExtractionSummary {
    pub(crate) files: usize,
    pub(crate) directories: usize,
    pub(crate) links: usize,
}

/// File write dispatched to the blocking pool.
struct PendingFile {
    path: Utf8PathBuf,
    contents: Vec<u8>,
    mode: u32,
}

/// Hard link deferred until every file has been written.
struct PendingHardLink {
    link: Utf8PathBuf,
    original: Utf8PathBuf,
}

/// Extracts `bytes` into `target`, which must already exist.
///
/// Existing files are overwritten so a retry after a partial failure starts
/// from a consistent state.
///
/// # Errors
/// Returns an [`EmbedErrorKind::Extraction`] error when the compression is not
/// recognised, the archive is corrupt, an entry escapes `target`, an entry
/// kind is unsupported, or a write fails.
pub(crate) fn extract_archive(bytes: &[u8], target: &Utf8Path) -> EmbedResult<ExtractionSummary> {
    let compression = Compression::sniff(bytes).ok_or_else(|| {
        EmbedError::new(
            EmbedErrorKind::Extraction,
            eyre!("engine archive is not a gzip, zstd, xz or uncompressed tar stream"),
        )
    })?;
    let reader = decoder(compression, bytes).map_err(|err| {
        EmbedError::new(
            EmbedErrorKind::Extraction,
            eyre!(err).wrap_err("failed to open archive decoder"),
        )
    })?;

    let runtime = build_runtime()?;
    let _guard = runtime.enter();
    let mut writes = JoinSet::new();
    let walked = walk_entries(reader, target, &mut writes);
    let written = runtime.block_on(join_writes(&mut writes));

    let (mut summary, hard_links) = walked?;
    summary.files = written?;
    for pending in hard_links {
        create_hard_link(&pending)?;
        summary.links += 1;
    }
    debug!(
        target: CACHE_TARGET,
        ?compression,
        files = summary.files,
        directories = summary.directories,
        links = summary.links,
        "archive extracted"
    );
    Ok(summary)
}

fn decoder<'a>(compression: Compression, bytes: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
    let cursor = Cursor::new(bytes);
    Ok(match compression {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(cursor)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(cursor)?),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(cursor)),
        Compression::Uncompressed => Box::new(cursor),
    })
}

fn build_runtime() -> EmbedResult<Runtime> {
    Builder::new_current_thread()
        .build()
        .context("failed to create Tokio runtime for archive extraction")
        .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))
}

/// Walks the archive, creating directories and symlinks inline and
/// dispatching file writes onto `writes`.
fn walk_entries(
    reader: impl Read,
    target: &Utf8Path,
    writes: &mut JoinSet<io::Result<()>>,
) -> EmbedResult<(ExtractionSummary, Vec<PendingHardLink>)> {
    let mut archive = Archive::new(reader);
    let mut summary = ExtractionSummary::default();
    let mut hard_links = Vec::new();
    let entries = archive
        .entries()
        .context("failed to read archive entries")
        .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?;

    for entry in entries {
        let mut entry = entry
            .context("failed to read archive entry")
            .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?;
        let entry_type = entry.header().entry_type();
        if matches!(entry_type, EntryType::XGlobalHeader | EntryType::XHeader) {
            continue;
        }
        let relative = entry
            .path()
            .context("archive entry has an unreadable path")
            .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?
            .into_owned();
        let destination = target.join(sanitise(&relative)?);

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&destination)
                    .with_context(|| format!("failed to create directory {destination}"))
                    .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?;
                summary.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                let mode = file_mode(&relative, entry.header().mode().unwrap_or(0o644));
                let mut contents = Vec::new();
                entry
                    .read_to_end(&mut contents)
                    .with_context(|| format!("failed to read archive member {destination}"))
                    .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?;
                let pending = PendingFile {
                    path: destination,
                    contents,
                    mode,
                };
                writes.spawn_blocking(move || write_file(&pending));
            }
            EntryType::Symlink => {
                let original = link_target(&entry, &destination)?;
                create_symlink(&original, &destination)?;
                summary.links += 1;
            }
            EntryType::Link => {
                let original = link_target(&entry, &destination)?;
                hard_links.push(PendingHardLink {
                    link: destination,
                    original: target.join(sanitise(&original)?),
                });
            }
            other => {
                return Err(EmbedError::new(
                    EmbedErrorKind::Extraction,
                    eyre!("unsupported archive entry type {other:?} for {destination}"),
                ));
            }
        }
    }
    Ok((summary, hard_links))
}

/// Waits for every dispatched write, reporting the first failure.
async fn join_writes(writes: &mut JoinSet<io::Result<()>>) -> EmbedResult<usize> {
    let mut written = 0;
    let mut first_error = None;
    while let Some(joined) = writes.join_next().await {
        let outcome = match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(eyre!(err)),
            Err(join_err) => Err(eyre!(join_err).wrap_err("file write task failed")),
        };
        match outcome {
            Ok(()) => written += 1,
            Err(report) if first_error.is_none() => first_error = Some(report),
            Err(_) => {}
        }
    }
    first_error.map_or(Ok(written), |report| {
        Err(EmbedError::new(EmbedErrorKind::Extraction, report))
    })
}

/// Rejects absolute paths and parent-directory components.
fn sanitise(relative: &Path) -> EmbedResult<Utf8PathBuf> {
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(EmbedError::new(
                    EmbedErrorKind::Extraction,
                    eyre!(
                        "archive entry {} escapes the extraction directory",
                        relative.display()
                    ),
                ));
            }
        }
    }
    Utf8PathBuf::from_path_buf(clean).map_err(|path| {
        EmbedError::new(
            EmbedErrorKind::Extraction,
            eyre!("archive entry {} is not valid UTF-8", path.display()),
        )
    })
}

fn file_mode(relative: &Path, archived: u32) -> u32 {
    let mut components = relative
        .components()
        .filter(|component| !matches!(component, Component::CurDir));
    match components.next() {
        Some(Component::Normal(first)) if first == "bin" => EXECUTABLE_MODE,
        _ => archived,
    }
}

fn link_target<R: Read>(entry: &tar::Entry<'_, R>, destination: &Utf8Path) -> EmbedResult<PathBuf> {
    entry
        .link_name()
        .with_context(|| format!("failed to read link target for {destination}"))
        .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))?
        .map(std::borrow::Cow::into_owned)
        .ok_or_else(|| {
            EmbedError::new(
                EmbedErrorKind::Extraction,
                eyre!("link entry {destination} has no target"),
            )
        })
}

fn write_file(pending: &PendingFile) -> io::Result<()> {
    if let Some(parent) = pending.path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_existing(&pending.path)?;
    fs::write(&pending.path, &pending.contents)?;
    set_mode(&pending.path, pending.mode)
}

#[cfg(unix)]
fn set_mode(path: &Utf8Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Utf8Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn remove_existing(path: &Utf8Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn create_symlink(original: &Path, link: &Utf8Path) -> EmbedResult<()> {
    replace_with_symlink(original, link)
        .with_context(|| format!("failed to create symlink {link} -> {}", original.display()))
        .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))
}

fn replace_with_symlink(original: &Path, link: &Utf8Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_existing(link)?;
    platform_symlink(original, link)
}

#[cfg(unix)]
fn platform_symlink(original: &Path, link: &Utf8Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn platform_symlink(original: &Path, link: &Utf8Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}

fn create_hard_link(pending: &PendingHardLink) -> EmbedResult<()> {
    replace_with_hard_link(pending)
        .with_context(|| {
            format!(
                "failed to create hard link {} -> {}",
                pending.link, pending.original
            )
        })
        .map_err(EmbedError::with_kind(EmbedErrorKind::Extraction))
}

fn replace_with_hard_link(pending: &PendingHardLink) -> io::Result<()> {
    if let Some(parent) = pending.link.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_existing(&pending.link)?;
    fs::hard_link(&pending.original, &pending.link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, mode: u32, body: &[u8]) {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(body.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder
            .append_data(&mut header, path, body)
            .expect("append file");
    }

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_ustar();
        dir.set_entry_type(EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder
            .append_data(&mut dir, "share/", io::empty())
            .expect("append dir");
        append_file(&mut builder, "bin/pg_ctl", 0o644, b"#!/bin/sh\n");
        append_file(&mut builder, "share/README", 0o600, b"docs");
        builder.into_inner().expect("finish tar")
    }

    fn utf8(temp: &tempfile::TempDir) -> &Utf8Path {
        Utf8Path::from_path(temp.path()).expect("utf8 path")
    }

    #[rstest]
    #[case(&[0x1f, 0x8b, 0x08], Some(Compression::Gzip))]
    #[case(&[0x28, 0xb5, 0x2f, 0xfd, 0x00], Some(Compression::Zstd))]
    #[case(b"PK\x03\x04", None)]
    fn sniff_recognises_magic_bytes(#[case] bytes: &[u8], #[case] expected: Option<Compression>) {
        assert_eq!(Compression::sniff(bytes), expected);
    }

    #[test]
    fn sniff_recognises_plain_ustar() {
        assert_eq!(Compression::sniff(&sample_tar()), Some(Compression::Uncompressed));
    }

    #[rstest]
    #[case("bin/initdb", 0o755)]
    #[case("./bin/pg_ctl", 0o755)]
    #[case("lib/bin/helper", 0o640)]
    #[case("share/binary.dat", 0o640)]
    fn bin_members_become_executable(#[case] path: &str, #[case] expected: u32) {
        assert_eq!(file_mode(Path::new(path), 0o640), expected);
    }

    #[rstest]
    #[case("../escape")]
    #[case("bin/../../escape")]
    #[case("/etc/passwd")]
    fn sanitise_rejects_escaping_paths(#[case] path: &str) {
        let err = sanitise(Path::new(path)).expect_err("path must be rejected");
        assert_eq!(err.kind(), EmbedErrorKind::Extraction);
    }

    #[test]
    fn extracts_plain_tar_with_executable_bin() {
        let temp = tempdir().expect("tempdir");
        let summary = extract_archive(&sample_tar(), utf8(&temp)).expect("extract");

        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 1);
        let script = temp.path().join("bin/pg_ctl");
        assert_eq!(fs::read(&script).expect("read script"), b"#!/bin/sh\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&script).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
            let readme = fs::metadata(temp.path().join("share/README")).expect("metadata");
            assert_eq!(readme.permissions().mode() & 0o777, 0o600);
        }
    }

    #[test]
    fn extracts_gzip_and_zstd_archives() {
        use std::io::Write as _;

        let tar_bytes = sample_tar();
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(&tar_bytes).expect("gzip");
        let gz = gz.finish().expect("finish gzip");
        let zst = zstd::stream::encode_all(Cursor::new(&tar_bytes), 0).expect("zstd");

        for archive in [gz, zst] {
            let temp = tempdir().expect("tempdir");
            extract_archive(&archive, utf8(&temp)).expect("extract");
            assert!(temp.path().join("bin/pg_ctl").is_file());
        }
    }

    #[test]
    fn extracts_xz_archives() {
        use std::io::Write as _;

        let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
        xz.write_all(&sample_tar()).expect("xz");
        let xz = xz.finish().expect("finish xz");
        assert_eq!(Compression::sniff(&xz), Some(Compression::Xz));

        let temp = tempdir().expect("tempdir");
        extract_archive(&xz, utf8(&temp)).expect("extract");
        assert!(temp.path().join("bin/pg_ctl").is_file());
    }

    #[test]
    fn re_extraction_overwrites_partial_output() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("bin")).expect("mkdir");
        fs::write(temp.path().join("bin/pg_ctl"), b"partial").expect("seed");

        extract_archive(&sample_tar(), utf8(&temp)).expect("extract");

        assert_eq!(
            fs::read(temp.path().join("bin/pg_ctl")).expect("read"),
            b"#!/bin/sh\n"
        );
    }

    #[test]
    fn unrecognised_bytes_fail_with_extraction_kind() {
        let temp = tempdir().expect("tempdir");
        let err = extract_archive(b"definitely not an archive", utf8(&temp))
            .expect_err("garbage must fail");
        assert_eq!(err.kind(), EmbedErrorKind::Extraction);
    }

    #[cfg(unix)]
    #[test]
    fn unsupported_entry_kinds_fail() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut fifo = tar::Header::new_ustar();
        fifo.set_entry_type(EntryType::Fifo);
        fifo.set_size(0);
        fifo.set_mode(0o644);
        fifo.set_cksum();
        builder
            .append_data(&mut fifo, "run/pipe", io::empty())
            .expect("append fifo");
        let bytes = builder.into_inner().expect("finish tar");

        let temp = tempdir().expect("tempdir");
        let err = extract_archive(&bytes, utf8(&temp)).expect_err("fifo must fail");
        assert_eq!(err.kind(), EmbedErrorKind::Extraction);
        assert!(err.to_string().contains("unsupported"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_and_hard_links_are_created() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "lib/libpq.so.5", 0o644, b"elf");
        let mut symlink = tar::Header::new_ustar();
        symlink.set_entry_type(EntryType::Symlink);
        symlink.set_size(0);
        symlink.set_mode(0o777);
        builder
            .append_link(&mut symlink, "lib/libpq.so", "libpq.so.5")
            .expect("append symlink");
        let mut hard = tar::Header::new_ustar();
        hard.set_entry_type(EntryType::Link);
        hard.set_size(0);
        hard.set_mode(0o644);
        builder
            .append_link(&mut hard, "lib/libpq-copy.so", "lib/libpq.so.5")
            .expect("append hard link");
        let bytes = builder.into_inner().expect("finish tar");

        let temp = tempdir().expect("tempdir");
        let summary = extract_archive(&bytes, utf8(&temp)).expect("extract");

        assert_eq!(summary.links, 2);
        let link = fs::read_link(temp.path().join("lib/libpq.so")).expect("read link");
        assert_eq!(link, Path::new("libpq.so.5"));
        assert_eq!(
            fs::read(temp.path().join("lib/libpq-copy.so")).expect("read hard link"),
            b"elf"
        );
    }
}
