//! Preparation of engine binaries in the shared, content-addressed cache.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Result, ensure, eyre};
use pg_embed_local::test_support::FakeEngine;
use pg_embed_local::{BinaryPreparer, EmbedErrorKind, InMemoryBinaryResolver};
use tempfile::TempDir;

fn utf8_root(temp: &TempDir) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
        .map_err(|path| eyre!("temporary directory {} is not UTF-8", path.display()))
}

fn fake_archive(root: &Utf8Path) -> Result<Vec<u8>> {
    Ok(FakeEngine::new(root.join("invocations.log")).archive()?)
}

/// Unpacked tools under `bin/` are executable and library symlinks survive.
#[test]
fn prepare_unpacks_runnable_engine() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = utf8_root(&temp)?;
    let cache = root.join("cache");
    let resolver = InMemoryBinaryResolver::new("fake").with_fallback(fake_archive(&root)?);

    let dir = BinaryPreparer::new().prepare(&resolver, Some(cache.as_path()))?;

    ensure!(dir.starts_with(&cache));
    ensure!(dir.file_name().is_some_and(|name| name.starts_with("PG-")));
    for tool in ["initdb", "pg_ctl"] {
        let mode = std::fs::metadata(dir.join("bin").join(tool))?.permissions().mode();
        ensure!(mode & 0o111 != 0, "{tool} is not executable: {mode:o}");
    }
    let link = std::fs::read_link(dir.join("lib/libpq.so"))?;
    ensure!(link.as_os_str() == "libpq.so.5", "unexpected link target {link:?}");
    ensure!(dir.join(".exists").is_file());
    ensure!(!dir.join("epg-lock").exists());
    Ok(())
}

/// Repeated preparation, in-process or from a fresh preparer, reuses the
/// first extraction.
#[test]
fn prepare_reuses_existing_extraction() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = utf8_root(&temp)?;
    let cache = root.join("cache");
    let resolver = InMemoryBinaryResolver::new("fake").with_fallback(fake_archive(&root)?);
    let preparer = BinaryPreparer::new();

    let first = preparer.prepare(&resolver, Some(cache.as_path()))?;
    std::fs::write(first.join("sentinel"), "kept")?;
    let second = preparer.prepare(&resolver, Some(cache.as_path()))?;
    let third = BinaryPreparer::new().prepare(&resolver, Some(cache.as_path()))?;

    ensure!(first == second && second == third);
    ensure!(std::fs::read_to_string(third.join("sentinel"))? == "kept");
    Ok(())
}

/// A resolver without an archive for the platform is a resolution failure.
#[test]
fn missing_archive_is_reported() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = utf8_root(&temp)?;

    let err = BinaryPreparer::new()
        .prepare(&InMemoryBinaryResolver::new("empty"), Some(root.as_path()))
        .err()
        .ok_or_else(|| eyre!("an empty resolver must fail"))?;

    ensure!(err.kind() == EmbedErrorKind::Resolution, "unexpected error: {err:?}");
    Ok(())
}

/// Two processes preparing the same archive at once converge on one
/// directory.
#[test]
fn concurrent_processes_share_one_extraction() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = utf8_root(&temp)?;
    let archive = root.join("engine.tar.gz");
    std::fs::write(&archive, fake_archive(&root)?)?;
    let cache = root.join("cache");

    let children = (0..2)
        .map(|_| {
            Command::new(env!("CARGO_BIN_EXE_pg-embed-local"))
                .args(["prepare", "--archive", archive.as_str(), "--working-dir", cache.as_str()])
                .env("RUST_LOG", "warn")
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut dirs = Vec::new();
    for child in children {
        let output = child.wait_with_output()?;
        ensure!(
            output.status.success(),
            "prepare failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        dirs.push(String::from_utf8(output.stdout)?.trim().to_owned());
    }

    ensure!(dirs.windows(2).all(|pair| pair.first() == pair.last()), "dirs: {dirs:?}");
    let dir = dirs.first().ok_or_else(|| eyre!("no output"))?;
    ensure!(Utf8Path::new(dir).join(".exists").is_file());
    ensure!(Utf8Path::new(dir).join("bin/pg_ctl").is_file());
    Ok(())
}
