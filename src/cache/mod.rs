//! Content-addressed cache of unpacked engine binaries.
//!
//! Each distinct archive is unpacked once into `<root>/PG-<sha256>/`, where
//! `<root>` comes from [`resolve_working_dir`] unless the caller overrides
//! it. Directories persist across runs and are shared read-only by every
//! server once their `.exists` marker is written.
//!
//! # Cross-Process Coordination
//!
//! The first process to take the `epg-lock` file inside the extraction
//! directory unpacks the archive and writes the marker; every other process
//! polls for the marker until it appears or the wait bound elapses.

mod archive;
mod config;
mod extract;
mod preparer;

pub use config::{WORKING_DIR_ENV, resolve_working_dir};
pub use preparer::BinaryPreparer;
