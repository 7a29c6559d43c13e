//! Location of the shared binary cache.
//!
//! Resolves the cache root from the environment with a temporary-directory
//! fallback.

use camino::Utf8PathBuf;
use std::path::PathBuf;

/// Environment variable overriding the cache root.
pub const WORKING_DIR_ENV: &str = "EPG_WORKING_DIR";

/// Subdirectory of the system temporary directory used by default.
const CACHE_SUBDIR: &str = "embedded-pg";

/// Resolves the root directory holding extracted engine builds.
///
/// The resolution order is:
///
/// 1. `EPG_WORKING_DIR` environment variable if set, non-blank, and valid UTF-8
/// 2. `<system temp>/embedded-pg`
/// 3. `/tmp/embedded-pg` when the temporary directory is not valid UTF-8
///
/// # Examples
///
/// ```
/// use pg_embed_local::resolve_working_dir;
///
/// let root = resolve_working_dir();
/// assert!(!root.as_str().is_empty());
/// ```
#[must_use]
pub fn resolve_working_dir() -> Utf8PathBuf {
    if let Some(dir) = resolve_from_env() {
        return dir;
    }

    Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .map_or_else(|_| Utf8PathBuf::from("/tmp"), |dir| dir)
        .join(CACHE_SUBDIR)
}

fn resolve_from_env() -> Option<Utf8PathBuf> {
    let raw = std::env::var(WORKING_DIR_ENV).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Utf8PathBuf::from_path_buf(PathBuf::from(trimmed)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_env::with_var;

    #[test]
    fn resolve_working_dir_respects_explicit_env_var() {
        let result = with_var(WORKING_DIR_ENV, Some("/custom/cache"), resolve_working_dir);
        assert_eq!(result.as_str(), "/custom/cache");
    }

    #[test]
    fn resolve_working_dir_falls_back_to_temp_dir() {
        let result = with_var(WORKING_DIR_ENV, None::<&str>, resolve_working_dir);
        assert!(result.ends_with(CACHE_SUBDIR));
    }

    #[test]
    fn resolve_working_dir_ignores_whitespace_only_env_var() {
        let result = with_var(WORKING_DIR_ENV, Some("   "), resolve_working_dir);
        assert!(result.ends_with(CACHE_SUBDIR));
    }
}
