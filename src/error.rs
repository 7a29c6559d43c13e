//! Domain error types for the local `PostgreSQL` provisioner.

use color_eyre::Report;
use thiserror::Error;

/// Result alias for operations that may return an [`EmbedError`].
pub type EmbedResult<T> = std::result::Result<T, EmbedError>;

/// Result alias for configuration fallible operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Categorises failures so callers can branch on structured errors instead of
/// matching message text.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub enum EmbedErrorKind {
    /// Represents errors without a more specific semantic meaning.
    #[default]
    Other,
    /// No engine binary is available for the detected platform, or the
    /// resolver failed while locating it.
    Resolution,
    /// The engine archive could not be read, digested, or unpacked.
    Extraction,
    /// A cross-process lock could not be obtained, or waiting on another
    /// process to finish unpacking exceeded its bound.
    LockContention,
    /// An engine command exited unsuccessfully or could not be run.
    ProcessFailed,
    /// The engine did not accept connections before the startup timeout.
    ReadinessTimeout,
    /// `start` was called on an instance that has already left `NotStarted`.
    AlreadyStarted,
    /// An operation was attempted on a stopped instance.
    Closed,
    /// The supplied configuration is invalid.
    Config,
}

/// Error surfaced by every fallible lifecycle, preparation, and process
/// operation.
#[derive(Debug, Error)]
#[error("{report}")]
pub struct EmbedError {
    kind: EmbedErrorKind,
    #[source]
    report: Report,
}

impl EmbedError {
    /// Constructs a new error with the provided kind and diagnostic report.
    #[must_use]
    pub const fn new(kind: EmbedErrorKind, report: Report) -> Self {
        Self { kind, report }
    }

    /// Returns a closure that tags a report with `kind`, for use with
    /// `map_err` after attaching context.
    pub(crate) fn with_kind(kind: EmbedErrorKind) -> impl FnOnce(Report) -> Self {
        move |report| Self::new(kind, report)
    }

    /// Returns the semantic category for this failure.
    #[must_use]
    pub const fn kind(&self) -> EmbedErrorKind {
        self.kind
    }

    /// Borrows the underlying diagnostic report.
    #[must_use]
    pub const fn report(&self) -> &Report {
        &self.report
    }

    /// Extracts the underlying diagnostic report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

impl From<Report> for EmbedError {
    fn from(report: Report) -> Self {
        Self::new(EmbedErrorKind::Other, report)
    }
}

impl From<ConfigError> for EmbedError {
    fn from(err: ConfigError) -> Self {
        let ConfigError(report) = err;
        Self::new(EmbedErrorKind::Config, report)
    }
}

/// Captures configuration failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] Report);

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    #[test]
    fn reports_default_to_other_kind() {
        let err = EmbedError::from(eyre!("boom"));
        assert_eq!(err.kind(), EmbedErrorKind::Other);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn config_errors_keep_their_kind() {
        let err = EmbedError::from(ConfigError::from(eyre!("bad port")));
        assert_eq!(err.kind(), EmbedErrorKind::Config);
        assert!(err.to_string().contains("bad port"));
    }

    #[test]
    fn with_kind_tags_reports() {
        let err = EmbedError::with_kind(EmbedErrorKind::Extraction)(eyre!("corrupt"));
        assert_eq!(err.kind(), EmbedErrorKind::Extraction);
    }
}
