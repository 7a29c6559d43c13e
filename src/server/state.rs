//! Lifecycle states of an embedded server.

use std::fmt;

use color_eyre::eyre::eyre;

use crate::error::{EmbedError, EmbedErrorKind, EmbedResult};

/// Where an [`EmbeddedServer`](crate::EmbeddedServer) is in its lifecycle.
///
/// Transitions only move forward: `NotStarted → Starting → Running →
/// Stopped`. A failed start leaves the instance in `Starting`; `close` is
/// still safe from there.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ServerState {
    /// Constructed; binaries are prepared but the engine was never launched.
    NotStarted,
    /// `start` has been called and has not yet succeeded.
    Starting,
    /// The engine accepted a readiness probe.
    Running,
    /// `close` has run; the instance cannot be restarted.
    Stopped,
}

impl ServerState {
    /// Moves `NotStarted` to `Starting`, refusing every other state.
    pub(crate) fn begin_start(&mut self) -> EmbedResult<()> {
        match *self {
            Self::NotStarted => {
                *self = Self::Starting;
                Ok(())
            }
            Self::Starting | Self::Running => Err(EmbedError::new(
                EmbedErrorKind::AlreadyStarted,
                eyre!("postmaster already started"),
            )),
            Self::Stopped => Err(EmbedError::new(
                EmbedErrorKind::Closed,
                eyre!("server instance is closed"),
            )),
        }
    }

    /// Moves `Starting` to `Running`.
    ///
    /// Fails with [`EmbedErrorKind::Closed`] when `close` ran while the start
    /// was in progress, leaving `Stopped` in place.
    pub(crate) fn finish_start(&mut self) -> EmbedResult<()> {
        self.ensure_starting()?;
        *self = Self::Running;
        Ok(())
    }

    /// Fails with [`EmbedErrorKind::Closed`] unless a start is in progress.
    pub(crate) fn ensure_starting(self) -> EmbedResult<()> {
        match self {
            Self::Starting => Ok(()),
            Self::NotStarted | Self::Running | Self::Stopped => Err(EmbedError::new(
                EmbedErrorKind::Closed,
                eyre!("server instance was closed during start (state: {self})"),
            )),
        }
    }

    /// Whether `close` has engine work to do.
    pub(crate) const fn was_launched(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}
