// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Crate error handling.
//!
//! Each module reports failures through its own error type. At the command
//! boundary they roll up into [`Error`], which classifies the failure by
//! [`ErrorKind`] and [`Severity`]. Warnings are reported but leave the exit
//! status at zero. Errors end the process with [`Error::exit_code`].

use crate::{
    config::ConfigError,
    history::HistoryError,
    path::NoWayHome,
    registry::{server::ServerError, QueryError},
    resolve::ResolveError,
    staging::StagingError,
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    process::ExitStatus,
};

/// How bad a failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Nothing was done, but nothing went wrong either.
    Warning,

    /// Command failed.
    Error,
}

impl Display for Severity {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Warning => fmt.write_str("warning"),
            Self::Error => fmt.write_str("error"),
        }
    }
}

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Configuration is malformed or violates a rule, user must fix it.
    InvalidConfiguration,

    /// Registry could not be queried.
    RegistryQueryFailed,

    /// Local registry could not be installed, launched, or stopped.
    ServerLifecycle,

    /// Staging bookkeeping failed.
    Staging,

    /// Run script failed or was interrupted.
    Run,

    /// Filesystem or repository access failed.
    Io,
}

/// FAIR error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),

    #[error(transparent)]
    History(#[from] HistoryError),

    /// Command needs a FAIR project, but none was found.
    #[error("not a FAIR project (or any parent up to home): {0:?}, run `fair init`")]
    Uninitialised(PathBuf),

    /// Project already set up.
    #[error("FAIR project already initialised at {0:?}")]
    AlreadyInitialised(PathBuf),

    /// Run has nothing to execute.
    #[error("no command to run, pass one or set 'run_metadata.script' in {0:?}")]
    NoScript(PathBuf),

    /// Run script exited unsuccessfully.
    #[error("run script failed with {0}")]
    JobFailed(ExitStatus),

    /// User interrupted the command.
    #[error("interrupted")]
    Interrupted,

    /// Git repository of the project cannot be read.
    #[error(transparent)]
    Git(#[from] git2::Error),

    /// File access failed.
    #[error("cannot access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Construct [`Error::Io`] for path.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_)
            | Self::Uninitialised(_)
            | Self::AlreadyInitialised(_)
            | Self::NoScript(_) => ErrorKind::InvalidConfiguration,
            Self::Resolve(ResolveError::MultipleWildcards { .. }) => ErrorKind::InvalidConfiguration,
            Self::Resolve(_) | Self::Query(_) => ErrorKind::RegistryQueryFailed,
            Self::Server(ServerError::Probe(_)) => ErrorKind::RegistryQueryFailed,
            Self::Server(_) => ErrorKind::ServerLifecycle,
            Self::Staging(_) => ErrorKind::Staging,
            Self::JobFailed(_) | Self::Interrupted => ErrorKind::Run,
            Self::History(HistoryError::UnknownRun(_)) => ErrorKind::InvalidConfiguration,
            Self::History(_) => ErrorKind::Run,
            Self::NoWayHome(_) | Self::Git(_) | Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Server(error) => error.severity(),
            Self::Staging(error) => error.severity(),
            Self::AlreadyInitialised(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Process exit status to report this error with.
    pub fn exit_code(&self) -> i32 {
        match (self, self.severity()) {
            (_, Severity::Warning) => 0,
            (Self::Interrupted, _) => 130,
            (_, Severity::Error) => 1,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn classify_errors() {
        let error = Error::from(ResolveError::MultipleWildcards {
            index: 0,
            fields: vec!["a".into(), "b".into()],
        });
        assert_eq!(error.kind(), ErrorKind::InvalidConfiguration);
        assert_eq!(error.severity(), Severity::Error);
        assert_eq!(error.exit_code(), 1);

        let error = Error::from(QueryError::InvalidKind("".into()));
        assert_eq!(error.kind(), ErrorKind::RegistryQueryFailed);

        let error = Error::from(ServerError::PortInUse { port: 8000 });
        assert_eq!(error.kind(), ErrorKind::ServerLifecycle);
        assert_eq!(error.exit_code(), 1);

        assert_eq!(Error::Interrupted.kind(), ErrorKind::Run);
        assert_eq!(Error::Interrupted.exit_code(), 130);

        let error = Error::from(HistoryError::UnknownRun("nope".into()));
        assert_eq!(error.kind(), ErrorKind::InvalidConfiguration);
        assert_eq!(error.exit_code(), 1);

        let error = Error::from(git2::Error::from_str("bad repository"));
        assert_eq!(error.kind(), ErrorKind::Io);
    }

    #[test]
    fn warnings_exit_cleanly() {
        for error in [
            Error::from(ServerError::NotRunning),
            Error::from(StagingError::Untracked("model.py".into())),
            Error::AlreadyInitialised(PathBuf::from("/project")),
        ] {
            assert_eq!(error.severity(), Severity::Warning);
            assert_eq!(error.exit_code(), 0);
        }
    }
}
