// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Server process record.
//!
//! The __server process record__ identifies the local registry server that
//! FAIR launched: its process id and the port it is bound to. The record is
//! kept in a small TOML file under the registry home, so that a later
//! invocation of FAIR can find the server again to check or stop it.
//!
//! There is at most one record per registry home. Read-then-act sequences on
//! the record are serialized across processes through an advisory lock on a
//! sibling `.lock` file, see [`RecordFile::lock`].

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Identity of a launched registry server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerRecord {
    /// Process id of the server.
    pub pid: u32,

    /// Port the server is bound to.
    pub port: u16,
}

impl FromStr for ServerRecord {
    type Err = RecordError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(RecordError::Deserialize)
    }
}

impl Display for ServerRecord {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string(self)
                .map_err(|_| FmtError)?
                .as_str(),
        )
    }
}

/// File holding the server process record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFile {
    path: PathBuf,
}

impl RecordFile {
    /// Construct new record file handle.
    ///
    /// Nothing is read or written until asked.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Read current record.
    ///
    /// # Errors
    ///
    /// - Return [`RecordError::Io`] if file exists but cannot be read.
    /// - Return [`RecordError::Deserialize`] if file is corrupted.
    pub fn load(&self) -> Result<Option<ServerRecord>> {
        match fs::read_to_string(&self.path) {
            Ok(data) => Ok(Some(data.parse()?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(RecordError::Io {
                path: self.path.clone(),
                source: error,
            }),
        }
    }

    /// Replace current record.
    ///
    /// # Errors
    ///
    /// - Return [`RecordError::Io`] if file cannot be written.
    pub fn store(&self, record: &ServerRecord) -> Result<()> {
        debug!("record server pid {} on port {}", record.pid, record.port);
        if let Some(parent) = self.path.parent() {
            mkdirp::mkdirp(parent).map_err(|source| RecordError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(&self.path, record.to_string()).map_err(|source| RecordError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Delete record, doing nothing if there is none.
    ///
    /// # Errors
    ///
    /// - Return [`RecordError::Io`] if existing file cannot be removed.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("removed server record {:?}", self.path.display());
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(RecordError::Io {
                path: self.path.clone(),
                source: error,
            }),
        }
    }

    /// Take exclusive advisory lock over the record.
    ///
    /// Blocks until every other holder has released it. The lock is released
    /// when the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// - Return [`RecordError::Io`] if lock file cannot be opened or locked.
    pub fn lock(&self) -> Result<RecordLock> {
        let path = self.path.with_extension("lock");
        if let Some(parent) = path.parent() {
            mkdirp::mkdirp(parent).map_err(|source| RecordError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| RecordError::Io {
                path: path.clone(),
                source,
            })?;
        FileExt::lock_exclusive(&file).map_err(|source| RecordError::Io { path, source })?;

        Ok(RecordLock { file })
    }
}

/// Exclusive hold over the server process record.
#[derive(Debug)]
pub struct RecordLock {
    file: File,
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Server process record error types.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// Record file cannot be accessed.
    #[error("cannot access server record {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record file is corrupted.
    #[error("corrupted server record, stop any stray registry server and delete it")]
    Deserialize(#[from] toml::de::Error),
}

/// Friendly result alias :3
type Result<T, E = RecordError> = std::result::Result<T, E>;
