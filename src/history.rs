// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run history.
//!
//! Every `fair run` leaves a __job directory__ under the coderun directory,
//! named after the moment it was prepared:
//!
//! ```text
//! data/coderun/2025-03-01_14_02_11_123456789/
//! ├── config.yaml     resolved user config
//! ├── run.toml        run record
//! └── run.log         combined output of the script
//! ```
//!
//! The run record is written before the script starts and completed once it
//! exits. A run that was interrupted keeps a record without an outcome.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::ExitStatus,
    str::FromStr,
};
use tracing::{debug, warn};

/// File holding the run record inside a job directory.
pub const RECORD_FILE: &str = "run.toml";

/// File holding script output inside a job directory.
pub const LOG_FILE: &str = "run.log";

/// What a run executed and how it ended.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunRecord {
    /// Shell command of the run.
    pub script: String,

    /// Directory the script ran in.
    pub working_dir: PathBuf,

    /// Start time in RFC 3339.
    pub started: String,

    /// End time in RFC 3339, missing while running or if interrupted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Exit code, missing if the script was killed by a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RunRecord {
    /// Construct record of a run starting now.
    pub fn start(script: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            working_dir: working_dir.into(),
            started: chrono::Local::now().to_rfc3339(),
            finished: None,
            success: None,
            exit_code: None,
        }
    }

    /// Complete record with the exit status of the script.
    pub fn finish(&mut self, status: &ExitStatus) {
        self.finished = Some(chrono::Local::now().to_rfc3339());
        self.success = Some(status.success());
        self.exit_code = status.code();
    }

    /// Short description of how the run ended.
    pub fn outcome(&self) -> String {
        match (self.success, self.exit_code) {
            (None, _) => "unfinished".into(),
            (Some(true), _) => "ok".into(),
            (Some(false), Some(code)) => format!("failed ({code})"),
            (Some(false), None) => "killed".into(),
        }
    }

    /// Read record of job directory.
    ///
    /// # Errors
    ///
    /// - Return [`HistoryError::Io`] if record cannot be read.
    /// - Return [`HistoryError::Deserialize`] if record is corrupted.
    pub fn load(job_dir: &Path) -> Result<Self> {
        let path = job_dir.join(RECORD_FILE);
        let data = fs::read_to_string(&path).map_err(|source| HistoryError::Io { path, source })?;
        data.parse()
    }

    /// Write record into job directory.
    ///
    /// # Errors
    ///
    /// - Return [`HistoryError::Io`] if record cannot be written.
    pub fn store(&self, job_dir: &Path) -> Result<()> {
        let path = job_dir.join(RECORD_FILE);
        fs::write(&path, self.to_string()).map_err(|source| HistoryError::Io { path, source })
    }
}

impl FromStr for RunRecord {
    type Err = HistoryError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(HistoryError::Deserialize)
    }
}

impl Display for RunRecord {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string(self)
                .map_err(|_| FmtError)?
                .as_str(),
        )
    }
}

/// Run found in the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEntry {
    /// Name of the job directory.
    pub id: String,

    pub record: RunRecord,
}

/// Job directories of every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHistory {
    dir: PathBuf,
}

impl RunHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// List runs that executed in `working_dir`, oldest first.
    ///
    /// Job directories without a readable record are skipped.
    ///
    /// # Errors
    ///
    /// - Return [`HistoryError::Io`] if coderun directory cannot be read.
    pub fn list(&self, working_dir: &Path) -> Result<Vec<RunEntry>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HistoryError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| HistoryError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };

            match RunRecord::load(&entry.path()) {
                Ok(record) if record.working_dir == working_dir => runs.push(RunEntry { id, record }),
                Ok(_) => debug!("run {id} belongs to another project"),
                Err(error) => warn!("skip run {id}: {error}"),
            }
        }

        // INVARIANT: Job directory names sort chronologically.
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runs)
    }

    /// Find run by id.
    ///
    /// # Errors
    ///
    /// - Return [`HistoryError::UnknownRun`] if no such run exists.
    /// - Return [`HistoryError`] if its record cannot be read.
    pub fn get(&self, run_id: &str) -> Result<RunEntry> {
        let dir = self.job_dir(run_id)?;
        let record = RunRecord::load(&dir)?;
        Ok(RunEntry {
            id: run_id.into(),
            record,
        })
    }

    /// Read output of a run.
    ///
    /// # Errors
    ///
    /// - Return [`HistoryError::UnknownRun`] if no such run exists.
    /// - Return [`HistoryError::Io`] if its log cannot be read.
    pub fn log(&self, run_id: &str) -> Result<String> {
        let path = self.job_dir(run_id)?.join(LOG_FILE);
        match fs::read(&path) {
            Ok(data) => Ok(String::from_utf8_lossy(&data).into_owned()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(HistoryError::Io { path, source }),
        }
    }

    fn job_dir(&self, run_id: &str) -> Result<PathBuf> {
        // INVARIANT: Run ids name a direct child of the coderun directory.
        if run_id.is_empty() || run_id == "." || run_id == ".." || run_id.contains(['/', '\\']) {
            return Err(HistoryError::UnknownRun(run_id.into()));
        }

        let dir = self.dir.join(run_id);
        if !dir.join(RECORD_FILE).is_file() {
            return Err(HistoryError::UnknownRun(run_id.into()));
        }

        Ok(dir)
    }
}

/// Run history error types.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// No job directory for run id.
    #[error("no run {0:?}, see `fair log`")]
    UnknownRun(String),

    /// Job directory cannot be accessed.
    #[error("cannot access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Run record is corrupted.
    #[error("corrupted run record")]
    Deserialize(#[from] toml::de::Error),
}

/// Friendly result alias :3
type Result<T, E = HistoryError> = std::result::Result<T, E>;
