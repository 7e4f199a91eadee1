// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Staging index layout.
//!
//! The __staging index__ lists the project files FAIR tracks, together with
//! a flag telling whether each file is staged for the next push. It lives
//! in `.fair/staging.toml`:
//!
//! ```toml
//! [files]
//! "data/input.csv" = true
//! "model.py" = false
//! ```
//!
//! Paths are kept relative to the project root with `/` separators. File
//! I/O is left to the caller.

use crate::error::Severity;

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Staging index layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct StagingIndex {
    #[serde(default)]
    files: BTreeMap<String, bool>,
}

impl StagingIndex {
    /// Track file and mark it staged.
    ///
    /// Returns whether the file was not staged before.
    pub fn stage(&mut self, path: impl Into<String>) -> bool {
        let path = path.into();
        debug!("stage {path:?}");
        self.files.insert(path, true) != Some(true)
    }

    /// Keep tracking file but mark it unstaged.
    ///
    /// # Errors
    ///
    /// - Return [`StagingError::Untracked`] if file is not tracked.
    pub fn unstage(&mut self, path: &str) -> Result<()> {
        let staged = self
            .files
            .get_mut(path)
            .ok_or_else(|| StagingError::Untracked(path.into()))?;
        debug!("unstage {path:?}");
        *staged = false;
        Ok(())
    }

    /// Stop tracking file.
    ///
    /// # Errors
    ///
    /// - Return [`StagingError::Untracked`] if file is not tracked.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        if self.files.remove(path).is_none() {
            return Err(StagingError::Untracked(path.into()));
        }

        debug!("untrack {path:?}");
        Ok(())
    }

    pub fn is_tracked(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Tracked files split by staging flag.
    pub fn status(&self) -> StagingStatus<'_> {
        let (staged, unstaged) = self.files.iter().partition::<Vec<_>, _>(|(_, staged)| **staged);
        StagingStatus {
            staged: staged.into_iter().map(|(path, _)| path.as_str()).collect(),
            unstaged: unstaged.into_iter().map(|(path, _)| path.as_str()).collect(),
        }
    }
}

impl FromStr for StagingIndex {
    type Err = StagingError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(StagingError::Deserialize)
    }
}

impl Display for StagingIndex {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(|_| FmtError)?
                .as_str(),
        )
    }
}

/// Tracked files split by staging flag, in path order.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct StagingStatus<'a> {
    pub staged: Vec<&'a str>,
    pub unstaged: Vec<&'a str>,
}

/// Expand path patterns into project-relative file paths.
///
/// Relative patterns are taken relative to `cwd`. Plain paths are patterns
/// that match themselves. Directories are skipped, and a file matched by
/// several patterns is listed once.
///
/// # Errors
///
/// - Return [`StagingError::Pattern`] if a pattern is malformed.
/// - Return [`StagingError::NoMatch`] if a pattern matches no file.
/// - Return [`StagingError::OutsideProject`] if a match is not below
///   `root`.
pub fn expand_patterns(
    root: impl AsRef<Path>,
    cwd: impl AsRef<Path>,
    patterns: &[String],
) -> Result<Vec<String>> {
    let root = canonical(root.as_ref())?;
    let cwd = cwd.as_ref();
    let mut paths = Vec::new();

    for pattern in patterns {
        let full = cwd.join(pattern);
        let mut matched = false;
        for entry in glob::glob(&full.to_string_lossy())? {
            let path = entry.map_err(|error| StagingError::Io {
                path: error.path().to_path_buf(),
                source: error.into_error(),
            })?;
            if path.is_dir() {
                continue;
            }

            matched = true;
            paths.push(project_relative(&root, &path)?);
        }

        if !matched {
            return Err(StagingError::NoMatch(pattern.clone()));
        }
    }

    let mut seen = BTreeSet::new();
    paths.retain(|path| seen.insert(path.clone()));
    Ok(paths)
}

/// Path of file relative to project root, with `/` separators.
///
/// # Errors
///
/// - Return [`StagingError::OutsideProject`] if path is not below root.
pub fn project_relative(root: &Path, path: &Path) -> Result<String> {
    let path = canonical(path)?;
    let relative = path
        .strip_prefix(root)
        .map_err(|_| StagingError::OutsideProject(path.clone()))?;

    Ok(relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Staging error types.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// File is not tracked.
    #[error("{0:?} is not tracked")]
    Untracked(String),

    /// Pattern is malformed.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    /// Pattern matched no file.
    #[error("{0:?} did not match any file")]
    NoMatch(String),

    /// File lies outside of project.
    #[error("{0:?} is outside of the FAIR project")]
    OutsideProject(PathBuf),

    /// File cannot be accessed.
    #[error("cannot access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to deserialize staging index.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),
}

impl StagingError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Untracked(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// Friendly result alias :3
type Result<T, E = StagingError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn staging_transitions() -> anyhow::Result<()> {
        let mut index = StagingIndex::default();
        assert!(index.stage("model.py"));
        assert!(!index.stage("model.py"));
        index.stage("data/input.csv");

        index.unstage("model.py")?;
        assert_eq!(
            index.status(),
            StagingStatus {
                staged: vec!["data/input.csv"],
                unstaged: vec!["model.py"],
            }
        );

        assert!(index.stage("model.py"));
        index.remove("data/input.csv")?;
        assert!(!index.is_tracked("data/input.csv"));
        assert_eq!(index.status().staged, vec!["model.py"]);

        Ok(())
    }

    #[test]
    fn untracked_files_are_warnings() {
        let mut index = StagingIndex::default();

        let error = index.unstage("nope").expect_err("untracked");
        assert!(matches!(error, StagingError::Untracked(ref path) if path == "nope"));
        assert_eq!(error.severity(), Severity::Warning);

        assert!(matches!(index.remove("nope"), Err(StagingError::Untracked(_))));
    }

    #[test]
    fn staging_index_round_trip() -> anyhow::Result<()> {
        let mut index = StagingIndex::default();
        index.stage("data/input.csv");
        index.stage("model.py");
        index.unstage("model.py")?;

        let text = index.to_string();
        assert!(text.contains("[files]"));
        assert!(text.contains(r#""data/input.csv" = true"#));
        assert!(text.contains(r#""model.py" = false"#));
        assert_eq!(text.parse::<StagingIndex>()?, index);
        assert_eq!("".parse::<StagingIndex>()?, StagingIndex::default());

        Ok(())
    }

    #[test]
    fn expand_patterns_relative_to_cwd() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        fs::create_dir_all(root.path().join("data/raw"))?;
        fs::write(root.path().join("data/a.csv"), "")?;
        fs::write(root.path().join("data/b.csv"), "")?;
        fs::write(root.path().join("data/notes.txt"), "")?;
        fs::write(root.path().join("model.py"), "")?;

        let cwd = root.path().join("data");
        let result = expand_patterns(
            root.path(),
            &cwd,
            &["*.csv".into(), "../model.py".into(), "*".into()],
        )?;

        assert_eq!(
            result,
            vec![
                "data/a.csv".to_string(),
                "data/b.csv".into(),
                "model.py".into(),
                "data/notes.txt".into(),
            ]
        );

        Ok(())
    }

    #[test]
    fn expand_patterns_rejects_unmatched_and_outside() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let root = home.path().join("project");
        fs::create_dir_all(&root)?;
        fs::write(home.path().join("outside.txt"), "")?;

        let result = expand_patterns(&root, &root, &["*.nothing".into()]);
        assert!(matches!(result, Err(StagingError::NoMatch(_))));

        let result = expand_patterns(&root, &root, &["../outside.txt".into()]);
        assert!(matches!(result, Err(StagingError::OutsideProject(_))));

        Ok(())
    }
}
