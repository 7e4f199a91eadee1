// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for the files FAIR manages. There are
//! two roots to care about: the __registry home__ shared by every project of
//! the current user, and the __project root__ that holds a `.fair` directory.
//!
//! # Registry Home Layout
//!
//! ```text
//! $HOME/.scrc/
//! ├── cli/cli-config.toml     global CLI configuration
//! ├── data/coderun/           job directories created by `fair run`
//! ├── registry/               local registry installation
//! ├── session.toml            server process record
//! └── session.lock            advisory lock guarding the record
//! ```
//!
//! # Project Layout
//!
//! ```text
//! <project>/
//! ├── config.yaml             user config with read and write blocks
//! └── .fair/
//!     ├── cli-config.toml     project CLI configuration
//!     └── staging.toml        staging index
//! ```

use std::path::{Path, PathBuf};

/// Name of the hidden project directory.
pub const FAIR_FOLDER: &str = ".fair";

/// Name of CLI configuration file, both global and per project.
pub const CLI_CONFIG_FILE: &str = "cli-config.toml";

/// Name of user config file at the project root.
pub const USER_CONFIG_FILE: &str = "config.yaml";

/// Environment variable that overrides the registry home.
pub const REGISTRY_HOME_ENV: &str = "FAIR_REGISTRY_HOME";

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to registry home directory.
///
/// Uses `$FAIR_REGISTRY_HOME` when set, otherwise `$HOME/.scrc`. Does not
/// check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_registry_home() -> Result<PathBuf> {
    match std::env::var_os(REGISTRY_HOME_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => home_dir().map(|home| home.join(".scrc")),
    }
}

/// Locate the project root by searching upward for a `.fair` directory.
///
/// Search begins at `start` and stops before reaching `stop`, which is
/// normally the user's home directory.
pub fn find_project_root(start: impl AsRef<Path>, stop: impl AsRef<Path>) -> Option<PathBuf> {
    for dir in start.as_ref().ancestors() {
        if dir == stop.as_ref() {
            break;
        }

        if dir.join(FAIR_FOLDER).is_dir() {
            return Some(dir.to_path_buf());
        }
    }

    None
}

/// Every path FAIR needs for one invocation.
///
/// Built once at start up and handed out by reference, so nothing in the
/// crate reaches for the home directory on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    registry_home: PathBuf,
    project_root: Option<PathBuf>,
}

impl Layout {
    /// Construct layout from explicit roots.
    pub fn new(registry_home: impl Into<PathBuf>, project_root: Option<PathBuf>) -> Self {
        Self {
            registry_home: registry_home.into(),
            project_root,
        }
    }

    /// Construct layout by discovering the project root from `start`.
    ///
    /// # Errors
    ///
    /// - Return [`NoWayHome`] if home directory path cannot be determined.
    pub fn discover(start: impl AsRef<Path>) -> Result<Self> {
        let registry_home = default_registry_home()?;
        let project_root = find_project_root(start, home_dir()?);
        Ok(Self::new(registry_home, project_root))
    }

    /// Same layout rooted at a different project directory.
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn registry_home(&self) -> &Path {
        self.registry_home.as_path()
    }

    pub fn global_config_dir(&self) -> PathBuf {
        self.registry_home.join("cli")
    }

    pub fn global_cli_config(&self) -> PathBuf {
        self.global_config_dir().join(CLI_CONFIG_FILE)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.registry_home.join("data")
    }

    pub fn coderun_dir(&self) -> PathBuf {
        self.data_dir().join("coderun")
    }

    /// Default install directory of the local registry.
    pub fn registry_install_dir(&self) -> PathBuf {
        self.registry_home.join("registry")
    }

    /// File holding the server process record.
    pub fn session_record(&self) -> PathBuf {
        self.registry_home.join("session.toml")
    }

    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    pub fn fair_dir(&self) -> Option<PathBuf> {
        self.project_root().map(|root| root.join(FAIR_FOLDER))
    }

    pub fn local_cli_config(&self) -> Option<PathBuf> {
        self.fair_dir().map(|dir| dir.join(CLI_CONFIG_FILE))
    }

    pub fn staging_file(&self) -> Option<PathBuf> {
        self.fair_dir().map(|dir| dir.join("staging.toml"))
    }

    pub fn user_config(&self) -> Option<PathBuf> {
        self.project_root().map(|root| root.join(USER_CONFIG_FILE))
    }
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
