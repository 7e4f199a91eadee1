// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for configuration files that FAIR uses to simplify
//! the process of serialization and deserialization. File I/O is left to the
//! caller to figure out.
//!
//! Two kinds of configuration exist. The __CLI configuration__ is owned by the
//! tool and stored as TOML, once globally and once per project. The
//! __user config__ is authored by the user as YAML and lists what a run reads
//! from and writes to the registry, see [`user`].

pub mod user;

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};
use url::Url;

/// CLI configuration layout.
///
/// # General Layout
///
/// ```toml
/// [user]
/// name = "Jane Doe"
/// email = "jane@doe.org"
///
/// [registries.local]
/// port = 8000
///
/// [registries.remote.origin]
/// uri = "https://data.scrc.uk/api/"
/// token_file = "~/.scrc/token"
///
/// [git]
/// local_repo = "/home/jane/project"
/// remote = "git@github.com:jane/project.git"
/// ```
///
/// Every table is optional. A project configuration is layered on top of the
/// global one through [`CliConfig::layered`].
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct CliConfig {
    /// Identity recorded against runs.
    #[serde(default)]
    pub user: UserSettings,

    /// Local and remote registries.
    #[serde(default)]
    pub registries: Registries,

    /// Git repository the project lives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSettings>,
}

impl CliConfig {
    /// Layer project configuration over global configuration.
    ///
    /// Values set by the project win. Remote listings are merged by label.
    pub fn layered(global: Option<Self>, local: Option<Self>) -> Self {
        let (global, local) = match (global, local) {
            (None, None) => return Self::default(),
            (Some(config), None) | (None, Some(config)) => return config,
            (Some(global), Some(local)) => (global, local),
        };

        let mut remotes = global.registries.remotes;
        remotes.extend(local.registries.remotes);

        Self {
            user: UserSettings {
                name: local.user.name.or(global.user.name),
                email: local.user.email.or(global.user.email),
            },
            registries: Registries {
                local: local.registries.local.or(global.registries.local),
                remotes,
            },
            git: local.git.or(global.git),
        }
    }

    /// Settings of local registry, falling back to defaults.
    pub fn local_registry(&self) -> LocalRegistry {
        self.registries.local.clone().unwrap_or_default()
    }

    /// Lookup remote registry by label.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownRemote`] if no remote has that label.
    pub fn remote(&self, label: &str) -> Result<&RemoteRegistry> {
        self.registries
            .remotes
            .get(label)
            .ok_or_else(|| ConfigError::UnknownRemote(label.into()))
    }

    /// Register a new remote.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::RemoteExists`] if label is taken.
    /// - Return [`ConfigError::InvalidUri`] if uri cannot be parsed.
    pub fn add_remote(&mut self, label: impl Into<String>, uri: impl Into<String>) -> Result<()> {
        let label = label.into();
        let uri = uri.into();
        parse_uri(&uri)?;

        if self.registries.remotes.contains_key(&label) {
            return Err(ConfigError::RemoteExists(label));
        }

        self.registries
            .remotes
            .insert(label, RemoteRegistry { uri, token_file: None });

        Ok(())
    }

    /// Remove remote by label.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownRemote`] if no remote has that label.
    pub fn remove_remote(&mut self, label: &str) -> Result<RemoteRegistry> {
        self.registries
            .remotes
            .remove(label)
            .ok_or_else(|| ConfigError::UnknownRemote(label.into()))
    }

    /// Point existing remote at a new uri.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownRemote`] if no remote has that label.
    /// - Return [`ConfigError::InvalidUri`] if uri cannot be parsed.
    pub fn modify_remote(&mut self, label: &str, uri: impl Into<String>) -> Result<()> {
        let uri = uri.into();
        parse_uri(&uri)?;

        let remote = self
            .registries
            .remotes
            .get_mut(label)
            .ok_or_else(|| ConfigError::UnknownRemote(label.into()))?;
        remote.uri = uri;

        Ok(())
    }
}

impl FromStr for CliConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: CliConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path-valued fields.
        if let Some(local) = config.registries.local.as_mut() {
            if let Some(dir) = local.install_dir.take() {
                local.install_dir = Some(expand_path(&dir)?);
            }
        }

        for remote in config.registries.remotes.values_mut() {
            if let Some(file) = remote.token_file.take() {
                remote.token_file = Some(expand_path(&file)?);
            }
        }

        Ok(config)
    }
}

impl Display for CliConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Identity of the user.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct UserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Registries known to the CLI.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Registries {
    /// Locally hosted registry server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalRegistry>,

    /// Remote registries keyed by label.
    #[serde(default, rename = "remote", skip_serializing_if = "BTreeMap::is_empty")]
    pub remotes: BTreeMap<String, RemoteRegistry>,
}

/// Remote registry listing.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RemoteRegistry {
    /// Base uri of registry API.
    pub uri: String,

    /// File containing API token for the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
}

impl RemoteRegistry {
    /// Parse base uri.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidUri`] if uri cannot be parsed.
    pub fn parsed_uri(&self) -> Result<Url> {
        parse_uri(&self.uri)
    }
}

/// Settings for the locally hosted registry server.
///
/// The launch command is given as `program` plus `args`, where `{host}` and
/// `{port}` placeholders are substituted at launch. A relative `program` with
/// more than one path component is resolved against the install directory.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalRegistry {
    /// Interface the server binds to.
    pub host: String,

    /// Port the server binds to.
    pub port: u16,

    /// Path of the API below the server root.
    pub api_path: String,

    /// Install directory, defaults to `<registry_home>/registry`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,

    /// Git repository to install the registry from.
    pub source: String,

    /// Branch or tag to install from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Program launching the server.
    pub program: String,

    /// Arguments of launch program.
    pub args: Vec<String>,

    /// Extra environment of install steps and server.
    pub env: BTreeMap<String, String>,

    /// Commands run in install directory after cloning the source.
    pub setup: Vec<Vec<String>>,

    /// Delay between health checks while starting.
    pub poll_interval_ms: u64,

    /// Number of health checks before launch gives up.
    pub poll_attempts: u32,

    /// Grace period of a graceful stop before the process is killed.
    pub stop_timeout_ms: u64,

    /// Timeout of a single health check.
    pub probe_timeout_ms: u64,
}

impl Default for LocalRegistry {
    fn default() -> Self {
        let python = "venv/bin/python";
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            api_path: "api/".into(),
            install_dir: None,
            source: "https://github.com/FAIRDataPipeline/data-registry.git".into(),
            reference: None,
            program: python.into(),
            args: vec!["manage.py".into(), "runserver".into(), "{host}:{port}".into()],
            env: BTreeMap::from([(
                "DJANGO_SETTINGS_MODULE".into(),
                "drams.local-settings".into(),
            )]),
            setup: vec![
                vec!["python3".into(), "-m".into(), "venv".into(), "venv".into()],
                vec![
                    python.into(),
                    "-m".into(),
                    "pip".into(),
                    "install".into(),
                    "-r".into(),
                    "local-requirements.txt".into(),
                ],
                vec![python.into(), "manage.py".into(), "migrate".into()],
                vec![
                    python.into(),
                    "manage.py".into(),
                    "collectstatic".into(),
                    "--noinput".into(),
                ],
            ],
            poll_interval_ms: 1000,
            poll_attempts: 20,
            stop_timeout_ms: 10_000,
            probe_timeout_ms: 2000,
        }
    }
}

impl LocalRegistry {
    /// Root url of the server, target of health checks.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidUri`] if host does not form a valid url.
    pub fn base_url(&self) -> Result<Url> {
        parse_uri(&format!("http://{}:{}/", self.host, self.port))
    }

    /// Url of the registry API.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidUri`] if host or api path do not form a
    ///   valid url.
    pub fn uri(&self) -> Result<Url> {
        let base = self.base_url()?;
        base.join(&self.api_path).map_err(|source| ConfigError::InvalidUri {
            uri: format!("{base}{}", self.api_path),
            source,
        })
    }
}

/// Git repository the project lives in.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct GitSettings {
    /// Working directory of the repository.
    pub local_repo: PathBuf,

    /// Url of the repository's "origin" remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

fn parse_uri(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|source| ConfigError::InvalidUri {
        uri: uri.into(),
        source,
    })
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to read or write YAML user config.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Registry uri is malformed.
    #[error("invalid registry uri {uri:?}")]
    InvalidUri {
        uri: String,
        #[source]
        source: url::ParseError,
    },

    /// No remote registered under label.
    #[error("no remote named {0:?}")]
    UnknownRemote(String),

    /// Remote label already taken.
    #[error("remote {0:?} already exists")]
    RemoteExists(String),

    /// User config entry has more than one globbable value.
    #[error(
        "entry {index} of '{section}' has globbable values in {fields:?}, only one \
         key-value pair per entry may contain a wildcard"
    )]
    MultipleWildcards {
        section: user::Section,
        index: usize,
        fields: Vec<String>,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
