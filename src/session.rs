// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Invocation context.
//!
//! A [`Session`] carries everything one invocation of FAIR needs: the path
//! [`Layout`], the global and project CLI configurations, and the layered
//! view of both. It is built once at start up and handed to each command by
//! reference.
//!
//! Project-level edits (remotes, user identity) go to the project CLI
//! configuration when there is a project, and to the global one otherwise.

use crate::{
    config::{
        user::{ConfigEntry, Section, UserConfig},
        CliConfig, GitSettings,
    },
    error::{Error, Result},
    history::{self, RunEntry, RunHistory, RunRecord},
    path::Layout,
    registry::{
        client::RegistryClient,
        record::RecordFile,
        server::{RegistryServer, ServerSettings},
        RegistryEndpoint, RegistryOrigin,
    },
    resolve::{GlobOptions, GlobResolver},
    staging::{self, StagingError, StagingIndex},
};

use git2::{ErrorCode, Repository};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Split},
    process::Child,
};
use tracing::{debug, info, instrument, warn};

/// Environment variable pointing a job at its directory.
pub const JOB_DIR_ENV: &str = "FDP_CONFIG_DIR";

/// Environment variable carrying the local registry token to a job.
pub const JOB_TOKEN_ENV: &str = "FDP_LOCAL_TOKEN";

/// Context of one FAIR invocation.
#[derive(Debug, Clone)]
pub struct Session {
    cwd: PathBuf,
    layout: Layout,
    global: CliConfig,
    local: Option<CliConfig>,
    config: CliConfig,
}

impl Session {
    /// Open session for working directory, discovering the project root.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NoWayHome`] if home directory cannot be determined.
    /// - Return [`Error::Config`] if a CLI configuration is malformed.
    pub fn open(cwd: impl Into<PathBuf>) -> Result<Self> {
        let cwd = cwd.into();
        let layout = Layout::discover(&cwd)?;
        Self::with_layout(cwd, layout)
    }

    /// Open session over explicit layout.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if a CLI configuration is malformed.
    #[instrument(skip(cwd, layout), level = "debug")]
    pub fn with_layout(cwd: impl Into<PathBuf>, layout: Layout) -> Result<Self> {
        let global = read_cli_config(&layout.global_cli_config())?;
        let local = match layout.local_cli_config() {
            Some(path) => read_cli_config(&path)?,
            None => None,
        };
        let config = CliConfig::layered(global.clone(), local.clone());
        debug!("session over {layout:?}");

        Ok(Self {
            cwd: cwd.into(),
            layout,
            global: global.unwrap_or_default(),
            local,
            config,
        })
    }

    pub fn cwd(&self) -> &Path {
        self.cwd.as_path()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Layered CLI configuration.
    pub fn config(&self) -> &CliConfig {
        &self.config
    }

    /// Root of current project.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Uninitialised`] if not inside a FAIR project.
    pub fn project_root(&self) -> Result<&Path> {
        self.layout
            .project_root()
            .ok_or_else(|| Error::Uninitialised(self.cwd.clone()))
    }

    /// Set up a FAIR project in the working directory.
    ///
    /// Seeds the project CLI configuration from the global one and from the
    /// git repository the directory belongs to, if any. Writes a starter user
    /// config unless one exists at `user_config`, and an empty staging index.
    ///
    /// # Errors
    ///
    /// - Return [`Error::AlreadyInitialised`] if working directory already
    ///   is a project root.
    /// - Return [`Error::Git`] if enclosing git repository cannot be read.
    /// - Return [`Error`] if files cannot be written.
    #[instrument(skip(self), level = "debug")]
    pub fn initialise(&mut self, user_config: Option<PathBuf>) -> Result<PathBuf> {
        if self.layout.project_root() == Some(self.cwd.as_path()) {
            return Err(Error::AlreadyInitialised(self.cwd.clone()));
        }

        let global_path = self.layout.global_cli_config();
        if !global_path.exists() {
            let mut global = self.global.clone();
            if global.user.name.is_none() || global.user.email.is_none() {
                seed_identity(&mut global);
            }
            write_file(&global_path, global.to_string())?;
            self.global = global;
        }

        self.layout = self.layout.clone().with_project_root(&self.cwd);
        let mut local = self.global.clone();
        local.git = discover_git(&self.cwd)?;
        self.store_local(local)?;

        let user_config = user_config.unwrap_or_else(|| self.cwd.join(crate::path::USER_CONFIG_FILE));
        if user_config.exists() {
            info!("keep existing user config {:?}", user_config.display());
        } else {
            self.make_starter_config(Some(user_config))?;
        }

        self.save_staging(&StagingIndex::default())?;
        info!("initialised FAIR project at {:?}", self.cwd.display());

        Ok(self.cwd.clone())
    }

    /// Write starter user config, replacing any existing one.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Uninitialised`] if no path is given and not inside a
    ///   FAIR project.
    /// - Return [`Error::Io`] if file cannot be written.
    pub fn make_starter_config(&self, path: Option<PathBuf>) -> Result<PathBuf> {
        let path = match path {
            Some(path) => path,
            None => self.user_config_path()?,
        };

        let mut starter = UserConfig::default();
        let metadata = &mut starter.run_metadata;
        metadata.description = Some("SEIRS Model".into());
        metadata.local_repo = self
            .config
            .git
            .as_ref()
            .map(|git| git.local_repo.to_string_lossy().into_owned())
            .or_else(|| self.layout.project_root().map(|root| root.to_string_lossy().into_owned()));
        metadata.script = Some(String::new());
        metadata.default_input_namespace = self.config.user.name.clone();
        metadata.default_output_namespace = self.config.user.name.clone();
        metadata.local_data_registry_url = self
            .config
            .local_registry()
            .uri()
            .ok()
            .map(|uri| uri.to_string());
        metadata.remote_data_registry_url = self
            .config
            .registries
            .remotes
            .get("origin")
            .map(|remote| remote.uri.clone());
        metadata.write_data_store = Some(self.layout.data_dir().to_string_lossy().into_owned());

        info!("write starter user config {:?}", path.display());
        write_file(&path, starter.to_string())?;

        Ok(path)
    }

    /// Path of user config at project root.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Uninitialised`] if not inside a FAIR project.
    pub fn user_config_path(&self) -> Result<PathBuf> {
        self.layout
            .user_config()
            .ok_or_else(|| Error::Uninitialised(self.cwd.clone()))
    }

    /// Read and validate user config.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if file cannot be read.
    /// - Return [`Error::Config`] if file is malformed or breaks the single
    ///   wildcard rule.
    pub fn load_user_config(&self, path: Option<PathBuf>) -> Result<(PathBuf, UserConfig)> {
        let path = match path {
            Some(path) => path,
            None => self.user_config_path()?,
        };
        let data = fs::read_to_string(&path).map_err(Error::io(&path))?;
        Ok((path, data.parse()?))
    }

    /// Endpoint of registry picked by origin.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if remote is unknown or its uri is invalid.
    /// - Return [`Error::Io`] if token file cannot be read.
    pub fn endpoint(&self, origin: &RegistryOrigin) -> Result<RegistryEndpoint> {
        match origin {
            RegistryOrigin::Local => {
                let uri = self.config.local_registry().uri()?;
                let token = self.registry_server()?.token()?;
                Ok(RegistryEndpoint::new(uri, token))
            }
            RegistryOrigin::Remote(label) => {
                let remote = self.config.remote(label)?;
                let token = match &remote.token_file {
                    Some(path) => Some(
                        fs::read_to_string(path)
                            .map_err(Error::io(path))?
                            .trim()
                            .to_string(),
                    ),
                    None => None,
                };
                Ok(RegistryEndpoint::new(remote.parsed_uri()?, token))
            }
        }
    }

    /// Manager of local registry server.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if local registry settings are invalid.
    pub fn registry_server(&self) -> Result<RegistryServer> {
        let settings = ServerSettings::from_config(&self.config.local_registry(), &self.layout)?;
        let record = RecordFile::new(self.layout.session_record());
        Ok(RegistryServer::new(settings, record)?)
    }

    /// Resolve wildcard entries against registry picked by origin.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Resolve`] if resolution fails.
    pub async fn glob(
        &self,
        entries: &[ConfigEntry],
        origin: &RegistryOrigin,
        options: &GlobOptions,
    ) -> Result<Vec<ConfigEntry>> {
        let client = RegistryClient::new(self.endpoint(origin)?)?;
        info!("resolve {} entries against {origin}", entries.len());
        Ok(GlobResolver::new(&client).resolve(entries, options).await?)
    }

    /// Resolve both sections of user config.
    ///
    /// Wildcard forms are dropped from the read section, but kept in the
    /// write section where they name the namespace to write into.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Resolve`] if resolution of either section fails.
    pub async fn resolve_user_config(
        &self,
        config: &UserConfig,
        origin: &RegistryOrigin,
        search_key: &str,
    ) -> Result<UserConfig> {
        let mut resolved = config.clone();
        for (section, remove_wildcard) in [(Section::Read, true), (Section::Write, false)] {
            let options = GlobOptions::default()
                .with_search_key(search_key)
                .remove_wildcard(remove_wildcard);
            let entries = self.glob(config.section(section), origin, &options).await?;
            resolved.set_section(section, entries);
        }

        Ok(resolved)
    }

    /// Read staging index of project.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Uninitialised`] if not inside a FAIR project.
    /// - Return [`Error::Staging`] if index is corrupted.
    pub fn staging(&self) -> Result<StagingIndex> {
        let path = self.staging_path()?;
        match fs::read_to_string(&path) {
            Ok(data) => Ok(data.parse()?),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(StagingIndex::default()),
            Err(source) => Err(Error::Io { path, source }),
        }
    }

    /// Replace staging index of project.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Uninitialised`] if not inside a FAIR project.
    /// - Return [`Error::Io`] if index cannot be written.
    pub fn save_staging(&self, index: &StagingIndex) -> Result<()> {
        write_file(&self.staging_path()?, index.to_string())
    }

    /// Stage files matching patterns.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Staging`] if a pattern is malformed or matches
    ///   nothing inside the project.
    pub fn stage(&self, patterns: &[String]) -> Result<Vec<String>> {
        let paths = staging::expand_patterns(self.project_root()?, &self.cwd, patterns)?;
        let mut index = self.staging()?;
        for path in &paths {
            if index.stage(path.as_str()) {
                info!("staged {path:?}");
            }
        }
        self.save_staging(&index)?;

        Ok(paths)
    }

    /// Unstage files matching patterns.
    ///
    /// Tracked files are unstaged even if some others are not tracked.
    ///
    /// # Errors
    ///
    /// - Return [`StagingError::Untracked`] as a warning for the first
    ///   untracked file.
    pub fn unstage(&self, patterns: &[String]) -> Result<Vec<String>> {
        let paths = staging::expand_patterns(self.project_root()?, &self.cwd, patterns)?;
        let mut index = self.staging()?;
        let untracked = apply_tracked(&paths, |path| index.unstage(path));
        self.save_staging(&index)?;

        untracked.map_or(Ok(paths), |error| Err(error.into()))
    }

    /// Stop tracking files matching patterns, deleting them unless `cached`.
    ///
    /// # Errors
    ///
    /// - Return [`StagingError::Untracked`] as a warning for the first
    ///   untracked file. Untracked files are never deleted.
    /// - Return [`Error::Io`] if a file cannot be deleted.
    pub fn remove_files(&self, patterns: &[String], cached: bool) -> Result<Vec<String>> {
        let root = self.project_root()?.to_path_buf();
        let paths = staging::expand_patterns(&root, &self.cwd, patterns)?;
        let mut index = self.staging()?;
        let mut removed = Vec::new();
        let untracked = apply_tracked(&paths, |path| {
            index.remove(path)?;
            removed.push(path.to_string());
            Ok(())
        });
        self.save_staging(&index)?;

        if !cached {
            for path in &removed {
                let file = root.join(path);
                info!("delete {:?}", file.display());
                fs::remove_file(&file).map_err(Error::io(&file))?;
            }
        }

        untracked.map_or(Ok(removed), |error| Err(error.into()))
    }

    /// Register remote registry.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if label is taken or uri is invalid.
    pub fn add_remote(&mut self, label: &str, uri: &str) -> Result<()> {
        self.edit_config(|config| Ok(config.add_remote(label, uri)?))?;
        info!("added remote {label:?} at {uri}");
        Ok(())
    }

    /// Forget remote registry.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if label is unknown.
    pub fn remove_remote(&mut self, label: &str) -> Result<()> {
        self.edit_config(|config| Ok(config.remove_remote(label).map(|_| ())?))?;
        info!("removed remote {label:?}");
        Ok(())
    }

    /// Point remote registry at new uri.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Config`] if label is unknown or uri is invalid.
    pub fn modify_remote(&mut self, label: &str, uri: &str) -> Result<()> {
        self.edit_config(|config| Ok(config.modify_remote(label, uri)?))?;
        info!("remote {label:?} now at {uri}");
        Ok(())
    }

    /// Set name recorded against runs.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if configuration cannot be written.
    pub fn set_user_name(&mut self, name: &str) -> Result<()> {
        self.edit_config(|config| {
            config.user.name = Some(name.into());
            Ok(())
        })
    }

    /// Set email recorded against runs.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if configuration cannot be written.
    pub fn set_user_email(&mut self, email: &str) -> Result<()> {
        self.edit_config(|config| {
            config.user.email = Some(email.into());
            Ok(())
        })
    }

    /// Delete FAIR state of project, and of user if `global` is set.
    ///
    /// The local registry installation is left alone, see
    /// [`RegistryServer::uninstall`]. Returns removed directories.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if a directory cannot be removed.
    #[instrument(skip(self), level = "debug")]
    pub fn purge(&self, global: bool) -> Result<Vec<PathBuf>> {
        let mut targets: Vec<PathBuf> = self.layout.fair_dir().into_iter().collect();
        if global {
            targets.push(self.layout.global_config_dir());
            targets.push(self.layout.data_dir());
        }

        let mut removed = Vec::new();
        for dir in targets {
            if !dir.exists() {
                debug!("nothing to purge at {:?}", dir.display());
                continue;
            }

            warn!("purge {:?}", dir.display());
            fs::remove_dir_all(&dir).map_err(Error::io(&dir))?;
            removed.push(dir);
        }

        Ok(removed)
    }

    /// Make `command` the run script of the user config at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if user config cannot be written.
    pub fn set_script(&self, path: &Path, config: &mut UserConfig, command: String) -> Result<()> {
        info!("set run script to {command:?}");
        config.run_metadata.script = Some(command);
        write_file(path, config.to_string())
    }

    /// Prepare job directory for a run of resolved user config.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NoScript`] if user config has no script.
    /// - Return [`Error::Io`] if job directory cannot be written.
    pub fn prepare_job(&self, source: &Path, resolved: &UserConfig) -> Result<Job> {
        let script = resolved
            .run_metadata
            .script
            .clone()
            .filter(|script| !script.trim().is_empty())
            .ok_or_else(|| Error::NoScript(source.to_path_buf()))?;

        let stamp = chrono::Local::now().format("%Y-%m-%d_%H_%M_%S_%f");
        let dir = self.layout.coderun_dir().join(stamp.to_string());
        let config_file = dir.join(crate::path::USER_CONFIG_FILE);
        write_file(&config_file, resolved.to_string())?;
        info!("prepared job at {:?}", dir.display());

        Ok(Job {
            dir,
            config_file,
            script,
            working_dir: self.run_dir().to_path_buf(),
        })
    }

    /// Execute job script with a shell.
    ///
    /// Output of the script is shown as it comes, and kept in the job
    /// directory along with a [`RunRecord`]. The script process is killed
    /// when the returned future is dropped, leaving the record unfinished.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if script cannot be started, or its output
    ///   cannot be kept.
    /// - Return [`Error::History`] if run record cannot be written.
    pub async fn run_job(&self, job: &Job, token: Option<String>) -> Result<ExitStatus> {
        info!("run {:?}", job.script);
        let mut record = RunRecord::start(&job.script, &job.working_dir);
        record.store(&job.dir)?;

        let log_path = job.dir.join(history::LOG_FILE);
        let mut log = tokio::fs::File::create(&log_path)
            .await
            .map_err(Error::io(&log_path))?;

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&job.script)
            .current_dir(&job.working_dir)
            .env(JOB_DIR_ENV, &job.dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = token {
            command.env(JOB_TOKEN_ENV, token);
        }

        let mut child = command.spawn().map_err(Error::io(&job.working_dir))?;
        let status = tee_output(&mut child, &mut log)
            .await
            .map_err(Error::io(&log_path))?;
        debug!("job finished with {status}");

        record.finish(&status);
        record.store(&job.dir)?;
        Ok(status)
    }

    /// Runs made from this project, oldest first.
    ///
    /// # Errors
    ///
    /// - Return [`Error::History`] if coderun directory cannot be read.
    pub fn history(&self) -> Result<Vec<RunEntry>> {
        Ok(self.run_history().list(self.run_dir())?)
    }

    /// Look up a run by id.
    ///
    /// # Errors
    ///
    /// - Return [`Error::History`] if no such run exists.
    pub fn run(&self, run_id: &str) -> Result<RunEntry> {
        Ok(self.run_history().get(run_id)?)
    }

    /// Recorded output of a run.
    ///
    /// # Errors
    ///
    /// - Return [`Error::History`] if no such run exists, or its log cannot
    ///   be read.
    pub fn run_log(&self, run_id: &str) -> Result<String> {
        Ok(self.run_history().log(run_id)?)
    }

    fn run_history(&self) -> RunHistory {
        RunHistory::new(self.layout.coderun_dir())
    }

    /// Directory job scripts run in.
    fn run_dir(&self) -> &Path {
        self.project_root().unwrap_or(self.cwd.as_path())
    }

    fn staging_path(&self) -> Result<PathBuf> {
        self.layout
            .staging_file()
            .ok_or_else(|| Error::Uninitialised(self.cwd.clone()))
    }

    fn edit_config(&mut self, edit: impl FnOnce(&mut CliConfig) -> Result<()>) -> Result<()> {
        match self.local.clone() {
            Some(mut local) => {
                edit(&mut local)?;
                self.store_local(local)
            }
            None => {
                let mut global = self.global.clone();
                edit(&mut global)?;
                write_file(&self.layout.global_cli_config(), global.to_string())?;
                self.global = global;
                self.config = CliConfig::layered(Some(self.global.clone()), self.local.clone());
                Ok(())
            }
        }
    }

    fn store_local(&mut self, local: CliConfig) -> Result<()> {
        let path = self
            .layout
            .local_cli_config()
            .ok_or_else(|| Error::Uninitialised(self.cwd.clone()))?;
        write_file(&path, local.to_string())?;
        self.config = CliConfig::layered(Some(self.global.clone()), Some(local.clone()));
        self.local = Some(local);
        Ok(())
    }
}

/// Prepared run of a user config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Directory holding resolved config of the run.
    pub dir: PathBuf,

    pub config_file: PathBuf,

    /// Shell command of the run.
    pub script: String,

    /// Directory the script runs in.
    pub working_dir: PathBuf,
}

/// Apply staging edit to each path, returning first untracked error.
fn apply_tracked(
    paths: &[String],
    mut edit: impl FnMut(&str) -> std::result::Result<(), StagingError>,
) -> Option<StagingError> {
    let mut untracked = None;
    for path in paths {
        if let Err(error) = edit(path) {
            warn!("{error}");
            untracked.get_or_insert(error);
        }
    }

    untracked
}

fn read_cli_config(path: &Path) -> Result<Option<CliConfig>> {
    match fs::read_to_string(path) {
        Ok(data) => Ok(Some(data.parse()?)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_file(path: &Path, contents: String) -> Result<()> {
    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent).map_err(Error::io(parent))?;
    }

    fs::write(path, contents).map_err(Error::io(path))
}

/// Copy output streams of child to our own and into log, until both close.
async fn tee_output<W>(child: &mut Child, log: &mut W) -> std::io::Result<ExitStatus>
where
    W: AsyncWrite + Unpin,
{
    let mut stdout = child.stdout.take().map(|out| BufReader::new(out).split(b'\n'));
    let mut stderr = child.stderr.take().map(|err| BufReader::new(err).split(b'\n'));
    let mut our_stdout = tokio::io::stdout();
    let mut our_stderr = tokio::io::stderr();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line? {
                Some(line) => copy_line(&line, &mut our_stdout, log).await?,
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line? {
                Some(line) => copy_line(&line, &mut our_stderr, log).await?,
                None => stderr = None,
            },
        }
    }

    log.flush().await?;
    child.wait().await
}

async fn next_line<R>(lines: &mut Option<Split<R>>) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_segment().await,
        None => Ok(None),
    }
}

async fn copy_line<A, B>(line: &[u8], terminal: &mut A, log: &mut B) -> std::io::Result<()>
where
    A: AsyncWrite + Unpin,
    B: AsyncWrite + Unpin,
{
    terminal.write_all(line).await?;
    terminal.write_all(b"\n").await?;
    terminal.flush().await?;

    log.write_all(line).await?;
    log.write_all(b"\n").await
}

/// Git repository containing directory, with its "origin" remote.
///
/// Directories outside any repository have no git settings.
fn discover_git(dir: &Path) -> Result<Option<GitSettings>> {
    let repo = match Repository::discover(dir) {
        Ok(repo) => repo,
        Err(error) if error.code() == ErrorCode::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    let Some(local_repo) = repo.workdir().map(Path::to_path_buf) else {
        return Ok(None);
    };
    let remote = repo
        .find_remote("origin")
        .ok()
        .and_then(|remote| remote.url().map(str::to_string));
    debug!("project lives in git repository {:?}", local_repo.display());

    Ok(Some(GitSettings { local_repo, remote }))
}

/// Fill missing identity from git configuration.
fn seed_identity(config: &mut CliConfig) {
    let Ok(git) = git2::Config::open_default() else {
        return;
    };

    if config.user.name.is_none() {
        config.user.name = git.get_string("user.name").ok();
    }

    if config.user.email.is_none() {
        config.user.email = git.get_string("user.email").ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::FAIR_FOLDER;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        home: TempDir,
        project: PathBuf,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let home = tempfile::tempdir()?;
            let project = home.path().join("project");
            fs::create_dir_all(&project)?;
            Ok(Self { home, project })
        }

        fn registry_home(&self) -> PathBuf {
            self.home.path().join(".scrc")
        }

        fn session(&self, cwd: &Path) -> anyhow::Result<Session> {
            let root = crate::path::find_project_root(cwd, self.home.path());
            Ok(Session::with_layout(cwd, Layout::new(self.registry_home(), root))?)
        }

        fn initialised(&self) -> anyhow::Result<Session> {
            let mut session = self.session(&self.project)?;
            session.initialise(None)?;
            Ok(session)
        }
    }

    #[test]
    fn initialise_creates_project_files() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let session = fixture.initialised()?;

        assert_eq!(session.project_root()?, fixture.project.as_path());
        assert!(fixture.project.join(FAIR_FOLDER).join("cli-config.toml").is_file());
        assert!(fixture.project.join(FAIR_FOLDER).join("staging.toml").is_file());
        assert!(fixture.registry_home().join("cli/cli-config.toml").is_file());

        let (_, config) = session.load_user_config(None)?;
        assert_eq!(
            config.run_metadata.local_data_registry_url.as_deref(),
            Some("http://127.0.0.1:8000/api/")
        );
        assert!(config.read.is_empty());

        let reopened = fixture.session(&fixture.project.join(FAIR_FOLDER))?;
        assert_eq!(reopened.project_root()?, fixture.project.as_path());

        Ok(())
    }

    #[test]
    fn initialise_twice_is_warning() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.initialised()?;

        let mut session = fixture.session(&fixture.project)?;
        let error = session.initialise(None).expect_err("already initialised");
        assert!(matches!(error, Error::AlreadyInitialised(_)));
        assert_eq!(error.exit_code(), 0);

        Ok(())
    }

    #[test]
    fn project_commands_need_project() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let session = fixture.session(&fixture.project)?;

        assert!(matches!(session.staging(), Err(Error::Uninitialised(_))));
        assert!(matches!(
            session.stage(&["x".into()]),
            Err(Error::Uninitialised(_))
        ));

        Ok(())
    }

    #[test]
    fn remotes_are_written_to_project_config() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut session = fixture.initialised()?;

        session.add_remote("origin", "https://data.scrc.uk/api/")?;
        session.add_remote("mirror", "https://mirror.example/api/")?;
        session.modify_remote("mirror", "https://other.example/api/")?;
        session.remove_remote("origin")?;
        session.set_user_name("Jane Doe")?;

        let reopened = fixture.session(&fixture.project)?;
        let remotes = &reopened.config().registries.remotes;
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes["mirror"].uri, "https://other.example/api/");
        assert_eq!(reopened.config().user.name.as_deref(), Some("Jane Doe"));

        let global: CliConfig =
            fs::read_to_string(fixture.registry_home().join("cli/cli-config.toml"))?.parse()?;
        assert!(global.registries.remotes.is_empty());

        Ok(())
    }

    #[test]
    fn remote_endpoint_reads_token_file() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let mut session = fixture.initialised()?;
        let token = fixture.home.path().join("token");
        fs::write(&token, "s3cr3t\n")?;
        session.add_remote("origin", "https://data.scrc.uk/api")?;
        session.edit_config(|config| {
            if let Some(remote) = config.registries.remotes.get_mut("origin") {
                remote.token_file = Some(token.clone());
            }
            Ok(())
        })?;

        let endpoint = session.endpoint(&RegistryOrigin::default())?;
        assert_eq!(endpoint.uri().as_str(), "https://data.scrc.uk/api/");
        assert_eq!(endpoint.token(), Some("s3cr3t"));

        let missing = session.endpoint(&RegistryOrigin::Remote("nope".into()));
        assert!(matches!(missing, Err(Error::Config(_))));

        Ok(())
    }

    #[test]
    fn staging_workflow() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let session = fixture.initialised()?;
        fs::write(fixture.project.join("a.csv"), "")?;
        fs::write(fixture.project.join("b.csv"), "")?;
        fs::write(fixture.project.join("model.py"), "")?;

        assert_eq!(session.stage(&["*.csv".into()])?, vec!["a.csv", "b.csv"]);
        session.unstage(&["b.csv".into()])?;

        let index = session.staging()?;
        assert_eq!(index.status().staged, vec!["a.csv"]);
        assert_eq!(index.status().unstaged, vec!["b.csv"]);

        let error = session.unstage(&["model.py".into()]).expect_err("untracked");
        assert_eq!(error.exit_code(), 0);

        session.remove_files(&["b.csv".into()], true)?;
        assert!(fixture.project.join("b.csv").exists());
        session.remove_files(&["a.csv".into()], false)?;
        assert!(!fixture.project.join("a.csv").exists());
        assert!(session.staging()?.is_empty());

        Ok(())
    }

    #[test]
    fn purge_local_and_global() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let session = fixture.initialised()?;

        let removed = session.purge(false)?;
        assert_eq!(removed, vec![fixture.project.join(FAIR_FOLDER)]);
        assert!(fixture.registry_home().join("cli").exists());

        let session = fixture.session(&fixture.project)?;
        let removed = session.purge(true)?;
        assert_eq!(removed, vec![fixture.registry_home().join("cli")]);

        Ok(())
    }

    #[test]
    fn prepare_job_requires_script() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let session = fixture.initialised()?;
        let (path, mut config) = session.load_user_config(None)?;

        assert!(matches!(
            session.prepare_job(&path, &config),
            Err(Error::NoScript(_))
        ));

        session.set_script(&path, &mut config, "echo hi".into())?;
        let (_, config) = session.load_user_config(None)?;
        let job = session.prepare_job(&path, &config)?;

        assert_eq!(job.script, "echo hi");
        assert!(job.dir.starts_with(fixture.registry_home().join("data/coderun")));
        assert_eq!(fs::read_to_string(&job.config_file)?.parse::<UserConfig>()?, config);

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_job_exposes_job_dir() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let session = fixture.initialised()?;
        let (path, mut config) = session.load_user_config(None)?;
        session.set_script(&path, &mut config, format!("echo \"${JOB_DIR_ENV}\" > out.txt"))?;

        let job = session.prepare_job(&path, &config)?;
        let status = session.run_job(&job, None).await?;

        assert!(status.success());
        let out = fs::read_to_string(fixture.project.join("out.txt"))?;
        assert_eq!(out.trim(), job.dir.to_string_lossy());

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_job_keeps_output_and_outcome() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let session = fixture.initialised()?;
        let (path, mut config) = session.load_user_config(None)?;
        session.set_script(&path, &mut config, "echo out; echo err >&2; exit 3".into())?;

        let job = session.prepare_job(&path, &config)?;
        let status = session.run_job(&job, None).await?;
        assert_eq!(status.code(), Some(3));

        let runs = session.history()?;
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(job.dir.file_name(), Some(std::ffi::OsStr::new(&run.id)));
        assert_eq!(run.record.script, "echo out; echo err >&2; exit 3");
        assert_eq!(run.record.outcome(), "failed (3)");
        assert!(run.record.finished.is_some());
        assert_eq!(session.run(&run.id)?, run.clone());

        let log = session.run_log(&run.id)?;
        assert!(log.contains("out\n"));
        assert!(log.contains("err\n"));

        Ok(())
    }

    #[test]
    fn unknown_run_log() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let session = fixture.initialised()?;

        assert_eq!(session.history()?, Vec::new());
        assert!(matches!(
            session.run_log("2025-03-01_09_00_00_000000000"),
            Err(Error::History(crate::history::HistoryError::UnknownRun(_)))
        ));

        Ok(())
    }

    #[test]
    fn initialise_reports_broken_git_repository() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fs::write(fixture.project.join(".git"), "not a gitfile")?;
        let mut session = fixture.session(&fixture.project)?;

        assert!(matches!(session.initialise(None), Err(Error::Git(_))));

        Ok(())
    }
}
