// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local registry server management.
//!
//! [`RegistryServer`] drives the local registry through its lifecycle:
//! install, launch, health check, stop and uninstall. The server runs as a
//! separate process that outlives the FAIR invocation that launched it, so
//! its identity is kept in the [server process record](crate::registry::record).
//!
//! # Launch
//!
//! Launching is idempotent. If something already answers health checks at
//! the configured url, nothing is spawned. Otherwise the launch command is
//! spawned, recorded, and polled until it answers or the attempt bound is
//! exceeded. A server that fails to come up is terminated, and its record
//! removed, before the error is returned. The same cleanup happens when the
//! launch is abandoned midway, e.g., because the user interrupted it.
//!
//! # Stop
//!
//! A graceful stop sends a termination request and waits for the process to
//! exit, killing it once the grace period runs out. A forced stop kills
//! right away. Both remove the record, even if the process was already gone.

use crate::{
    config::{ConfigError, LocalRegistry},
    error::Severity,
    path::Layout,
    registry::{
        client::HttpProbe,
        install::{self, resolve_program, InstallError, Installation},
        process::{self, ProcessError, StopMode, Termination},
        record::{RecordError, RecordFile, ServerRecord},
        HealthProbe, QueryError,
    },
};

use indicatif::ProgressBar;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::ErrorKind,
    net::TcpListener,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Resolved settings of the local registry server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Directory holding the installation and its database.
    pub install_dir: PathBuf,

    /// Git repository to install from.
    pub source: String,

    /// Branch or tag to install from.
    pub reference: Option<String>,

    pub host: String,
    pub port: u16,

    /// Root url of the server, target of health checks.
    pub base_url: Url,

    /// Launch program, see [`LocalRegistry::program`].
    pub program: String,

    /// Launch arguments with `{host}` and `{port}` placeholders.
    pub args: Vec<String>,

    pub env: BTreeMap<String, String>,
    pub setup: Vec<Vec<String>>,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub stop_timeout: Duration,
    pub probe_timeout: Duration,
}

impl ServerSettings {
    /// Resolve settings from CLI configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidUri`] if host and port do not form a
    ///   valid url.
    pub fn from_config(local: &LocalRegistry, layout: &Layout) -> Result<Self, ConfigError> {
        Ok(Self {
            install_dir: local
                .install_dir
                .clone()
                .unwrap_or_else(|| layout.registry_install_dir()),
            source: local.source.clone(),
            reference: local.reference.clone(),
            host: local.host.clone(),
            port: local.port,
            base_url: local.base_url()?,
            program: local.program.clone(),
            args: local.args.clone(),
            env: local.env.clone(),
            setup: local.setup.clone(),
            poll_interval: Duration::from_millis(local.poll_interval_ms),
            poll_attempts: local.poll_attempts,
            stop_timeout: Duration::from_millis(local.stop_timeout_ms),
            probe_timeout: Duration::from_millis(local.probe_timeout_ms),
        })
    }

    /// Token file written by the registry on first run.
    pub fn token_file(&self) -> PathBuf {
        self.install_dir.join("token")
    }

    /// File receiving server output.
    pub fn log_file(&self) -> PathBuf {
        self.install_dir.join("server.log")
    }

    /// Launch arguments with placeholders substituted.
    pub fn launch_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{host}", &self.host).replace("{port}", &port))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn for_test(install_dir: PathBuf) -> Self {
        let mut settings = Self::from_config(
            &LocalRegistry::default(),
            &Layout::new(install_dir.with_file_name("home"), None),
        )
        .expect("default settings are valid");
        settings.install_dir = install_dir;
        settings.poll_interval = Duration::from_millis(10);
        settings.poll_attempts = 5;
        settings.stop_timeout = Duration::from_secs(2);
        settings
    }
}

/// Spawn registry server processes.
pub trait Spawner {
    /// Start server described by settings, returning its process handle.
    fn spawn(&self, settings: &ServerSettings) -> std::io::Result<Child>;
}

/// Spawn launch command of settings.
///
/// The server runs in the install directory, in its own process group, so
/// that terminal interrupts aimed at FAIR do not reach it. Its output goes
/// to [`ServerSettings::log_file`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSpawner;

impl Spawner for CommandSpawner {
    fn spawn(&self, settings: &ServerSettings) -> std::io::Result<Child> {
        let log = File::create(settings.log_file())?;
        let mut command = Command::new(resolve_program(&settings.install_dir, &settings.program));
        command
            .args(settings.launch_args())
            .envs(&settings.env)
            .current_dir(&settings.install_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command.spawn()
    }
}

/// Observable state of the local registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Nothing installed.
    NotInstalled,

    /// Installed, nothing answering.
    Stopped,

    /// Recorded process is alive but not answering yet.
    Starting(ServerRecord),

    /// Something answers health checks. The record is absent if the server
    /// was not launched by FAIR.
    Running(Option<ServerRecord>),
}

/// Outcome of a launch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// A server was already answering, nothing was spawned.
    AlreadyRunning(Option<ServerRecord>),

    /// A new server was spawned and answers health checks.
    Started(ServerRecord),
}

impl Launch {
    pub fn record(&self) -> Option<ServerRecord> {
        match self {
            Self::AlreadyRunning(record) => *record,
            Self::Started(record) => Some(*record),
        }
    }
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped {
    pub record: ServerRecord,
    pub termination: Termination,
}

/// Manager of the local registry server.
#[derive(Debug)]
pub struct RegistryServer<P = HttpProbe, S = CommandSpawner>
where
    P: HealthProbe,
    S: Spawner,
{
    settings: ServerSettings,
    record: RecordFile,
    probe: P,
    spawner: S,
}

impl RegistryServer {
    /// Construct new manager probing over HTTP and spawning real processes.
    ///
    /// # Errors
    ///
    /// - Return [`ServerError::Probe`] if the HTTP client cannot be built.
    pub fn new(settings: ServerSettings, record: RecordFile) -> Result<Self> {
        let probe = HttpProbe::with_timeout(settings.probe_timeout)?;
        Ok(Self::with_parts(settings, record, probe, CommandSpawner))
    }
}

impl<P, S> RegistryServer<P, S>
where
    P: HealthProbe,
    S: Spawner,
{
    /// Construct new manager from its parts.
    pub fn with_parts(settings: ServerSettings, record: RecordFile, probe: P, spawner: S) -> Self {
        Self {
            settings,
            record,
            probe,
            spawner,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn record_file(&self) -> &RecordFile {
        &self.record
    }

    /// Graceful stop with configured grace period.
    pub fn graceful(&self) -> StopMode {
        StopMode::Graceful(self.settings.stop_timeout)
    }

    /// Check if anything answers at the server's url.
    pub async fn is_running(&self) -> bool {
        self.probe.is_responding(&self.settings.base_url).await
    }

    /// Determine current state of local registry.
    ///
    /// # Errors
    ///
    /// - Return [`ServerError::Record`] if record cannot be read.
    pub async fn state(&self) -> Result<ServerState> {
        let record = self.record.load()?;
        if self.is_running().await {
            return Ok(ServerState::Running(record));
        }

        match record {
            Some(record) if process::is_alive(record.pid) => Ok(ServerState::Starting(record)),
            _ if install::is_installed(&self.settings.install_dir) => Ok(ServerState::Stopped),
            _ => Ok(ServerState::NotInstalled),
        }
    }

    /// Install local registry, see [`install::install`].
    ///
    /// # Errors
    ///
    /// - Return [`ServerError::Install`] if installation fails.
    pub fn install(&self, bar: &ProgressBar) -> Result<Installation> {
        Ok(install::install(&self.settings, bar)?)
    }

    /// Stop server if recorded, then remove installation.
    ///
    /// Returns whether an installation was removed.
    ///
    /// # Errors
    ///
    /// - Return [`ServerError`] if recorded server cannot be stopped, or
    ///   installation cannot be removed.
    #[instrument(skip(self), level = "debug")]
    pub fn uninstall(&self) -> Result<bool> {
        match self.stop(StopMode::Forced) {
            Ok(stopped) => info!("stopped registry server {} before uninstall", stopped.record.pid),
            Err(ServerError::NotRunning) => debug!("no registry server to stop before uninstall"),
            Err(error) => return Err(error),
        }

        Ok(install::uninstall(&self.settings)?)
    }

    /// Launch server unless one already answers.
    ///
    /// # Errors
    ///
    /// - Return [`ServerError::NotInstalled`] if nothing is installed.
    /// - Return [`ServerError::Unresponsive`] if recorded process is alive
    ///   but not answering.
    /// - Return [`ServerError::PortInUse`] if the port is taken by something
    ///   that is not answering as a registry.
    /// - Return [`ServerError::Exited`] if server exits while starting.
    /// - Return [`ServerError::LaunchTimeout`] if server does not answer
    ///   within the attempt bound.
    #[instrument(skip(self), level = "debug")]
    pub async fn launch(&self) -> Result<Launch> {
        let _lock = self.record.lock()?;
        let url = &self.settings.base_url;

        if self.probe.is_responding(url).await {
            info!("local registry already running at {url}");
            return Ok(Launch::AlreadyRunning(self.record.load()?));
        }

        if !install::is_installed(&self.settings.install_dir) {
            return Err(ServerError::NotInstalled(self.settings.install_dir.clone()));
        }

        if let Some(stale) = self.record.load()? {
            if process::is_alive(stale.pid) {
                return Err(ServerError::Unresponsive { pid: stale.pid });
            }

            warn!("removing stale record of registry server {}", stale.pid);
            self.record.remove()?;
        }

        self.ensure_port_free()?;

        info!(
            "launch local registry from {:?} on port {}",
            self.settings.install_dir.display(),
            self.settings.port
        );
        let child = self.spawner.spawn(&self.settings).map_err(ServerError::Spawn)?;
        let record = ServerRecord {
            pid: child.id(),
            port: self.settings.port,
        };
        let mut guard = SpawnGuard::new(child, &self.record);
        self.record.store(&record)?;

        for attempt in 1..=self.settings.poll_attempts {
            if let Some(status) = guard.try_wait() {
                return Err(ServerError::Exited {
                    status,
                    log: self.settings.log_file(),
                });
            }

            if self.probe.is_responding(url).await {
                guard.disarm();
                info!("local registry {} answering at {url}", record.pid);
                return Ok(Launch::Started(record));
            }

            debug!("health check {attempt}/{} failed", self.settings.poll_attempts);
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        Err(ServerError::LaunchTimeout {
            url: url.clone(),
            attempts: self.settings.poll_attempts,
        })
    }

    /// Stop recorded server.
    ///
    /// # Errors
    ///
    /// - Return [`ServerError::NotRunning`] if no server is recorded.
    /// - Return [`ServerError::Process`] if process cannot be signaled.
    #[instrument(skip(self), level = "debug")]
    pub fn stop(&self, mode: StopMode) -> Result<Stopped> {
        let _lock = self.record.lock()?;
        let Some(record) = self.record.load()? else {
            return Err(ServerError::NotRunning);
        };

        info!("stop local registry {} on port {}", record.pid, record.port);
        let termination = process::terminate(record.pid, mode)?;
        self.record.remove()?;

        Ok(Stopped { record, termination })
    }

    /// Launch server for the duration of a scope.
    ///
    /// # Errors
    ///
    /// - Return [`ServerError`] if launch fails, see [`RegistryServer::launch`].
    pub async fn scoped(&self) -> Result<ScopedServer<'_, P, S>> {
        let launch = self.launch().await?;
        Ok(ScopedServer {
            server: self,
            launch,
            closed: false,
        })
    }

    /// API token written by the registry on first run, if any.
    ///
    /// # Errors
    ///
    /// - Return [`ServerError::Io`] if token file exists but cannot be read.
    pub fn token(&self) -> Result<Option<String>> {
        let path = self.settings.token_file();
        match fs::read_to_string(&path) {
            Ok(token) => Ok(Some(token.trim().to_string()).filter(|token| !token.is_empty())),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ServerError::Io { path, source }),
        }
    }

    fn ensure_port_free(&self) -> Result<()> {
        let host = self.settings.host.as_str();
        let port = self.settings.port;
        match TcpListener::bind((host, port)) {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == ErrorKind::AddrInUse => Err(ServerError::PortInUse { port }),
            Err(source) => Err(ServerError::Bind {
                host: host.into(),
                port,
                source,
            }),
        }
    }
}

/// Server launched for the duration of a scope.
///
/// Only a server started by this scope is stopped by it. [`close`] stops it
/// gracefully. Dropping the scope without closing it kills the server, which
/// covers early returns and interrupted runs.
///
/// [`close`]: ScopedServer::close
#[derive(Debug)]
pub struct ScopedServer<'a, P, S>
where
    P: HealthProbe,
    S: Spawner,
{
    server: &'a RegistryServer<P, S>,
    launch: Launch,
    closed: bool,
}

impl<P, S> ScopedServer<'_, P, S>
where
    P: HealthProbe,
    S: Spawner,
{
    pub fn launch(&self) -> &Launch {
        &self.launch
    }

    /// Whether this scope started the server.
    pub fn owns_server(&self) -> bool {
        matches!(self.launch, Launch::Started(_))
    }

    /// End scope, stopping the server gracefully if this scope started it.
    ///
    /// # Errors
    ///
    /// - Return [`ServerError`] if server cannot be stopped.
    pub fn close(mut self) -> Result<Option<Stopped>> {
        self.closed = true;
        if !self.owns_server() {
            return Ok(None);
        }

        Ok(Some(self.server.stop(self.server.graceful())?))
    }
}

impl<P, S> Drop for ScopedServer<'_, P, S>
where
    P: HealthProbe,
    S: Spawner,
{
    fn drop(&mut self) {
        if self.closed || !self.owns_server() {
            return;
        }

        warn!("scope ended early, killing local registry");
        if let Err(error) = self.server.stop(StopMode::Forced) {
            warn!("cannot stop local registry: {error}");
        }
    }
}

/// Spawned server that is terminated, and its record removed, when dropped
/// before being disarmed.
struct SpawnGuard<'a> {
    child: Option<Child>,
    record: &'a RecordFile,
}

impl<'a> SpawnGuard<'a> {
    fn new(child: Child, record: &'a RecordFile) -> Self {
        Self {
            child: Some(child),
            record,
        }
    }

    fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    fn disarm(&mut self) {
        self.child = None;
    }
}

impl Drop for SpawnGuard<'_> {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        warn!("terminate registry server {} that did not start", child.id());
        if let Err(error) = process::terminate(child.id(), StopMode::Forced) {
            warn!("cannot terminate registry server {}: {error}", child.id());
        }
        let _ = child.wait();

        if let Err(error) = self.record.remove() {
            warn!("cannot remove server record: {error}");
        }
    }
}

/// Local registry server error types.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Nothing installed to launch.
    #[error("local registry not installed at {0:?}, run `fair registry install`")]
    NotInstalled(PathBuf),

    /// No server recorded.
    #[error("no local registry server is recorded as running")]
    NotRunning,

    /// Port taken by something that is not a registry.
    #[error("port {port} is in use by another service")]
    PortInUse { port: u16 },

    /// Port cannot be checked.
    #[error("cannot bind {host}:{port}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Recorded process is alive but does not answer.
    #[error("registry server {pid} is not answering, stop it with `fair registry stop --force`")]
    Unresponsive { pid: u32 },

    /// Server process cannot be spawned.
    #[error("cannot spawn registry server")]
    Spawn(#[source] std::io::Error),

    /// Server exited while starting.
    #[error("registry server exited while starting ({status}), see {log:?}")]
    Exited { status: ExitStatus, log: PathBuf },

    /// Server did not answer in time.
    #[error("registry server did not answer at {url} after {attempts} health checks")]
    LaunchTimeout { url: Url, attempts: u32 },

    /// File access failed.
    #[error("cannot access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Probe(#[from] QueryError),
}

impl ServerError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::NotRunning => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// Friendly result alias :3
type Result<T, E = ServerError> = std::result::Result<T, E>;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use tempfile::TempDir;

    /// Probe answering from a script, then with a fallback.
    struct ScriptedProbe {
        answers: Mutex<Vec<bool>>,
        fallback: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(answers: impl Into<Vec<bool>>, fallback: bool) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl HealthProbe for ScriptedProbe {
        async fn is_responding(&self, _url: &Url) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().expect("probe lock");
            if answers.is_empty() {
                self.fallback
            } else {
                answers.remove(0)
            }
        }
    }

    /// Spawner running a shell script instead of a registry.
    struct ShellSpawner {
        script: &'static str,
        spawned: AtomicUsize,
        last_pid: Mutex<Option<u32>>,
    }

    impl ShellSpawner {
        fn new(script: &'static str) -> Self {
            Self {
                script,
                spawned: AtomicUsize::new(0),
                last_pid: Mutex::new(None),
            }
        }

        fn last_pid(&self) -> Option<u32> {
            *self.last_pid.lock().expect("pid lock")
        }
    }

    impl Spawner for ShellSpawner {
        fn spawn(&self, _settings: &ServerSettings) -> std::io::Result<Child> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let child = Command::new("sh").args(["-c", self.script]).spawn()?;
            *self.last_pid.lock().expect("pid lock") = Some(child.id());
            Ok(child)
        }
    }

    struct Fixture {
        _home: TempDir,
        settings: ServerSettings,
        record: RecordFile,
    }

    impl Fixture {
        fn new(installed: bool) -> anyhow::Result<Self> {
            let home = tempfile::tempdir()?;
            let mut settings = ServerSettings::for_test(home.path().join("registry"));
            settings.port = free_port()?;
            if installed {
                fs::create_dir_all(&settings.install_dir)?;
                fs::write(settings.install_dir.join(install::INSTALL_MARKER), "")?;
            }
            let record = RecordFile::new(home.path().join("session.toml"));

            Ok(Self {
                _home: home,
                settings,
                record,
            })
        }

        fn server<P: HealthProbe, S: Spawner>(&self, probe: P, spawner: S) -> RegistryServer<P, S> {
            RegistryServer::with_parts(self.settings.clone(), self.record.clone(), probe, spawner)
        }
    }

    fn free_port() -> anyhow::Result<u16> {
        Ok(TcpListener::bind(("127.0.0.1", 0))?.local_addr()?.port())
    }

    #[tokio::test]
    async fn launch_against_healthy_server_spawns_nothing() -> anyhow::Result<()> {
        let fixture = Fixture::new(false)?;
        let server = fixture.server(ScriptedProbe::new([], true), ShellSpawner::new("exec sleep 30"));

        let result = server.launch().await?;

        assert_eq!(result, Launch::AlreadyRunning(None));
        assert_eq!(server.spawner.spawned.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.record.load()?, None);

        Ok(())
    }

    #[tokio::test]
    async fn launch_timeout_terminates_spawned_server() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let server = fixture.server(ScriptedProbe::new([], false), ShellSpawner::new("exec sleep 30"));

        let result = server.launch().await;

        assert!(matches!(result, Err(ServerError::LaunchTimeout { attempts: 5, .. })));
        assert_eq!(result.map_err(|e| e.severity()).err(), Some(Severity::Error));
        assert_eq!(server.spawner.spawned.load(Ordering::SeqCst), 1);
        let pid = server.spawner.last_pid().expect("spawned pid");
        assert!(!process::is_alive(pid));
        assert_eq!(fixture.record.load()?, None);

        Ok(())
    }

    #[tokio::test]
    async fn abandoned_launch_terminates_spawned_server() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut settings = fixture.settings.clone();
        settings.poll_attempts = 1_000;
        let server = RegistryServer::with_parts(
            settings,
            fixture.record.clone(),
            ScriptedProbe::new([], false),
            ShellSpawner::new("exec sleep 30"),
        );

        let pending = tokio::time::timeout(Duration::from_millis(300), server.launch()).await;
        assert!(pending.is_err());

        let pid = server.spawner.last_pid().expect("spawned pid");
        assert!(!process::is_alive(pid));
        assert_eq!(fixture.record.load()?, None);

        Ok(())
    }

    #[tokio::test]
    async fn launch_then_stop() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let server = fixture.server(
            ScriptedProbe::new([false, false, true], true),
            ShellSpawner::new("exec sleep 30"),
        );

        let Launch::Started(record) = server.launch().await? else {
            panic!("expected new server");
        };
        assert_eq!(record.port, fixture.settings.port);
        assert_eq!(fixture.record.load()?, Some(record));
        assert!(process::is_alive(record.pid));
        assert!(matches!(server.state().await?, ServerState::Running(Some(_))));

        let stopped = server.stop(server.graceful())?;
        assert_eq!(stopped.record, record);
        assert_eq!(stopped.termination, Termination::Terminated);
        assert!(!process::is_alive(record.pid));
        assert_eq!(fixture.record.load()?, None);

        Ok(())
    }

    #[tokio::test]
    async fn server_exiting_while_starting() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let server = fixture.server(ScriptedProbe::new([], false), ShellSpawner::new("exit 1"));

        let result = server.launch().await;

        // The first poll may happen before the shell exits.
        assert!(matches!(
            result,
            Err(ServerError::Exited { .. } | ServerError::LaunchTimeout { .. })
        ));
        assert_eq!(fixture.record.load()?, None);

        Ok(())
    }

    #[tokio::test]
    async fn launch_requires_installation() -> anyhow::Result<()> {
        let fixture = Fixture::new(false)?;
        let server = fixture.server(ScriptedProbe::new([], false), ShellSpawner::new("exec sleep 30"));

        assert!(matches!(server.launch().await, Err(ServerError::NotInstalled(_))));
        assert_eq!(server.spawner.spawned.load(Ordering::SeqCst), 0);
        assert_eq!(server.state().await?, ServerState::NotInstalled);

        Ok(())
    }

    #[tokio::test]
    async fn launch_refuses_occupied_port() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let _occupant = TcpListener::bind(("127.0.0.1", fixture.settings.port))?;
        let server = fixture.server(ScriptedProbe::new([], false), ShellSpawner::new("exec sleep 30"));

        let result = server.launch().await;

        assert!(matches!(result, Err(ServerError::PortInUse { port }) if port == fixture.settings.port));
        assert_eq!(server.spawner.spawned.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[tokio::test]
    async fn launch_replaces_stale_record() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut gone = Command::new("true").spawn()?;
        gone.wait()?;
        fixture.record.store(&ServerRecord {
            pid: gone.id(),
            port: fixture.settings.port,
        })?;
        let server = fixture.server(
            ScriptedProbe::new([false, true], true),
            ShellSpawner::new("exec sleep 30"),
        );

        let launch = server.launch().await?;
        let record = launch.record().expect("new record");
        assert_ne!(record.pid, gone.id());

        server.stop(StopMode::Forced)?;
        Ok(())
    }

    #[test]
    fn forced_stop_removes_record_of_exited_process() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let mut gone = Command::new("true").spawn()?;
        gone.wait()?;
        let record = ServerRecord {
            pid: gone.id(),
            port: fixture.settings.port,
        };
        fixture.record.store(&record)?;
        let server = fixture.server(ScriptedProbe::new([], false), ShellSpawner::new("exec sleep 30"));

        let stopped = server.stop(StopMode::Forced)?;

        assert_eq!(stopped.record, record);
        assert_eq!(stopped.termination, Termination::AlreadyGone);
        assert_eq!(fixture.record.load()?, None);

        Ok(())
    }

    #[test]
    fn stop_without_record_is_warning() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let server = fixture.server(ScriptedProbe::new([], false), ShellSpawner::new("exec sleep 30"));

        let error = server.stop(StopMode::Forced).expect_err("nothing to stop");

        assert!(matches!(error, ServerError::NotRunning));
        assert_eq!(error.severity(), Severity::Warning);

        Ok(())
    }

    #[tokio::test]
    async fn dropped_scope_kills_owned_server() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let server = fixture.server(
            ScriptedProbe::new([false, true], true),
            ShellSpawner::new("exec sleep 30"),
        );

        let scope = server.scoped().await?;
        assert!(scope.owns_server());
        let pid = scope.launch().record().expect("record").pid;
        drop(scope);

        assert!(!process::is_alive(pid));
        assert_eq!(fixture.record.load()?, None);

        Ok(())
    }

    #[tokio::test]
    async fn closing_scope_leaves_foreign_server_running() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let server = fixture.server(ScriptedProbe::new([], true), ShellSpawner::new("exec sleep 30"));

        let scope = server.scoped().await?;
        assert!(!scope.owns_server());
        assert_eq!(scope.close()?, None);

        Ok(())
    }

    #[tokio::test]
    async fn uninstall_stops_server_and_removes_installation() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let server = fixture.server(
            ScriptedProbe::new([false, true], false),
            ShellSpawner::new("exec sleep 30"),
        );
        let pid = server.launch().await?.record().expect("record").pid;

        assert!(server.uninstall()?);

        assert!(!process::is_alive(pid));
        assert!(!fixture.settings.install_dir.exists());
        assert_eq!(fixture.record.load()?, None);
        assert_eq!(server.state().await?, ServerState::NotInstalled);

        Ok(())
    }

    #[test]
    fn launch_args_substitution() {
        let mut settings = ServerSettings::for_test(PathBuf::from("/reg"));
        settings.port = 8123;
        assert_eq!(
            settings.launch_args(),
            vec!["manage.py".to_string(), "runserver".into(), "127.0.0.1:8123".into()]
        );
    }

    #[test]
    fn token_is_trimmed() -> anyhow::Result<()> {
        let fixture = Fixture::new(true)?;
        let server = fixture.server(ScriptedProbe::new([], false), ShellSpawner::new("exec sleep 30"));
        assert_eq!(server.token()?, None);

        fs::write(fixture.settings.token_file(), "abc123\n")?;
        assert_eq!(server.token()?, Some("abc123".into()));

        Ok(())
    }
}
