// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use fair::{
    config::user::UserConfig,
    registry::{
        install::Installation,
        process::StopMode,
        server::{Launch, ServerState},
        RegistryOrigin,
    },
    resolve::DEFAULT_SEARCH_KEY,
    Session, Severity,
};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Confirm;
use std::{
    path::{Path, PathBuf},
    process::{exit, ExitStatus},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "fair [options] <fair-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Show debug output.
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(opts)?,
            Command::Yaml(opts) => run_yaml(opts)?,
            Command::Status => run_status()?,
            Command::Add(opts) => run_add(opts)?,
            Command::Reset(opts) => run_reset(opts)?,
            Command::Rm(opts) => run_rm(opts)?,
            Command::Remote(opts) => run_remote(opts)?,
            Command::Config(opts) => run_config(opts)?,
            Command::Registry(opts) => run_registry(opts).await?,
            Command::Resolve(opts) => run_resolve(opts).await?,
            Command::Run(opts) => run_run(opts).await?,
            Command::Log => run_log()?,
            Command::View(opts) => run_view(opts)?,
            Command::Purge(opts) => run_purge(opts)?,
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Initialise FAIR project in current directory.
    #[command(override_usage = "fair init [options]")]
    Init(ConfigPathOptions),

    /// Generate starter user config.
    #[command(override_usage = "fair yaml [options]")]
    Yaml(ConfigPathOptions),

    /// Show staged and unstaged files.
    Status,

    /// Stage files for synchronisation.
    #[command(override_usage = "fair add <path>...")]
    Add(PathOptions),

    /// Unstage files.
    #[command(override_usage = "fair reset <path>...")]
    Reset(PathOptions),

    /// Stop tracking files, deleting them unless cached.
    #[command(override_usage = "fair rm [options] <path>...")]
    Rm(RmOptions),

    /// List or edit remote registries.
    #[command(override_usage = "fair remote [options] [<remote-command>]")]
    Remote(RemoteOptions),

    /// Configure user identity.
    #[command(override_usage = "fair config <key> <value>")]
    Config(ConfigOptions),

    /// Control the local registry server.
    #[command(override_usage = "fair registry <registry-command>")]
    Registry(RegistryOptions),

    /// Resolve wildcards of user config and print the result.
    #[command(override_usage = "fair resolve [options]")]
    Resolve(ResolveOptions),

    /// Run user config script against the local registry.
    #[command(override_usage = "fair run [options] [<command>]")]
    Run(RunOptions),

    /// List runs of this project.
    Log,

    /// Show output of a run.
    #[command(override_usage = "fair view <run_id>")]
    View(ViewOptions),

    /// Delete FAIR tracking state.
    #[command(override_usage = "fair purge [options]")]
    Purge(PurgeOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ConfigPathOptions {
    /// Alternate location of user config.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PathOptions {
    /// Files or glob patterns.
    #[arg(required = true, value_name = "path")]
    pub paths: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RmOptions {
    /// Files or glob patterns.
    #[arg(required = true, value_name = "path")]
    pub paths: Vec<String>,

    /// Stop tracking but keep files on disk.
    #[arg(long)]
    pub cached: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoteOptions {
    /// Show uri of each remote.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<RemoteCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum RemoteCommand {
    /// Add remote registry, labeled "origin" unless a label is given.
    #[command(override_usage = "fair remote add [<label>] <url>")]
    Add {
        #[arg(required = true, num_args = 1..=2, value_name = "label_or_url")]
        args: Vec<String>,
    },

    /// Remove remote registry.
    #[command(override_usage = "fair remote remove <label>")]
    Remove {
        #[arg(value_name = "label")]
        label: String,
    },

    /// Point remote registry at new url.
    #[command(override_usage = "fair remote modify <label> <url>")]
    Modify {
        #[arg(value_name = "label")]
        label: String,

        #[arg(value_name = "url")]
        url: String,
    },
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ConfigOptions {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Set user name.
    #[command(name = "user.name")]
    UserName {
        #[arg(value_name = "name")]
        name: String,
    },

    /// Set user email.
    #[command(name = "user.email")]
    UserEmail {
        #[arg(value_name = "email")]
        email: String,
    },
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RegistryOptions {
    #[command(subcommand)]
    pub command: RegistryCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum RegistryCommand {
    /// Install local registry.
    Install,

    /// Stop and remove local registry, database included.
    Uninstall,

    /// Start local registry server.
    Start,

    /// Show state of local registry.
    Status,

    /// Stop local registry server.
    Stop {
        /// Kill server without waiting for it to shut down.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Clone, Debug)]
struct OriginOptions {
    /// Use local registry.
    #[arg(long, conflicts_with = "remote")]
    pub local: bool,

    /// Use remote registry with this label.
    #[arg(long, value_name = "label")]
    pub remote: Option<String>,

    /// Field registry objects are matched under.
    #[arg(long, value_name = "key", default_value = DEFAULT_SEARCH_KEY)]
    pub search_key: String,
}

impl OriginOptions {
    fn origin(&self, prefer_local: bool) -> RegistryOrigin {
        match (&self.remote, self.local) {
            (Some(label), _) => RegistryOrigin::Remote(label.clone()),
            (None, true) => RegistryOrigin::Local,
            (None, false) if prefer_local => RegistryOrigin::Local,
            (None, false) => RegistryOrigin::default(),
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ResolveOptions {
    /// Alternate location of user config.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub origin: OriginOptions,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RunOptions {
    /// Alternate location of user config.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub origin: OriginOptions,

    /// Shell command to run, saved as the script of the user config.
    #[arg(value_name = "command")]
    pub command: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ViewOptions {
    /// Run to show, as listed by `fair log`.
    #[arg(value_name = "run_id")]
    pub run_id: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PurgeOptions {
    /// Also delete global configuration and data.
    #[arg(short, long)]
    pub global: bool,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run().await {
        let Some(fair_error) = error.downcast_ref::<fair::Error>() else {
            error!("{error:?}");
            exit(1);
        };

        if fair_error.severity() == Severity::Warning {
            warn!("{error}");
        } else {
            error!("{error:?}");
        }
        exit(fair_error.exit_code());
    }

    exit(0)
}

fn open_session() -> fair::Result<Session> {
    let cwd = std::env::current_dir().map_err(fair::Error::io("."))?;
    Session::open(cwd)
}

fn run_init(opts: ConfigPathOptions) -> fair::Result<()> {
    let mut session = open_session()?;
    session.initialise(opts.config)?;
    Ok(())
}

fn run_yaml(opts: ConfigPathOptions) -> fair::Result<()> {
    let path = open_session()?.make_starter_config(opts.config)?;
    info!("generated {:?}", path.display());
    Ok(())
}

fn run_status() -> fair::Result<()> {
    let index = open_session()?.staging()?;
    let status = index.status();
    if status.staged.is_empty() && status.unstaged.is_empty() {
        println!("Nothing tracked.");
        return Ok(());
    }

    if !status.staged.is_empty() {
        println!("Changes to be synchronized:");
        status.staged.iter().for_each(|path| println!("    {path}"));
    }

    if !status.unstaged.is_empty() {
        println!("Changes not staged for synchronization:");
        status.unstaged.iter().for_each(|path| println!("    {path}"));
    }

    Ok(())
}

fn run_add(opts: PathOptions) -> fair::Result<()> {
    open_session()?.stage(&opts.paths)?;
    Ok(())
}

fn run_reset(opts: PathOptions) -> fair::Result<()> {
    open_session()?.unstage(&opts.paths)?;
    Ok(())
}

fn run_rm(opts: RmOptions) -> fair::Result<()> {
    open_session()?.remove_files(&opts.paths, opts.cached)?;
    Ok(())
}

fn run_remote(opts: RemoteOptions) -> fair::Result<()> {
    let mut session = open_session()?;
    match opts.command {
        None => {
            for (label, remote) in &session.config().registries.remotes {
                if opts.verbose {
                    println!("{label}\t{}", remote.uri);
                } else {
                    println!("{label}");
                }
            }
        }
        Some(RemoteCommand::Add { args }) => match args.as_slice() {
            [url] => session.add_remote("origin", url)?,
            [label, url] => session.add_remote(label, url)?,
            _ => unreachable!("clap bounds remote add to one or two values"),
        },
        Some(RemoteCommand::Remove { label }) => session.remove_remote(&label)?,
        Some(RemoteCommand::Modify { label, url }) => session.modify_remote(&label, &url)?,
    }

    Ok(())
}

fn run_config(opts: ConfigOptions) -> fair::Result<()> {
    let mut session = open_session()?;
    match opts.command {
        ConfigCommand::UserName { name } => session.set_user_name(&name)?,
        ConfigCommand::UserEmail { email } => session.set_user_email(&email)?,
    }

    Ok(())
}

async fn run_registry(opts: RegistryOptions) -> fair::Result<()> {
    let session = open_session()?;
    let server = session.registry_server()?;

    match opts.command {
        RegistryCommand::Install => {
            let bar = ProgressBar::new_spinner().with_style(ProgressStyle::default_spinner());
            bar.enable_steady_tick(Duration::from_millis(120));
            let result = server.install(&bar);
            bar.finish_and_clear();
            match result? {
                Installation::Installed => info!("local registry installed"),
                Installation::AlreadyInstalled => info!("local registry already installed"),
            }
        }
        RegistryCommand::Uninstall => {
            if !server.uninstall()? {
                info!("no local registry installed");
            }
        }
        RegistryCommand::Start => {
            // INVARIANT: Interrupting drops the launch, which kills a server
            // that has not answered yet.
            let launch = tokio::select! {
                launch = server.launch() => launch?,
                _ = tokio::signal::ctrl_c() => return Err(fair::Error::Interrupted),
            };
            match launch {
                Launch::Started(record) => {
                    info!("local registry {} started on port {}", record.pid, record.port)
                }
                Launch::AlreadyRunning(_) => info!("local registry already running"),
            }
        }
        RegistryCommand::Status => match server.state().await? {
            ServerState::NotInstalled => println!("not installed"),
            ServerState::Stopped => println!("stopped"),
            ServerState::Starting(record) => println!("starting (pid {})", record.pid),
            ServerState::Running(Some(record)) => {
                println!("running at {} (pid {})", server.settings().base_url, record.pid)
            }
            ServerState::Running(None) => println!("running at {}", server.settings().base_url),
        },
        RegistryCommand::Stop { force } => {
            let mode = if force { StopMode::Forced } else { server.graceful() };
            let stopped = server.stop(mode)?;
            info!("local registry {} stopped ({:?})", stopped.record.pid, stopped.termination);
        }
    }

    Ok(())
}

async fn run_resolve(opts: ResolveOptions) -> fair::Result<()> {
    let session = open_session()?;
    let (_, config) = session.load_user_config(opts.config)?;
    let origin = opts.origin.origin(false);
    let resolved = session
        .resolve_user_config(&config, &origin, &opts.origin.search_key)
        .await?;
    print!("{resolved}");

    Ok(())
}

async fn run_run(opts: RunOptions) -> fair::Result<()> {
    let session = open_session()?;
    let (path, mut config) = session.load_user_config(opts.config)?;
    if let Some(command) = opts.command {
        session.set_script(&path, &mut config, command)?;
    }

    let origin = opts.origin.origin(true);
    let server = session.registry_server()?;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    // INVARIANT: Interrupting drops the launch, which kills a server that
    // has not answered yet.
    let scope = tokio::select! {
        scope = server.scoped() => scope?,
        _ = &mut interrupt => return Err(fair::Error::Interrupted),
    };
    let token = server.token()?;

    let outcome = tokio::select! {
        outcome = run_job(&session, &path, &config, &origin, &opts.origin.search_key, token) => outcome,
        _ = &mut interrupt => Err(fair::Error::Interrupted),
    };

    // INVARIANT: Server started for this run goes down before reporting.
    let closed = scope.close();
    let status = outcome?;
    closed?;

    if !status.success() {
        return Err(fair::Error::JobFailed(status));
    }

    Ok(())
}

async fn run_job(
    session: &Session,
    path: &Path,
    config: &UserConfig,
    origin: &RegistryOrigin,
    search_key: &str,
    token: Option<String>,
) -> fair::Result<ExitStatus> {
    let resolved = session.resolve_user_config(config, origin, search_key).await?;
    let job = session.prepare_job(path, &resolved)?;
    session.run_job(&job, token).await
}

fn run_log() -> fair::Result<()> {
    let runs = open_session()?.history()?;
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }

    for run in runs {
        println!("{}\t{}\t{}", run.id, run.record.outcome(), run.record.script);
    }

    Ok(())
}

fn run_view(opts: ViewOptions) -> fair::Result<()> {
    let session = open_session()?;
    let run = session.run(&opts.run_id)?;
    println!("run {} ({})", run.id, run.record.outcome());
    println!("script: {}", run.record.script);
    println!("started: {}", run.record.started);
    if let Some(finished) = &run.record.finished {
        println!("finished: {finished}");
    }
    println!();
    print!("{}", session.run_log(&run.id)?);

    Ok(())
}

fn run_purge(opts: PurgeOptions) -> Result<()> {
    if !opts.yes {
        let confirmed = Confirm::new("Reset FAIR tracking? This is not reversible.")
            .with_default(false)
            .prompt()?;
        if !confirmed {
            info!("nothing purged");
            return Ok(());
        }
    }

    for dir in open_session()?.purge(opts.global)? {
        info!("removed {:?}", dir.display());
    }

    Ok(())
}
