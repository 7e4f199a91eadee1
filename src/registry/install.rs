// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local registry installation.
//!
//! Installing the local registry means cloning its source repository into
//! the install directory, then running the configured setup steps inside
//! that directory (create runtime environment, install requirements, create
//! the database). A marker file is written once every step succeeded, so an
//! interrupted installation is never mistaken for a complete one.

use crate::registry::server::ServerSettings;

use git2::build::RepoBuilder;
use indicatif::ProgressBar;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, info, instrument, warn};

/// File marking a complete installation.
pub const INSTALL_MARKER: &str = ".fair-installed";

/// Outcome of an install request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installation {
    Installed,
    AlreadyInstalled,
}

/// Check if a complete installation exists in directory.
pub fn is_installed(install_dir: impl AsRef<Path>) -> bool {
    install_dir.as_ref().join(INSTALL_MARKER).is_file()
}

/// Install local registry.
///
/// Does nothing if already installed. Leftovers of an incomplete
/// installation are wiped before starting over.
///
/// # Errors
///
/// - Return [`InstallError::Clone`] if source repository cannot be cloned.
/// - Return [`InstallError::Step`] if a setup step fails.
/// - Return [`InstallError::Io`] if install directory cannot be prepared.
#[instrument(skip(settings, bar), level = "debug")]
pub fn install(settings: &ServerSettings, bar: &ProgressBar) -> Result<Installation> {
    let install_dir = settings.install_dir.as_path();
    if is_installed(install_dir) {
        info!("local registry already installed at {:?}", install_dir.display());
        return Ok(Installation::AlreadyInstalled);
    }

    if install_dir.exists() {
        warn!("removing incomplete installation at {:?}", install_dir.display());
        fs::remove_dir_all(install_dir).map_err(|source| InstallError::Io {
            path: install_dir.to_path_buf(),
            source,
        })?;
    }

    if let Some(parent) = install_dir.parent() {
        mkdirp::mkdirp(parent).map_err(|source| InstallError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    bar.set_message(format!("clone {}", settings.source));
    info!("clone {} into {:?}", settings.source, install_dir.display());
    let mut builder = RepoBuilder::new();
    if let Some(reference) = &settings.reference {
        builder.branch(reference);
    }
    builder
        .clone(&settings.source, install_dir)
        .map_err(|source| InstallError::Clone {
            url: settings.source.clone(),
            source,
        })?;

    for step in &settings.setup {
        run_step(settings, step, bar)?;
    }

    let marker = install_dir.join(INSTALL_MARKER);
    fs::write(&marker, settings.source.as_bytes())
        .map_err(|source| InstallError::Io { path: marker, source })?;
    bar.finish_with_message("local registry installed");

    Ok(Installation::Installed)
}

/// Remove install directory and everything in it, database included.
///
/// Returns whether anything was removed. Callers must stop the server first.
///
/// # Errors
///
/// - Return [`InstallError::Io`] if directory cannot be removed.
#[instrument(skip(settings), level = "debug")]
pub fn uninstall(settings: &ServerSettings) -> Result<bool> {
    let install_dir = settings.install_dir.as_path();
    if !install_dir.exists() {
        debug!("nothing installed at {:?}", install_dir.display());
        return Ok(false);
    }

    info!("remove local registry at {:?}", install_dir.display());
    fs::remove_dir_all(install_dir).map_err(|source| InstallError::Io {
        path: install_dir.to_path_buf(),
        source,
    })?;

    Ok(true)
}

/// Resolve program of a command against install directory.
///
/// Bare names are left for `PATH` lookup. Relative paths such as
/// `venv/bin/python` point inside the install directory.
pub(crate) fn resolve_program(install_dir: &Path, program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        install_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

fn run_step(settings: &ServerSettings, step: &[String], bar: &ProgressBar) -> Result<()> {
    let Some((program, args)) = step.split_first() else {
        return Ok(());
    };

    let rendered = step.join(" ");
    bar.set_message(rendered.clone());
    info!("run setup step: {rendered}");

    let output = Command::new(resolve_program(&settings.install_dir, program))
        .args(args)
        .envs(&settings.env)
        .current_dir(&settings.install_dir)
        .output()
        .map_err(|source| InstallError::Spawn {
            command: rendered.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(InstallError::Step {
            command: rendered,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Installation error types.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Source repository cannot be cloned.
    #[error("cannot clone registry source {url}")]
    Clone {
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Setup step cannot be started.
    #[error("cannot run setup step `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Setup step exited unsuccessfully.
    #[error("setup step `{command}` failed with status {status:?}: {stderr}")]
    Step {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Install directory cannot be prepared or removed.
    #[error("cannot manage install directory {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = InstallError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::server::ServerSettings;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("venv/bin/python", "/reg/venv/bin/python"; "inside install dir")]
    #[test_case("python3", "python3"; "path lookup")]
    #[test_case("/usr/bin/python3", "/usr/bin/python3"; "absolute")]
    #[test]
    fn program_resolution(program: &str, expect: &str) {
        use pretty_assertions::assert_eq;
        assert_eq!(resolve_program(Path::new("/reg"), program), PathBuf::from(expect));
    }

    #[test]
    fn uninstall_removes_directory() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let settings = ServerSettings::for_test(home.path().join("registry"));
        fs::create_dir_all(settings.install_dir.join("db"))?;
        fs::write(settings.install_dir.join(INSTALL_MARKER), "")?;
        assert!(is_installed(&settings.install_dir));

        assert!(uninstall(&settings)?);
        assert!(!settings.install_dir.exists());
        assert!(!uninstall(&settings)?);

        Ok(())
    }

    #[test]
    fn install_is_noop_when_installed() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let mut settings = ServerSettings::for_test(home.path().join("registry"));
        settings.source = "https://invalid.invalid/never-cloned.git".into();
        fs::create_dir_all(&settings.install_dir)?;
        fs::write(settings.install_dir.join(INSTALL_MARKER), "")?;

        let result = install(&settings, &ProgressBar::hidden())?;
        assert_eq!(result, Installation::AlreadyInstalled);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failing_setup_step_leaves_no_marker() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let source = home.path().join("source");
        let repo = git2::Repository::init(&source)?;
        fs::write(source.join("manage.py"), "")?;
        let mut index = repo.index()?;
        index.add_path(Path::new("manage.py"))?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let signature = git2::Signature::now("John Doe", "john@doe.com")?;
        repo.commit(Some("HEAD"), &signature, &signature, "init", &tree, &[])?;

        let mut settings = ServerSettings::for_test(home.path().join("registry"));
        settings.source = source.to_string_lossy().into_owned();
        settings.setup = vec![vec!["sh".into(), "-c".into(), "exit 3".into()]];

        let result = install(&settings, &ProgressBar::hidden());
        assert!(matches!(result, Err(InstallError::Step { status: Some(3), .. })));
        assert!(settings.install_dir.join("manage.py").exists());
        assert!(!is_installed(&settings.install_dir));

        settings.setup = vec![vec!["sh".into(), "-c".into(), "touch db.sqlite3".into()]];
        assert_eq!(install(&settings, &ProgressBar::hidden())?, Installation::Installed);
        assert!(settings.install_dir.join("db.sqlite3").exists());
        assert!(is_installed(&settings.install_dir));

        Ok(())
    }
}
