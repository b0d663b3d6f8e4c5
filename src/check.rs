// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotency check helpers.
//!
//! A step that mutates system state should first determine whether the
//! desired end state already holds, so re-running a whole step sequence
//! converges instead of duplicating work or erroring out. This module
//! collects the read-only probes and the convergent mutations that the
//! built-in actions are assembled from.
//!
//! # Failure Semantics
//!
//! A probe that cannot read current state (permission denied, package
//! manager unavailable) returns an error instead of guessing. Callers are
//! expected to report that error at WARN level and proceed conservatively,
//! i.e. attempt the mutating action anyway. Failing open toward re-applying
//! a step is always safe here because every mutation in this module is
//! convergent.

use std::{
    fs::{read, read_to_string, rename, File},
    io::Write as IoWrite,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::debug;

/// Platform package manager front-end.
///
/// Only the two operations the step runner needs are modeled: a read-only
/// installation probe, and a non-interactive install. Which binary backs them
/// is detected from the host at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apk,
    Apt,
    Dnf,
    Pacman,
    Zypper,
}

impl PackageManager {
    /// Detect the package manager available on the host.
    ///
    /// Probes `PATH` for known front-ends in a fixed order. Detection order
    /// matters on hybrid systems: distribution-native front-ends are checked
    /// before compatibility shims.
    ///
    /// # Errors
    ///
    /// - Return [`CheckError::NoPackageManager`] if no known front-end is
    ///   found on `PATH`.
    pub fn detect() -> Result<Self> {
        let candidates = [
            ("apk", Self::Apk),
            ("pacman", Self::Pacman),
            ("zypper", Self::Zypper),
            ("dnf", Self::Dnf),
            ("apt-get", Self::Apt),
        ];

        candidates
            .into_iter()
            .find(|(bin, _)| which::which(bin).is_ok())
            .map(|(_, manager)| manager)
            .ok_or(CheckError::NoPackageManager)
    }

    /// Check whether target package is installed.
    ///
    /// Queries the platform's package database. No side effect: a query never
    /// touches the network or the package cache.
    ///
    /// # Errors
    ///
    /// - Return [`CheckError::QueryPackage`] if the query command itself
    ///   cannot be spawned.
    pub fn package_installed(&self, name: impl AsRef<str>) -> Result<bool> {
        let name = name.as_ref();
        let (program, args): (&str, &[&str]) = match self {
            Self::Apk => ("apk", &["info", "-e"]),
            Self::Apt => ("dpkg", &["-s"]),
            Self::Dnf | Self::Zypper => ("rpm", &["-q"]),
            Self::Pacman => ("pacman", &["-Qi"]),
        };

        debug!("query package database for {name}");
        let status = Command::new(program)
            .args(args)
            .arg(name)
            .output()
            .map_err(|err| CheckError::QueryPackage {
                source: err,
                name: name.into(),
            })?
            .status;

        Ok(status.success())
    }

    /// Install target package non-interactively.
    ///
    /// # Errors
    ///
    /// - Return [`CheckError::InstallPackage`] if the install command cannot
    ///   be spawned or exits with failure.
    pub fn install_package(&self, name: impl AsRef<str>) -> Result<()> {
        let name = name.as_ref();
        let (program, args): (&str, &[&str]) = match self {
            Self::Apk => ("apk", &["add"]),
            Self::Apt => ("apt-get", &["install", "-y"]),
            Self::Dnf => ("dnf", &["install", "-y"]),
            Self::Pacman => ("pacman", &["-S", "--noconfirm", "--needed"]),
            Self::Zypper => ("zypper", &["--non-interactive", "install"]),
        };

        let output = Command::new(program)
            .args(args)
            .arg(name)
            .output()
            .map_err(|err| CheckError::InstallPackage {
                reason: err.to_string(),
                name: name.into(),
            })?;

        if !output.status.success() {
            return Err(CheckError::InstallPackage {
                reason: String::from_utf8_lossy(&output.stderr).trim().into(),
                name: name.into(),
            });
        }

        Ok(())
    }
}

/// Service supervisor front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    Systemd,
    OpenRc,
}

impl ServiceManager {
    /// Detect the service supervisor available on the host.
    ///
    /// # Errors
    ///
    /// - Return [`CheckError::NoServiceManager`] if neither systemd nor
    ///   OpenRC tooling is found on `PATH`.
    pub fn detect() -> Result<Self> {
        if which::which("systemctl").is_ok() {
            Ok(Self::Systemd)
        } else if which::which("rc-update").is_ok() {
            Ok(Self::OpenRc)
        } else {
            Err(CheckError::NoServiceManager)
        }
    }

    /// Check whether target service is already enabled.
    ///
    /// # Errors
    ///
    /// - Return [`CheckError::QueryService`] if the query command cannot be
    ///   spawned.
    pub fn service_enabled(&self, name: impl AsRef<str>) -> Result<bool> {
        let name = name.as_ref();
        let output = match self {
            Self::Systemd => Command::new("systemctl").args(["is-enabled", name]).output(),
            Self::OpenRc => Command::new("rc-update").args(["show", "default"]).output(),
        }
        .map_err(|err| CheckError::QueryService {
            source: err,
            name: name.into(),
        })?;

        match self {
            Self::Systemd => Ok(output.status.success()),
            Self::OpenRc => {
                let listing = String::from_utf8_lossy(&output.stdout);
                Ok(listing
                    .lines()
                    .filter_map(|line| line.split_whitespace().next())
                    .any(|service| service == name))
            }
        }
    }

    /// Enable target service and start it now.
    ///
    /// # Errors
    ///
    /// - Return [`CheckError::EnableService`] if the enable command cannot be
    ///   spawned or exits with failure.
    pub fn enable_service(&self, name: impl AsRef<str>) -> Result<()> {
        let name = name.as_ref();
        let commands: Vec<(&str, Vec<&str>)> = match self {
            Self::Systemd => vec![("systemctl", vec!["enable", "--now", name])],
            Self::OpenRc => vec![
                ("rc-update", vec!["add", name, "default"]),
                ("rc-service", vec![name, "start"]),
            ],
        };

        for (program, args) in &commands {
            let output = Command::new(program).args(args).output().map_err(|err| {
                CheckError::EnableService {
                    reason: err.to_string(),
                    name: name.into(),
                }
            })?;

            if !output.status.success() {
                return Err(CheckError::EnableService {
                    reason: String::from_utf8_lossy(&output.stderr).trim().into(),
                    name: name.into(),
                });
            }
        }

        Ok(())
    }
}

/// Check whether any line of target file contains the given pattern.
///
/// Scan only, no side effect. A missing file simply contains no lines.
///
/// # Errors
///
/// - Return [`CheckError::ReadFile`] if the file exists but cannot be read.
pub fn line_in_file_present(path: impl AsRef<Path>, pattern: impl AsRef<str>) -> Result<bool> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(false);
    }

    let contents = read_to_string(path).map_err(|err| CheckError::ReadFile {
        source: err,
        path: path.into(),
    })?;

    Ok(contents
        .lines()
        .any(|line| line.contains(pattern.as_ref())))
}

/// Set a `key value` line in target config file, convergently.
///
/// Every line whose first whitespace-delimited token equals `key` is replaced
/// with `key value` in place. If no line matches, a new `key value` line is
/// appended. All other file content is preserved. A missing file is created
/// with the single line.
///
/// # Invariant
///
/// - Calling twice with the same arguments leaves the file byte-identical
///   after the first call. The written file always ends with a newline.
///
/// # Errors
///
/// - Return [`CheckError::ReadFile`] if an existing file cannot be read.
/// - Return [`CheckError::WriteFile`] if the result cannot be written back.
pub fn ensure_line_in_file(
    path: impl AsRef<Path>,
    key: impl AsRef<str>,
    value: impl AsRef<str>,
) -> Result<FileChange> {
    let path = path.as_ref();
    let (key, value) = (key.as_ref(), value.as_ref());
    let wanted = format!("{key} {value}");

    let contents = if path.exists() {
        read_to_string(path).map_err(|err| CheckError::ReadFile {
            source: err,
            path: path.into(),
        })?
    } else {
        String::new()
    };

    let mut lines: Vec<String> = contents.lines().map(str::to_owned).collect();
    let mut replaced = false;
    for line in &mut lines {
        if line.split_whitespace().next() == Some(key) {
            line.clone_from(&wanted);
            replaced = true;
        }
    }
    if !replaced {
        lines.push(wanted);
    }

    let mut updated = lines.join("\n");
    updated.push('\n');

    if path.exists() && updated == contents {
        return Ok(FileChange::Unchanged);
    }

    atomic_write(path, updated.as_str())?;

    Ok(if replaced {
        FileChange::Replaced
    } else {
        FileChange::Appended
    })
}

/// Overwrite target file, backing up the previous content first.
///
/// If the file already holds exactly `contents`, byte for byte, nothing
/// happens: no write and no backup churn. Otherwise an existing file is
/// copied to `<path>.bak.<YYYYMMDDHHMMSS>` before the new content lands. The
/// backup layer is deliberately not idempotent: each effective overwrite
/// leaves a fresh timestamped backup behind, and nothing ever prunes or
/// restores them automatically.
///
/// Previous content that cannot be read (including non-UTF-8 bytes) is
/// treated as changed: the backup copy and the overwrite proceed anyway.
///
/// # Errors
///
/// - Return [`CheckError::Backup`] if the backup copy fails.
/// - Return [`CheckError::WriteFile`] if the new content cannot be written.
pub fn backup_then_write(
    path: impl AsRef<Path>,
    contents: impl AsRef<str>,
    make_backup: bool,
) -> Result<WriteOutcome> {
    let path = path.as_ref();
    let contents = contents.as_ref();

    if !path.exists() {
        atomic_write(path, contents)?;
        return Ok(WriteOutcome::Created);
    }

    // INVARIANT: Fail open toward re-applying. Unreadable previous content
    // compares as changed instead of erroring out.
    if read(path).ok().as_deref() == Some(contents.as_bytes()) {
        return Ok(WriteOutcome::Unchanged);
    }

    let backup = if make_backup {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let backup = PathBuf::from(format!("{}.bak.{stamp}", path.display()));
        std::fs::copy(path, &backup).map_err(|err| CheckError::Backup {
            source: err,
            path: path.into(),
        })?;
        Some(backup)
    } else {
        None
    };

    atomic_write(path, contents)?;
    Ok(WriteOutcome::Updated { backup })
}

// Write through a sibling temp file so a mid-write crash never leaves the
// target half-written.
fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let staged = PathBuf::from(format!("{}.tmp", path.display()));
    let failed = |err: std::io::Error| CheckError::WriteFile {
        source: err,
        path: path.into(),
    };

    let mut file = File::create(&staged).map_err(failed)?;
    file.write_all(contents.as_bytes()).map_err(failed)?;
    file.sync_all().map_err(failed)?;
    drop(file);

    rename(&staged, path).map_err(failed)
}

/// How [`ensure_line_in_file`] changed the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Unchanged,
    Replaced,
    Appended,
}

/// How [`backup_then_write`] changed the target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Unchanged,
    Created,
    Updated { backup: Option<PathBuf> },
}

/// Idempotency check error types.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// No known package manager front-end on `PATH`.
    #[error("no supported package manager found on this host")]
    NoPackageManager,

    /// No known service supervisor on `PATH`.
    #[error("no supported service manager found on this host")]
    NoServiceManager,

    /// Package database query cannot be spawned.
    #[error("failed to query package database for {name:?}")]
    QueryPackage {
        #[source]
        source: std::io::Error,
        name: String,
    },

    /// Package install command failed.
    #[error("failed to install package {name:?}: {reason}")]
    InstallPackage { reason: String, name: String },

    /// Service state query cannot be spawned.
    #[error("failed to query service state of {name:?}")]
    QueryService {
        #[source]
        source: std::io::Error,
        name: String,
    },

    /// Service enable command failed.
    #[error("failed to enable service {name:?}: {reason}")]
    EnableService { reason: String, name: String },

    /// Target file cannot be read.
    #[error("failed to read from {:?}", path.display())]
    ReadFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Target file cannot be written to.
    #[error("failed to write to {:?}", path.display())]
    WriteFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Pre-mutation backup copy failed.
    #[error("failed to back up {:?} before overwrite", path.display())]
    Backup {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CheckError> = std::result::Result<T, E>;
