// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for the step manifest that Converge uses to simplify
//! the process of serialization and deserialization. File I/O is left to the
//! caller to figure out.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};

/// Step manifest layout.
///
/// A manifest is a simple TOML configuration file that declares everything a
/// provisioning run needs: run-wide settings, and an ordered listing of named
/// configuration steps to apply to the machine.
///
/// # General Layout
///
/// A manifest is composed of two basic parts: a `[run]` table, and an array
/// of `[[step]]` tables. The run table carries run-wide settings such as the
/// log file location and the preflight requirements. Each step table names
/// one unit of configuration, its dependencies, its criticality, and the
/// action it performs.
///
/// # Environment Overrides
///
/// Path-valued fields and line values go through full shell expansion when a
/// manifest is parsed, so `~`, `$HOME`, and `${USERNAME:-jason}` style
/// defaults all work the way they do in a shell script. This is also the
/// supported way to feed secrets into a manifest: reference them from the
/// environment instead of committing them as literals.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Manifest {
    /// Run-wide settings.
    #[serde(default)]
    pub run: RunSettings,

    /// Ordered listing of configuration steps.
    #[serde(default, rename = "step")]
    pub steps: Vec<StepDefinition>,
}

impl FromStr for Manifest {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut manifest: Manifest = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on all path-valued fields and
        // line values before anything else sees them.
        if let Some(log_file) = manifest.run.log_file.take() {
            manifest.run.log_file = Some(expand_path(log_file)?);
        }
        for step in &mut manifest.steps {
            match &mut step.action {
                ActionDefinition::EnsureLine { path, value, .. } => {
                    *path = expand_path(std::mem::take(path))?;
                    *value = expand_str(value.as_str())?;
                }
                ActionDefinition::WriteFile { path, .. } => {
                    *path = expand_path(std::mem::take(path))?;
                }
                _ => {}
            }
        }

        // INVARIANT: Step names are unique. The dependency graph is keyed by
        // name, so a duplicate would make `depends_on` ambiguous.
        let mut seen = std::collections::HashSet::new();
        for step in &manifest.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
        }

        Ok(manifest)
    }
}

impl Display for Manifest {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: PathBuf) -> Result<PathBuf, ConfigError> {
    expand_str(path.to_string_lossy().as_ref()).map(PathBuf::from)
}

fn expand_str(value: &str) -> Result<String, ConfigError> {
    shellexpand::full(value)
        .map(|expanded| expanded.into_owned())
        .map_err(ConfigError::ShellExpansion)
}

/// Run-wide manifest settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunSettings {
    /// Location of the append-only run log. Falls back to
    /// `$XDG_STATE_HOME/converge/converge.log` when unset.
    pub log_file: Option<PathBuf>,

    /// Abort before any mutating step unless running as root.
    pub require_root: bool,

    /// Host commands that must exist on `PATH` before the run starts.
    pub required_commands: Vec<String>,
}

/// One named unit of system configuration.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct StepDefinition {
    /// Human-readable step identifier, e.g. "configure-ssh".
    pub name: String,

    /// Names of steps that must complete before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Whether failure of this step aborts the whole run.
    #[serde(default)]
    pub critical: bool,

    /// How this step achieves idempotence.
    #[serde(default)]
    pub idempotence: IdempotenceStyle,

    /// The unit of work this step performs.
    pub action: ActionDefinition,
}

/// Idempotence style of a step.
///
/// A `check_then_skip` step probes current state and does nothing when the
/// desired state already holds. A `destroy_and_recreate` step re-applies its
/// state unconditionally: idempotent in outcome, but momentarily destructive,
/// so the runner skips the short-circuit probes for it.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotenceStyle {
    #[default]
    CheckThenSkip,
    DestroyAndRecreate,
}

/// The vocabulary of built-in step actions.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDefinition {
    /// Install packages through the platform package manager. Packages that
    /// the package database already reports as installed are skipped.
    InstallPackages { packages: Vec<String> },

    /// Set a `key value` line in a config file, replacing an existing line
    /// for `key` in place or appending a new one.
    EnsureLine {
        path: PathBuf,
        key: String,
        value: String,
    },

    /// Overwrite a file with the given content, backing up previous content
    /// first. A content-identical write is a no-op.
    WriteFile { path: PathBuf, content: String },

    /// Enable a service through the platform service manager and start it.
    EnableService { service: String },

    /// Run an arbitrary command inside the run context. Set `network` when
    /// the command talks to the network so transient failures are retried
    /// with backoff.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        network: bool,
    },
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

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Two steps share the same name.
    #[error("manifest declares step {name:?} more than once")]
    DuplicateStep { name: String },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
