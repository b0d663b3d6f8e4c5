// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Preflight validation.
//!
//! Environment problems are detected before any mutating step runs, so a
//! doomed run fails fast instead of leaving the machine half-provisioned for
//! a reason that was knowable up front. Preflight failures are always fatal.

use crate::{config::Manifest, logger::Logger};

use std::{fs::OpenOptions, path::Path};
use tracing::debug;

/// Check if a command exists on `PATH`.
pub fn command_exists(command: impl AsRef<str>) -> bool {
    which::which(command.as_ref()).is_ok()
}

/// Check if the current process runs with root privileges.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Validate the environment a manifest is about to run in.
///
/// Checks, in order: root privilege when the manifest demands it, presence of
/// every required host command, and writability of the log destination. Each
/// finding is recorded through the [`Logger`] before the verdict is returned.
///
/// # Errors
///
/// - Return [`PreflightError::NotRoot`] if the manifest requires root and the
///   process has none.
/// - Return [`PreflightError::MissingCommands`] if any required command is
///   absent from `PATH`.
pub fn validate(manifest: &Manifest, logger: &Logger) -> Result<()> {
    debug!("preflight validation start");

    if manifest.run.require_root && !running_as_root() {
        logger.error("preflight: manifest requires root privileges");
        return Err(PreflightError::NotRoot);
    }

    let missing: Vec<String> = manifest
        .run
        .required_commands
        .iter()
        .filter(|command| !command_exists(command))
        .cloned()
        .collect();
    if !missing.is_empty() {
        logger.error(format!(
            "preflight: missing required commands: {}",
            missing.join(", ")
        ));
        return Err(PreflightError::MissingCommands { missing });
    }

    // Log file creation already happened when the logger was opened. A
    // degraded logger is survivable, so only note it here.
    if !log_destination_usable(logger.path()) {
        logger.warn(format!(
            "preflight: log destination {:?} is not writable, run continues with terminal output only",
            logger.path().display()
        ));
    }

    logger.info("preflight validation passed");
    Ok(())
}

fn log_destination_usable(path: &Path) -> bool {
    OpenOptions::new().append(true).open(path).is_ok()
}

/// Preflight validation error types.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    /// Manifest demands root privileges that the process lacks.
    #[error("this manifest must run as root")]
    NotRoot,

    /// Required host commands are missing from `PATH`.
    #[error("required commands not found on PATH: {}", missing.join(", "))]
    MissingCommands { missing: Vec<String> },
}

/// Friendly result alias :3
pub type Result<T, E = PreflightError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Verbosity;
    use sealed_test::prelude::*;

    #[test]
    fn command_exists_finds_standard_tools() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[sealed_test]
    fn validate_passes_on_empty_requirements() {
        let logger = Logger::open("run.log", Verbosity::Silent);
        let manifest = Manifest::default();
        assert!(validate(&manifest, &logger).is_ok());
    }

    #[sealed_test]
    fn log_destination_usability_requires_an_appendable_file() {
        std::fs::write("run.log", "").unwrap();
        assert!(log_destination_usable(Path::new("run.log")));

        std::fs::create_dir("blocked.log").unwrap();
        assert!(!log_destination_usable(Path::new("blocked.log")));
        assert!(!log_destination_usable(Path::new("absent.log")));
    }

    #[sealed_test]
    fn validate_reports_all_missing_commands_at_once() {
        let logger = Logger::open("run.log", Verbosity::Silent);
        let manifest: Manifest = r#"
            [run]
            required_commands = ["ls", "missing_tool_a", "missing_tool_b"]
        "#
        .parse()
        .unwrap();

        let result = validate(&manifest, &logger);
        let Err(PreflightError::MissingCommands { missing }) = result else {
            panic!("expected missing commands");
        };
        assert_eq!(missing, vec!["missing_tool_a", "missing_tool_b"]);

        let log = std::fs::read_to_string("run.log").unwrap();
        assert!(log.contains("[ERROR] preflight: missing required commands"));
    }
}
