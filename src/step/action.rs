// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Step action execution.
//!
//! Turns the declarative action vocabulary of the manifest into actual
//! mutations of the machine, going through the idempotency check helpers so
//! that a satisfied desired state means no work. All probes fail open: when
//! current state cannot be read, the failure is logged at WARN and the
//! mutating action is attempted anyway.

use crate::{
    check::{
        backup_then_write, ensure_line_in_file, FileChange, PackageManager, ServiceManager,
        WriteOutcome,
    },
    config::{ActionDefinition, IdempotenceStyle},
    logger::Logger,
    step::{retry::RetryPolicy, runner::RunContext},
};

use std::{
    ffi::OsStr,
    process::Command,
};
use tracing::{debug, instrument};

/// Apply one action to the machine.
///
/// # Errors
///
/// - Return [`ActionError`] when the mutation itself fails. Probe failures
///   are not errors; they downgrade the action to its non-probing form.
#[instrument(skip(action, ctx, logger, retry), level = "debug")]
pub fn apply(
    action: &ActionDefinition,
    style: IdempotenceStyle,
    ctx: &RunContext,
    logger: &Logger,
    retry: &RetryPolicy,
) -> Result<()> {
    match action {
        ActionDefinition::InstallPackages { packages } => {
            install_packages(packages, style, logger)
        }
        ActionDefinition::EnsureLine { path, key, value } => {
            let change = ensure_line_in_file(path, key, value)?;
            match change {
                FileChange::Unchanged => {
                    logger.debug(format!("{:?} already sets {key} {value}", path.display()))
                }
                FileChange::Replaced => {
                    logger.info(format!("{:?}: set {key} {value}", path.display()))
                }
                FileChange::Appended => {
                    logger.info(format!("{:?}: appended {key} {value}", path.display()))
                }
            }
            Ok(())
        }
        ActionDefinition::WriteFile { path, content } => {
            let outcome = backup_then_write(path, content, ctx.make_backups)?;
            match outcome {
                WriteOutcome::Unchanged => {
                    logger.debug(format!("{:?} already holds desired content", path.display()))
                }
                WriteOutcome::Created => logger.info(format!("created {:?}", path.display())),
                WriteOutcome::Updated { backup: Some(backup) } => logger.info(format!(
                    "overwrote {:?}, previous content saved to {:?}",
                    path.display(),
                    backup.display()
                )),
                WriteOutcome::Updated { backup: None } => {
                    logger.info(format!("overwrote {:?} without backup", path.display()))
                }
            }
            Ok(())
        }
        ActionDefinition::EnableService { service } => enable_service(service, style, logger),
        ActionDefinition::Command {
            program,
            args,
            network,
        } => {
            let no_retry = RetryPolicy::none();
            let policy = if *network { retry } else { &no_retry };
            let output = policy.run(
                || syscall(program, args, ctx),
                |attempt, delay, error| {
                    logger.warn(format!(
                        "{program} failed (attempt {attempt}): {error}, retrying in {delay:?}"
                    ));
                },
            )?;

            if !output.is_empty() {
                logger.debug(format!("{program}: {output}"));
            }
            Ok(())
        }
    }
}

fn install_packages(
    packages: &[String],
    style: IdempotenceStyle,
    logger: &Logger,
) -> Result<()> {
    let manager = PackageManager::detect()?;

    for package in packages {
        // INVARIANT: Probe failure means "assume the package is needed".
        let installed = match style {
            IdempotenceStyle::DestroyAndRecreate => false,
            IdempotenceStyle::CheckThenSkip => match manager.package_installed(package) {
                Ok(installed) => installed,
                Err(error) => {
                    logger.warn(format!(
                        "cannot query package {package:?}: {error}, installing anyway"
                    ));
                    false
                }
            },
        };

        if installed {
            logger.info(format!("package {package:?} already installed, skipping"));
            continue;
        }

        manager.install_package(package)?;
        logger.info(format!("installed package {package:?}"));
    }

    Ok(())
}

fn enable_service(service: &str, style: IdempotenceStyle, logger: &Logger) -> Result<()> {
    let manager = ServiceManager::detect()?;

    let enabled = match style {
        IdempotenceStyle::DestroyAndRecreate => false,
        IdempotenceStyle::CheckThenSkip => match manager.service_enabled(service) {
            Ok(enabled) => enabled,
            Err(error) => {
                logger.warn(format!(
                    "cannot query service {service:?}: {error}, enabling anyway"
                ));
                false
            }
        },
    };

    if enabled {
        logger.info(format!("service {service:?} already enabled, skipping"));
        return Ok(());
    }

    manager.enable_service(service)?;
    logger.info(format!("enabled service {service:?}"));
    Ok(())
}

/// Run external command inside the run context.
///
/// Output to stdout and stderr is returned together as a [`String`].
fn syscall(
    program: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    ctx: &RunContext,
) -> Result<String> {
    debug!("syscall {:?}", program.as_ref());
    let output = Command::new(program.as_ref())
        .args(args)
        .current_dir(&ctx.work_dir)
        .envs(ctx.env.iter().map(|(key, value)| (key, value)))
        .output()
        .map_err(|err| ActionError::CommandSpawn {
            source: err,
            program: program.as_ref().to_string_lossy().into_owned(),
        })?;

    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(stdout.as_str());
    }

    if !stderr.is_empty() {
        message.push_str(stderr.as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message);

    if !output.status.success() {
        return Err(ActionError::CommandFailed {
            program: program.as_ref().to_string_lossy().into_owned(),
            reason: message,
        });
    }

    Ok(message)
}

/// Action execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Idempotency helper failed to mutate state.
    #[error(transparent)]
    Check(#[from] crate::check::CheckError),

    /// External command cannot be spawned at all.
    #[error("failed to spawn {program:?}")]
    CommandSpawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// External command exited with failure.
    #[error("command {program:?} failed: {reason}")]
    CommandFailed { program: String, reason: String },
}

/// Friendly result alias :3
pub type Result<T, E = ActionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Verbosity;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::fs;

    fn quiet_logger() -> Logger {
        Logger::open("run.log", Verbosity::Silent)
    }

    #[sealed_test]
    fn command_action_runs_in_work_dir_with_env() {
        fs::create_dir("inner").unwrap();
        let logger = quiet_logger();
        let ctx = RunContext {
            work_dir: "inner".into(),
            env: vec![("GREETING".into(), "hello".into())],
            make_backups: true,
        };
        let action = ActionDefinition::Command {
            program: "sh".into(),
            args: vec!["-c".into(), "echo $GREETING > out".into()],
            network: false,
        };

        apply(
            &action,
            IdempotenceStyle::CheckThenSkip,
            &ctx,
            &logger,
            &RetryPolicy::none(),
        )
        .unwrap();

        assert_eq!(fs::read_to_string("inner/out").unwrap(), "hello\n");
    }

    #[sealed_test]
    fn failing_command_reports_captured_output() {
        let logger = quiet_logger();
        let ctx = RunContext::default();
        let action = ActionDefinition::Command {
            program: "sh".into(),
            args: vec!["-c".into(), "echo boom >&2; exit 7".into()],
            network: false,
        };

        let result = apply(
            &action,
            IdempotenceStyle::CheckThenSkip,
            &ctx,
            &logger,
            &RetryPolicy::none(),
        );

        let Err(ActionError::CommandFailed { program, reason }) = result else {
            panic!("expected a command failure");
        };
        assert_eq!(program, "sh");
        assert_eq!(reason, "boom");
    }

    #[sealed_test]
    fn network_command_retries_with_backoff() {
        let logger = quiet_logger();
        let ctx = RunContext::default();
        let action = ActionDefinition::Command {
            program: "sh".into(),
            args: vec!["-c".into(), "echo x >> attempts; exit 1".into()],
            network: true,
        };
        let retry = RetryPolicy::new(3, std::time::Duration::ZERO, std::time::Duration::ZERO);

        let result = apply(
            &action,
            IdempotenceStyle::CheckThenSkip,
            &ctx,
            &logger,
            &retry,
        );

        assert!(result.is_err());
        assert_eq!(fs::read_to_string("attempts").unwrap().lines().count(), 3);
    }

    #[sealed_test]
    fn non_network_command_never_retries() {
        let logger = quiet_logger();
        let ctx = RunContext::default();
        let action = ActionDefinition::Command {
            program: "sh".into(),
            args: vec!["-c".into(), "echo x >> attempts; exit 1".into()],
            network: false,
        };
        let retry = RetryPolicy::new(5, std::time::Duration::ZERO, std::time::Duration::ZERO);

        let result = apply(
            &action,
            IdempotenceStyle::CheckThenSkip,
            &ctx,
            &logger,
            &retry,
        );

        assert!(result.is_err());
        assert_eq!(fs::read_to_string("attempts").unwrap().lines().count(), 1);
    }

    #[sealed_test]
    fn ensure_line_action_converges() {
        let logger = quiet_logger();
        let ctx = RunContext::default();
        fs::write("sshd_config", "Port 22\n").unwrap();
        let action = ActionDefinition::EnsureLine {
            path: "sshd_config".into(),
            key: "PermitRootLogin".into(),
            value: "no".into(),
        };

        for _ in 0..2 {
            apply(
                &action,
                IdempotenceStyle::CheckThenSkip,
                &ctx,
                &logger,
                &RetryPolicy::none(),
            )
            .unwrap();
        }

        assert_eq!(
            fs::read_to_string("sshd_config").unwrap(),
            "Port 22\nPermitRootLogin no\n"
        );
    }

    #[sealed_test]
    fn write_file_action_respects_backup_switch() {
        let logger = quiet_logger();
        let ctx = RunContext {
            make_backups: false,
            ..RunContext::default()
        };
        fs::write("motd", "old\n").unwrap();
        let action = ActionDefinition::WriteFile {
            path: "motd".into(),
            content: "new\n".into(),
        };

        apply(
            &action,
            IdempotenceStyle::CheckThenSkip,
            &ctx,
            &logger,
            &RetryPolicy::none(),
        )
        .unwrap();

        assert_eq!(fs::read_to_string("motd").unwrap(), "new\n");
        let backups = fs::read_dir(".")
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".bak."))
            .count();
        assert_eq!(backups, 0);
    }
}
