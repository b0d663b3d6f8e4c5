// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Step run orchestration.
//!
//! Executes the planned step sequence strictly one step at a time, tracking
//! each step through a small state machine:
//!
//! ```text
//! Pending -> Running -> Succeeded
//!                    -> Failed(recoverable)   run continues
//!                    -> Failed(fatal)         run terminates, rest skipped
//! ```
//!
//! Every state transition is observable through exactly one run log entry:
//! INFO when a step starts, INFO when it succeeds, WARN when it fails
//! recoverably, ERROR when it fails fatally. On fatal failure the last ERROR
//! line names the step and the underlying cause, partially-applied
//! configuration stays in place, and backups are never restored
//! automatically.

use crate::{
    config::StepDefinition,
    logger::Logger,
    step::{
        action,
        graph::{Selection, StepGraph},
        retry::RetryPolicy,
    },
};

use std::path::PathBuf;
use tracing::{debug, instrument};

/// Lifecycle state of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    FailedRecoverable,
    FailedFatal,
}

/// Terminal verdict of one executed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    RecoverableFailure(String),
    FatalFailure(String),
}

impl StepOutcome {
    /// Terminal state this outcome corresponds to.
    pub fn state(&self) -> StepState {
        match self {
            Self::Success => StepState::Succeeded,
            Self::RecoverableFailure(_) => StepState::FailedRecoverable,
            Self::FatalFailure(_) => StepState::FailedFatal,
        }
    }
}

/// Explicit execution context passed to every step.
///
/// Steps never rely on process-global mutable state: the working directory
/// and environment a command action sees, and whether file overwrites leave
/// backups behind, all travel through this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Working directory for command actions.
    pub work_dir: PathBuf,

    /// Extra environment variables for command actions.
    pub env: Vec<(String, String)>,

    /// Whether mutating file writes back up previous content first.
    pub make_backups: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            env: Vec::new(),
            make_backups: true,
        }
    }
}

/// Final verdict of a whole provisioning run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Terminal outcome of every executed step, in execution order.
    pub outcomes: Vec<(String, StepOutcome)>,

    /// Steps never attempted because a fatal failure ended the run first.
    pub skipped: Vec<String>,
}

impl RunReport {
    /// Whether every executed step succeeded and nothing was skipped.
    pub fn full_success(&self) -> bool {
        self.skipped.is_empty()
            && self
                .outcomes
                .iter()
                .all(|(_, outcome)| *outcome == StepOutcome::Success)
    }

    /// The fatal failure that ended the run, if any.
    pub fn fatal_failure(&self) -> Option<(&str, &str)> {
        self.outcomes.iter().find_map(|(name, outcome)| match outcome {
            StepOutcome::FatalFailure(reason) => Some((name.as_str(), reason.as_str())),
            _ => None,
        })
    }

    /// Number of steps that failed recoverably.
    pub fn recoverable_failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StepOutcome::RecoverableFailure(_)))
            .count()
    }
}

/// Sequential step executor.
pub struct Runner<'log> {
    logger: &'log Logger,
    ctx: RunContext,
    network_retry: RetryPolicy,
}

impl<'log> Runner<'log> {
    /// Construct new runner over target logger and run context.
    pub fn new(logger: &'log Logger, ctx: RunContext) -> Self {
        Self {
            logger,
            ctx,
            network_retry: RetryPolicy::network_default(),
        }
    }

    /// Replace the retry policy used for network-dependent actions.
    pub fn with_network_retry(mut self, policy: RetryPolicy) -> Self {
        self.network_retry = policy;
        self
    }

    /// Execute the selected portion of a step listing.
    ///
    /// Steps run strictly sequentially in dependency order. A recoverable
    /// failure is recorded and the run continues; a fatal failure terminates
    /// the run immediately and every remaining step is reported as skipped.
    ///
    /// # Errors
    ///
    /// - Return [`RunnerError::Graph`] if the dependency graph is invalid or
    ///   the selection names an unknown step. Nothing has been executed in
    ///   that case.
    #[instrument(skip(self, steps, selection), level = "debug")]
    pub fn run(
        &self,
        steps: &[StepDefinition],
        selection: &Selection,
    ) -> Result<RunReport, RunnerError> {
        let graph = StepGraph::new(steps)?;
        let plan = graph.plan(selection)?;
        debug!("planned {} of {} steps", plan.len(), steps.len());

        let mut report = RunReport::default();
        let mut remaining = plan.iter();
        for step in remaining.by_ref() {
            // Pending -> Running
            self.logger.info(format!("step {} started", step.name));

            let outcome = match action::apply(
                &step.action,
                step.idempotence,
                &self.ctx,
                self.logger,
                &self.network_retry,
            ) {
                // Running -> Succeeded
                Ok(()) => {
                    self.logger.info(format!("step {} succeeded", step.name));
                    StepOutcome::Success
                }
                // Running -> Failed(recoverable)
                Err(error) if !step.critical => {
                    self.logger.warn(format!(
                        "step {} failed: {error}, continuing",
                        step.name
                    ));
                    StepOutcome::RecoverableFailure(error.to_string())
                }
                // Running -> Failed(fatal)
                Err(error) => {
                    self.logger.error(format!(
                        "step {} failed fatally: {error}, terminating run",
                        step.name
                    ));
                    StepOutcome::FatalFailure(error.to_string())
                }
            };

            let fatal = matches!(outcome, StepOutcome::FatalFailure(_));
            report.outcomes.push((step.name.clone(), outcome));
            if fatal {
                break;
            }
        }

        report.skipped = remaining.map(|step| step.name.clone()).collect();
        Ok(report)
    }
}

/// Step runner error types.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Dependency graph is invalid.
    #[error(transparent)]
    Graph(#[from] crate::step::graph::GraphError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Manifest, logger::Verbosity};
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::fs;
    use std::time::Duration;

    fn run_manifest(data: &str) -> RunReport {
        let manifest: Manifest = data.parse().unwrap();
        let logger = Logger::open("run.log", Verbosity::Silent);
        Runner::new(&logger, RunContext::default())
            .with_network_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO))
            .run(&manifest.steps, &Selection::default())
            .unwrap()
    }

    #[sealed_test]
    fn success_path_runs_every_step() {
        let report = run_manifest(
            r#"
            [[step]]
            name = "first"
            [step.action]
            kind = "command"
            program = "sh"
            args = ["-c", "echo one >> trace"]

            [[step]]
            name = "second"
            depends_on = ["first"]
            [step.action]
            kind = "command"
            program = "sh"
            args = ["-c", "echo two >> trace"]
        "#,
        );

        assert!(report.full_success());
        assert_eq!(
            report.outcomes,
            vec![
                ("first".into(), StepOutcome::Success),
                ("second".into(), StepOutcome::Success),
            ]
        );
        assert!(report.skipped.is_empty());
        assert_eq!(fs::read_to_string("trace").unwrap(), "one\ntwo\n");
    }

    #[sealed_test]
    fn recoverable_failure_continues_fatal_failure_aborts() {
        // A fails recoverably, B fails fatally, C must never run.
        let report = run_manifest(
            r#"
            [[step]]
            name = "a"
            [step.action]
            kind = "command"
            program = "false"

            [[step]]
            name = "b"
            critical = true
            [step.action]
            kind = "command"
            program = "false"

            [[step]]
            name = "c"
            [step.action]
            kind = "command"
            program = "sh"
            args = ["-c", "touch c_ran"]
        "#,
        );

        assert!(!report.full_success());
        assert_eq!(report.outcomes.len(), 2);
        assert!(matches!(
            report.outcomes[0],
            (ref name, StepOutcome::RecoverableFailure(_)) if name == "a"
        ));
        assert!(matches!(
            report.outcomes[1],
            (ref name, StepOutcome::FatalFailure(_)) if name == "b"
        ));
        assert_eq!(report.skipped, vec!["c"]);
        assert!(fs::metadata("c_ran").is_err());

        let (name, _) = report.fatal_failure().unwrap();
        assert_eq!(name, "b");
        assert_eq!(report.recoverable_failures(), 1);
    }

    #[sealed_test]
    fn every_transition_emits_exactly_one_log_line() {
        run_manifest(
            r#"
            [[step]]
            name = "ok"
            [step.action]
            kind = "command"
            program = "true"

            [[step]]
            name = "sad"
            [step.action]
            kind = "command"
            program = "false"
        "#,
        );

        let log = fs::read_to_string("run.log").unwrap();
        let step_lines: Vec<&str> = log
            .lines()
            .filter(|line| line.contains("step "))
            .collect();

        assert_eq!(step_lines.len(), 4);
        assert!(step_lines[0].contains("[INFO] step ok started"));
        assert!(step_lines[1].contains("[INFO] step ok succeeded"));
        assert!(step_lines[2].contains("[INFO] step sad started"));
        assert!(step_lines[3].contains("[WARN] step sad failed"));
    }

    #[sealed_test]
    fn fatal_failure_logs_step_name_and_cause_at_error() {
        run_manifest(
            r#"
            [[step]]
            name = "doomed"
            critical = true
            [step.action]
            kind = "command"
            program = "sh"
            args = ["-c", "echo kaput >&2; exit 1"]
        "#,
        );

        let log = fs::read_to_string("run.log").unwrap();
        let last = log.lines().last().unwrap();
        assert!(last.contains("[ERROR] step doomed failed fatally"));
        assert!(last.contains("kaput"));
    }

    #[sealed_test]
    fn run_converges_on_repeat() {
        let manifest = r#"
            [[step]]
            name = "sysctl"
            [step.action]
            kind = "ensure_line"
            path = "sysctl.conf"
            key = "net.ipv4.ip_forward"
            value = "1"
        "#;

        run_manifest(manifest);
        let first = fs::read_to_string("sysctl.conf").unwrap();
        run_manifest(manifest);
        let second = fs::read_to_string("sysctl.conf").unwrap();

        assert_eq!(first, second);
        assert_eq!(second, "net.ipv4.ip_forward 1\n");
    }

    #[sealed_test]
    fn invalid_graph_executes_nothing() {
        let manifest: Manifest = r#"
            [[step]]
            name = "orphan"
            depends_on = ["phantom"]
            [step.action]
            kind = "command"
            program = "sh"
            args = ["-c", "touch orphan_ran"]
        "#
        .parse()
        .unwrap();

        let logger = Logger::open("run.log", Verbosity::Silent);
        let result = Runner::new(&logger, RunContext::default())
            .run(&manifest.steps, &Selection::default());

        assert!(result.is_err());
        assert!(fs::metadata("orphan_ran").is_err());
    }
}
