// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use converge::{
    config::{ActionDefinition, Manifest},
    logger::{Logger, Verbosity},
    path::{default_log_file, default_manifest_file},
    preflight,
    step::{RunContext, Runner, Selection, StepGraph, StepOutcome},
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::{fs::read_to_string, path::PathBuf, process::exit};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  converge apply [options]\n  converge plan [options]",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Apply(opts) => run_apply(opts),
            Command::Plan(opts) => run_plan(opts),
        }
    }

    fn verbose(&self) -> bool {
        match &self.command {
            Command::Apply(opts) => opts.verbose,
            Command::Plan(_) => false,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Apply a step manifest to this machine.
    #[command(override_usage = "converge apply [options]")]
    Apply(ApplyOptions),

    /// Show the execution plan of a step manifest without touching anything.
    #[command(override_usage = "converge plan [options]")]
    Plan(PlanOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ApplyOptions {
    /// Path to the step manifest.
    #[arg(short, long, value_name = "path")]
    pub manifest: Option<PathBuf>,

    /// Mirror only ERROR entries to the terminal.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable debug diagnostics.
    #[arg(short, long)]
    pub verbose: bool,

    /// Skip pre-overwrite backups of configuration files.
    #[arg(long)]
    pub no_backup: bool,

    /// Apply only critical steps and their dependencies.
    #[arg(long)]
    pub minimal: bool,

    /// Apply only the named step and everything downstream of it.
    #[arg(long, value_name = "step_name")]
    pub from: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PlanOptions {
    /// Path to the step manifest.
    #[arg(short, long, value_name = "path")]
    pub manifest: Option<PathBuf>,

    /// Plan only critical steps and their dependencies.
    #[arg(long)]
    pub minimal: bool,

    /// Plan only the named step and everything downstream of it.
    #[arg(long, value_name = "step_name")]
    pub from: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let default_directive = if cli.verbose() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn load_manifest(path: Option<PathBuf>) -> Result<Manifest> {
    let path = match path {
        Some(path) => path,
        None => default_manifest_file()?,
    };

    let data = read_to_string(&path)
        .with_context(|| format!("cannot read manifest at {:?}", path.display()))?;

    Ok(data.parse()?)
}

fn run_apply(opts: ApplyOptions) -> Result<()> {
    let manifest = load_manifest(opts.manifest)?;

    let log_file = match &manifest.run.log_file {
        Some(path) => path.clone(),
        None => default_log_file()?,
    };
    let verbosity = if opts.quiet {
        Verbosity::ErrorsOnly
    } else {
        Verbosity::Everything
    };
    let logger = Logger::open(log_file, verbosity);

    preflight::validate(&manifest, &logger)?;

    let ctx = RunContext {
        work_dir: std::env::current_dir().context("cannot determine working directory")?,
        env: Vec::new(),
        make_backups: !opts.no_backup,
    };
    let selection = Selection {
        minimal: opts.minimal,
        from: opts.from,
    };

    let report = Runner::new(&logger, ctx).run(&manifest.steps, &selection)?;

    let succeeded = report
        .outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == StepOutcome::Success)
        .count();
    logger.info(format!(
        "run complete: {succeeded} succeeded, {} failed, {} skipped",
        report.outcomes.len() - succeeded,
        report.skipped.len()
    ));

    if let Some((step, reason)) = report.fatal_failure() {
        return Err(anyhow!("step {step:?} failed fatally: {reason}"));
    }

    Ok(())
}

fn run_plan(opts: PlanOptions) -> Result<()> {
    let manifest = load_manifest(opts.manifest)?;

    let graph = StepGraph::new(&manifest.steps)?;
    let plan = graph.plan(&Selection {
        minimal: opts.minimal,
        from: opts.from,
    })?;

    for (position, step) in plan.iter().enumerate() {
        let criticality = if step.critical { " [critical]" } else { "" };
        println!(
            "{:>3}. {}{criticality}  ({})",
            position + 1,
            step.name,
            describe(&step.action)
        );
    }

    Ok(())
}

fn describe(action: &ActionDefinition) -> String {
    match action {
        ActionDefinition::InstallPackages { packages } => {
            format!("install {} package(s)", packages.len())
        }
        ActionDefinition::EnsureLine { path, key, .. } => {
            format!("ensure {key} line in {:?}", path.display())
        }
        ActionDefinition::WriteFile { path, .. } => format!("write {:?}", path.display()),
        ActionDefinition::EnableService { service } => format!("enable service {service}"),
        ActionDefinition::Command { program, network, .. } => {
            if *network {
                format!("run {program} (with network retry)")
            } else {
                format!("run {program}")
            }
        }
    }
}
