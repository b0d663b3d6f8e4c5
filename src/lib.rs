// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotent, declarative machine provisioning.
//!
//! Converge applies a manifest of named configuration __steps__ to a machine
//! such that each step is safe to re-run, independently observable, and
//! recoverable from partial failure. Instead of a shell script that mutates
//! the system top to bottom and prays, a manifest declares what should be
//! true; re-running it converges toward that state and touches nothing that
//! already holds.

pub mod check;
pub mod config;
pub mod logger;
pub mod path;
pub mod preflight;
pub mod step;

pub use config::{ActionDefinition, IdempotenceStyle, Manifest, RunSettings, StepDefinition};
pub use logger::{LogLevel, Logger, Verbosity};
pub use path::{default_log_file, default_manifest_file, home_dir};
pub use step::{RetryPolicy, RunContext, RunReport, Runner, Selection, StepGraph, StepOutcome};
