// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Step domain representation.
//!
//! A __step__ is one named, ideally-idempotent unit of system configuration:
//! install these packages, set this line in that config file, enable this
//! service. A provisioning run is nothing more than an ordered application of
//! steps, where each step is safe to re-run, independently observable through
//! the run log, and recoverable from partial failure.
//!
//! # Dependency Graph
//!
//! Step ordering is declared explicitly: every step may name the steps it
//! depends on, and the runner executes a topological order of the resulting
//! graph. Keeping the graph explicit, instead of burying the order in the
//! body of some main function, is what makes partial re-runs possible: the
//! caller can select only the steps downstream of a given step, or only the
//! critical subset of a manifest, and still get a valid execution order.
//!
//! # Criticality
//!
//! Provisioning is best-effort by default. A failing step is recorded and the
//! run moves on, under the assumption that a machine with most of its
//! configuration applied beats a machine with none. Steps marked critical
//! invert that: their failure aborts the run immediately, because whatever
//! comes after them is meaningless without them (think "refresh the package
//! index" or "write the firewall policy").
//!
//! # Re-Running
//!
//! No step is ever retried automatically, except for the bounded backoff
//! retry that network-touching command actions opt into. The retry mechanism
//! for everything else is re-running the whole manifest, which converges
//! precisely because steps are idempotent.

pub mod action;
pub mod graph;
pub mod retry;
pub mod runner;

pub use graph::{GraphError, Selection, StepGraph};
pub use retry::RetryPolicy;
pub use runner::{RunContext, RunReport, Runner, RunnerError, StepOutcome, StepState};
