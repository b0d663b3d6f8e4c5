// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Step dependency graph handling.
//!
//! Builds the directed acyclic graph implied by each step's `depends_on`
//! listing, and turns it into a concrete execution plan: a topological order
//! that is stable with respect to manifest declaration order, optionally
//! narrowed to a selection of the manifest.

use crate::config::StepDefinition;

use std::collections::{HashMap, HashSet, VecDeque};

/// Which part of a manifest to execute.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Restrict the plan to critical steps and their transitive dependencies.
    pub minimal: bool,

    /// Restrict the plan to the named step and everything downstream of it.
    /// Dependencies outside the selection are assumed satisfied by a prior
    /// run.
    pub from: Option<String>,
}

/// Dependency graph over the steps of one manifest.
#[derive(Debug)]
pub struct StepGraph<'a> {
    steps: &'a [StepDefinition],
    index: HashMap<&'a str, usize>,
    dependents: Vec<Vec<usize>>,
}

impl<'a> StepGraph<'a> {
    /// Build dependency graph from a step listing.
    ///
    /// # Errors
    ///
    /// - Return [`GraphError::UnknownDependency`] if a step depends on a name
    ///   the manifest never declares.
    pub fn new(steps: &'a [StepDefinition]) -> Result<Self> {
        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(position, step)| (step.name.as_str(), position))
            .collect();

        let mut dependents = vec![Vec::new(); steps.len()];
        for (position, step) in steps.iter().enumerate() {
            for dependency in &step.depends_on {
                let target =
                    *index
                        .get(dependency.as_str())
                        .ok_or_else(|| GraphError::UnknownDependency {
                            step: step.name.clone(),
                            dependency: dependency.clone(),
                        })?;
                dependents[target].push(position);
            }
        }

        Ok(Self {
            steps,
            index,
            dependents,
        })
    }

    /// Compute the full topological execution order.
    ///
    /// The order is stable: among steps whose dependencies are satisfied, the
    /// one declared first in the manifest runs first. So a manifest without
    /// any `depends_on` listing executes exactly in declaration order.
    ///
    /// # Errors
    ///
    /// - Return [`GraphError::DependencyCycle`] if the graph is not acyclic.
    pub fn execution_order(&self) -> Result<Vec<&'a StepDefinition>> {
        let mut unmet: Vec<usize> = self
            .steps
            .iter()
            .map(|step| step.depends_on.len())
            .collect();
        let mut emitted = vec![false; self.steps.len()];
        let mut order = Vec::with_capacity(self.steps.len());

        // Stable Kahn: scan declaration order for the first ready step. The
        // quadratic scan is irrelevant at manifest scale.
        while order.len() < self.steps.len() {
            let Some(next) = (0..self.steps.len())
                .find(|&position| !emitted[position] && unmet[position] == 0)
            else {
                return Err(GraphError::DependencyCycle {
                    steps: self.cycle_members(&emitted),
                });
            };

            emitted[next] = true;
            order.push(&self.steps[next]);
            for &dependent in &self.dependents[next] {
                unmet[dependent] -= 1;
            }
        }

        Ok(order)
    }

    // Steps that merely depend on a cycle also never get emitted. Peel stuck
    // steps without stuck dependents until only the cycle members remain.
    fn cycle_members(&self, emitted: &[bool]) -> Vec<String> {
        let mut stuck: Vec<bool> = emitted.iter().map(|done| !done).collect();

        loop {
            let removable: Vec<usize> = (0..self.steps.len())
                .filter(|&position| {
                    stuck[position]
                        && self.dependents[position]
                            .iter()
                            .all(|&dependent| !stuck[dependent])
                })
                .collect();
            if removable.is_empty() {
                break;
            }
            for position in removable {
                stuck[position] = false;
            }
        }

        self.steps
            .iter()
            .enumerate()
            .filter(|(position, _)| stuck[*position])
            .map(|(_, step)| step.name.clone())
            .collect()
    }

    /// Collect target step and every step downstream of it.
    ///
    /// Downstream means transitively dependent: every step whose
    /// `depends_on` chain leads back to the target.
    ///
    /// # Errors
    ///
    /// - Return [`GraphError::UnknownStep`] if the name is not in the
    ///   manifest.
    pub fn downstream_of(&self, name: impl AsRef<str>) -> Result<HashSet<&'a str>> {
        let name = name.as_ref();
        let start = *self
            .index
            .get(name)
            .ok_or_else(|| GraphError::UnknownStep { name: name.into() })?;

        let mut selected = HashSet::new();
        let mut frontier = VecDeque::from([start]);
        while let Some(position) = frontier.pop_front() {
            if selected.insert(self.steps[position].name.as_str()) {
                frontier.extend(&self.dependents[position]);
            }
        }

        Ok(selected)
    }

    /// Collect every critical step and its transitive dependencies.
    pub fn critical_closure(&self) -> HashSet<&'a str> {
        let mut selected = HashSet::new();
        let mut frontier: VecDeque<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.critical)
            .map(|(position, _)| position)
            .collect();

        while let Some(position) = frontier.pop_front() {
            if selected.insert(self.steps[position].name.as_str()) {
                frontier.extend(
                    self.steps[position]
                        .depends_on
                        .iter()
                        .filter_map(|dependency| self.index.get(dependency.as_str()).copied()),
                );
            }
        }

        selected
    }

    /// Compute the execution plan for a selection of the manifest.
    ///
    /// The plan is the topological execution order narrowed to the selected
    /// steps, in the same relative order as the full plan.
    ///
    /// # Errors
    ///
    /// - Return [`GraphError::DependencyCycle`] if the graph is not acyclic.
    /// - Return [`GraphError::UnknownStep`] if the selection names a step the
    ///   manifest never declares.
    pub fn plan(&self, selection: &Selection) -> Result<Vec<&'a StepDefinition>> {
        let mut order = self.execution_order()?;

        if selection.minimal {
            let keep = self.critical_closure();
            order.retain(|step| keep.contains(step.name.as_str()));
        }

        if let Some(from) = &selection.from {
            let keep = self.downstream_of(from)?;
            order.retain(|step| keep.contains(step.name.as_str()));
        }

        Ok(order)
    }
}

/// Step graph error types.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A step depends on a name that does not exist in the manifest.
    #[error("step {step:?} depends on unknown step {dependency:?}")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle among steps: {}", steps.join(", "))]
    DependencyCycle { steps: Vec<String> },

    /// A selection names a step that does not exist in the manifest.
    #[error("no step named {name:?} in manifest")]
    UnknownStep { name: String },
}

/// Friendly result alias :3
pub type Result<T, E = GraphError> = std::result::Result<T, E>;
