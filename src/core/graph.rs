//! Dependency graph builder
//!
//! Compiles the declared step list into a mapping of direct dependencies
//! plus the declaration order. Dependencies may only point at earlier
//! steps, so the result is acyclic by construction.

use crate::core::pipeline::{StepDefinition, ValidationError};
use std::collections::{HashMap, HashSet};

/// Validated dependency structure of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    order: Vec<String>,
    dependencies: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Build the graph from steps in declaration order.
    ///
    /// A step without an explicit `depends_on` depends on every previously
    /// declared step, which preserves sequential behavior for pipelines
    /// written without edges.
    pub fn build(steps: &[StepDefinition]) -> Result<Self, ValidationError> {
        let mut all_names: HashSet<&str> = HashSet::new();
        for step in steps {
            if !all_names.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStep(step.name.clone()));
            }
        }

        let mut order = Vec::with_capacity(steps.len());
        let mut dependencies = HashMap::with_capacity(steps.len());
        let mut declared: HashSet<String> = HashSet::new();

        for step in steps {
            let deps = match &step.config.depends_on {
                Some(explicit) => {
                    let mut set = HashSet::with_capacity(explicit.len());
                    for dep in explicit {
                        if *dep == step.name {
                            return Err(ValidationError::SelfDependency(step.name.clone()));
                        }
                        if !all_names.contains(dep.as_str()) {
                            return Err(ValidationError::UnknownDependency {
                                step: step.name.clone(),
                                dependency: dep.clone(),
                            });
                        }
                        if !declared.contains(dep) {
                            return Err(ValidationError::ForwardDependency {
                                step: step.name.clone(),
                                dependency: dep.clone(),
                            });
                        }
                        set.insert(dep.clone());
                    }
                    set
                }
                None => declared.clone(),
            };

            dependencies.insert(step.name.clone(), deps);
            declared.insert(step.name.clone());
            order.push(step.name.clone());
        }

        Ok(DependencyGraph {
            order,
            dependencies,
        })
    }

    /// Step names in declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct dependencies of a step.
    pub fn dependencies_of(&self, name: &str) -> Option<&HashSet<String>> {
        self.dependencies.get(name)
    }

    /// Whether every dependency of `name` is in `completed`.
    pub fn is_ready(&self, name: &str, completed: &HashSet<String>) -> bool {
        self.dependencies
            .get(name)
            .is_some_and(|deps| deps.is_subset(completed))
    }
}
