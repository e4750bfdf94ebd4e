//! Workflow graph compilation.
//!
//! Turns a [`WorkflowDefinition`] into a [`CompiledGraph`]: effective
//! dependency edges (declared plus the implicit chain for sequential
//! workflows), a topological order proving acyclicity, reverse edges
//! for readiness checks, and the set of rule-gated steps that only
//! become ready when a matched rule names them.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use weave_types::workflow::{
    RuleEffect, StepDefinition, StepKind, WorkflowDefinition, WorkflowKind,
};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("workflow has no steps")]
    Empty,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{0}' depends on unknown step '{1}'")]
    UnknownDependency(String, String),

    #[error("step '{0}' routes to unknown step '{1}'")]
    UnknownRuleTarget(String, String),

    #[error("cycle detected involving step '{0}'")]
    Cycle(String),
}

/// A validated, compiled workflow graph.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    steps: HashMap<String, StepDefinition>,
    /// Topological order over effective dependencies.
    order: Vec<String>,
    /// Effective dependencies per step (declared plus implicit chain).
    dependencies: HashMap<String, Vec<String>>,
    /// Reverse edges: steps that list the key as a dependency.
    dependents: HashMap<String, Vec<String>>,
    /// Steps reachable only through a matched rule's `next_step`.
    rule_gated: HashSet<String>,
}

impl CompiledGraph {
    /// Compile and validate a definition. Rejects duplicate ids,
    /// unknown dependencies, unknown rule targets, and cycles.
    pub fn compile(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        if definition.steps.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut steps: HashMap<String, StepDefinition> = HashMap::new();
        for step in &definition.steps {
            if steps.insert(step.id.clone(), step.clone()).is_some() {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
        }

        // Effective dependencies. Sequential workflows chain each step
        // to its predecessor unless the step declares its own edges.
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        for (pos, step) in definition.steps.iter().enumerate() {
            let deps = if !step.dependencies.is_empty() {
                step.dependencies.clone()
            } else if definition.kind == WorkflowKind::Sequential && pos > 0 {
                vec![definition.steps[pos - 1].id.clone()]
            } else {
                Vec::new()
            };
            for dep in &deps {
                if !steps.contains_key(dep) {
                    return Err(GraphError::UnknownDependency(
                        step.id.clone(),
                        dep.clone(),
                    ));
                }
            }
            dependencies.insert(step.id.clone(), deps);
        }

        // Rule targets must name real steps. Collect the gated set:
        // steps with no dependencies that only appear as rule targets
        // are activated by routing, not by readiness over edges.
        let mut rule_targets: HashSet<String> = HashSet::new();
        for step in &definition.steps {
            for rule in step
                .conditions
                .success
                .iter()
                .chain(step.conditions.failure.iter())
            {
                if let Some(RuleEffect::Goto(target)) = rule.effect() {
                    if !steps.contains_key(&target) {
                        return Err(GraphError::UnknownRuleTarget(step.id.clone(), target));
                    }
                    rule_targets.insert(target);
                }
            }
            if step.kind == StepKind::Loop {
                for body_step in &step.body {
                    if steps.contains_key(&body_step.id) {
                        return Err(GraphError::DuplicateStep(body_step.id.clone()));
                    }
                }
            }
        }

        let rule_gated: HashSet<String> = rule_targets
            .into_iter()
            .filter(|id| {
                dependencies
                    .get(id)
                    .map(|deps| deps.is_empty())
                    .unwrap_or(false)
            })
            .filter(|id| definition.steps.first().map(|s| &s.id) != Some(id))
            .collect();

        // Cycle detection over the effective edges.
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();
        for step in &definition.steps {
            indices.insert(step.id.clone(), graph.add_node(step.id.clone()));
        }
        for (id, deps) in &dependencies {
            for dep in deps {
                graph.add_edge(indices[dep], indices[id], ());
            }
        }
        let order = match toposort(&graph, None) {
            Ok(sorted) => sorted.into_iter().map(|ix| graph[ix].clone()).collect(),
            Err(cycle) => {
                return Err(GraphError::Cycle(graph[cycle.node_id()].clone()));
            }
        };

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (id, deps) in &dependencies {
            for dep in deps {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        Ok(Self {
            steps,
            order,
            dependencies,
            dependents,
            rule_gated,
        })
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    /// Step ids in topological order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the step only becomes ready through rule routing.
    pub fn is_rule_gated(&self, id: &str) -> bool {
        self.rule_gated.contains(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
