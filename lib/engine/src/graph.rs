//! Job dependency graph validation.
//!
//! Jobs form a directed graph through their `needs` lists. A cyclic or
//! dangling dependency would park jobs in the ready queue's waiting room
//! forever, so the coordinator validates the graph before persisting
//! anything.

use crate::spec::WorkflowSpec;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;

/// Errors from dependency graph validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two jobs share a name.
    DuplicateJobName { name: String },
    /// A job `needs` a name no job declares.
    UnknownDependency { job: String, needs: String },
    /// A job depends on itself, directly or transitively.
    DependencyCycle { job: String },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateJobName { name } => write!(f, "duplicate job name: {name}"),
            Self::UnknownDependency { job, needs } => {
                write!(f, "job {job:?} needs unknown job {needs:?}")
            }
            Self::DependencyCycle { job } => {
                write!(f, "dependency cycle through job {job:?}")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Validates the `needs` graph of a workflow spec.
///
/// # Errors
///
/// Returns an error on duplicate job names, unknown dependency names, or
/// dependency cycles.
pub fn validate_dependencies(spec: &WorkflowSpec) -> Result<(), GraphError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();

    for job in &spec.jobs {
        if indices.contains_key(job.name.as_str()) {
            return Err(GraphError::DuplicateJobName {
                name: job.name.clone(),
            });
        }
        let index = graph.add_node(job.name.as_str());
        indices.insert(job.name.as_str(), index);
    }

    for job in &spec.jobs {
        let target = indices[job.name.as_str()];
        for needed in &job.needs {
            let source = *indices.get(needed.as_str()).ok_or_else(|| {
                GraphError::UnknownDependency {
                    job: job.name.clone(),
                    needs: needed.clone(),
                }
            })?;
            graph.add_edge(source, target, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| GraphError::DependencyCycle {
        job: graph[cycle.node_id()].to_string(),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_needs(jobs: &[(&str, &[&str])]) -> WorkflowSpec {
        let jobs: Vec<serde_json::Value> = jobs
            .iter()
            .map(|(name, needs)| {
                serde_json::json!({
                    "name": name,
                    "needs": needs,
                    "steps": [{ "uses": "builtin:shell", "with": { "run": "true" } }]
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({ "name": "wf", "jobs": jobs }))
            .expect("valid spec")
    }

    #[test]
    fn accepts_a_diamond() {
        let spec = spec_with_needs(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        assert!(validate_dependencies(&spec).is_ok());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let spec = spec_with_needs(&[("a", &["ghost"])]);
        assert_eq!(
            validate_dependencies(&spec),
            Err(GraphError::UnknownDependency {
                job: "a".to_string(),
                needs: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn rejects_cycles() {
        let spec = spec_with_needs(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(
            validate_dependencies(&spec),
            Err(GraphError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn rejects_self_dependency() {
        let spec = spec_with_needs(&[("a", &["a"])]);
        assert!(matches!(
            validate_dependencies(&spec),
            Err(GraphError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let spec = spec_with_needs(&[("a", &[]), ("a", &[])]);
        assert_eq!(
            validate_dependencies(&spec),
            Err(GraphError::DuplicateJobName {
                name: "a".to_string()
            })
        );
    }
}
