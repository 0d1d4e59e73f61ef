//! Workflow registry seam.
//!
//! Sub-workflow steps (`workflow:<id>`) resolve their target through a
//! registry composed of three source kinds: the workspace (spec files on
//! disk), plugins (manifest discovery) and remotes (git checkouts). The
//! drivers for those sources live outside the engine; in-tree there is the
//! trait, the prefixed-id resolution rules and a static implementation fed
//! by the embedder.
//!
//! Resolution rules: `workspace:x`, `plugin:x` and `remote:x` address one
//! source explicitly; a bare id is resolved across all sources and must be
//! unambiguous.

use crate::spec::WorkflowSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Where a registered workflow came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrySource {
    Workspace,
    Plugin,
    Remote,
}

impl RegistrySource {
    /// The id prefix addressing this source.
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Plugin => "plugin",
            Self::Remote => "remote",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "workspace" => Some(Self::Workspace),
            "plugin" => Some(Self::Plugin),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// A resolved workflow, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWorkflow {
    /// The bare workflow id.
    pub id: String,
    /// The source that provided it.
    pub source: RegistrySource,
    /// The loaded spec.
    pub spec: WorkflowSpec,
}

/// Errors from registry resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A bare id matched workflows in several sources.
    AmbiguousId { id: String, sources: Vec<String> },
    /// The source driver failed.
    SourceFailed { message: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmbiguousId { id, sources } => {
                write!(f, "workflow id {id:?} is ambiguous across {sources:?}")
            }
            Self::SourceFailed { message } => write!(f, "registry source failed: {message}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Trait for workflow registries.
#[async_trait]
pub trait WorkflowRegistry: Send + Sync {
    /// Resolves an id (optionally source-prefixed) to a workflow.
    async fn resolve(&self, id: &str) -> Result<Option<ResolvedWorkflow>, RegistryError>;

    /// Lists all registered workflows.
    async fn list(&self) -> Result<Vec<ResolvedWorkflow>, RegistryError>;

    /// Re-reads the underlying sources.
    async fn refresh(&self) -> Result<(), RegistryError>;
}

/// Splits an id into its explicit source (if prefixed) and bare id.
#[must_use]
pub fn split_id(id: &str) -> (Option<RegistrySource>, &str) {
    if let Some((prefix, bare)) = id.split_once(':')
        && let Some(source) = RegistrySource::from_prefix(prefix)
    {
        return (Some(source), bare);
    }
    (None, id)
}

/// A registry over a fixed in-memory set of workflows.
#[derive(Default)]
pub struct StaticRegistry {
    entries: Mutex<HashMap<(RegistrySource, String), WorkflowSpec>>,
}

impl StaticRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workflow under a source.
    pub fn register(&self, source: RegistrySource, id: impl Into<String>, spec: WorkflowSpec) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((source, id.into()), spec);
    }
}

#[async_trait]
impl WorkflowRegistry for StaticRegistry {
    async fn resolve(&self, id: &str) -> Result<Option<ResolvedWorkflow>, RegistryError> {
        let (explicit_source, bare) = split_id(id);
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(source) = explicit_source {
            return Ok(entries.get(&(source, bare.to_string())).map(|spec| {
                ResolvedWorkflow {
                    id: bare.to_string(),
                    source,
                    spec: spec.clone(),
                }
            }));
        }

        let matches: Vec<(RegistrySource, &WorkflowSpec)> = entries
            .iter()
            .filter(|((_, entry_id), _)| entry_id == bare)
            .map(|((source, _), spec)| (*source, spec))
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [(source, spec)] => Ok(Some(ResolvedWorkflow {
                id: bare.to_string(),
                source: *source,
                spec: (*spec).clone(),
            })),
            many => Err(RegistryError::AmbiguousId {
                id: bare.to_string(),
                sources: many
                    .iter()
                    .map(|(source, _)| source.prefix().to_string())
                    .collect(),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<ResolvedWorkflow>, RegistryError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<ResolvedWorkflow> = entries
            .iter()
            .map(|((source, id), spec)| ResolvedWorkflow {
                id: id.clone(),
                source: *source,
                spec: spec.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn refresh(&self) -> Result<(), RegistryError> {
        // Static contents; nothing to re-read.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> WorkflowSpec {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "jobs": [{ "name": "only", "steps": [{ "uses": "builtin:shell" }] }]
        }))
        .expect("valid spec")
    }

    #[tokio::test]
    async fn bare_id_resolves_when_unique() {
        let registry = StaticRegistry::new();
        registry.register(RegistrySource::Workspace, "deploy", spec("deploy"));

        let resolved = registry.resolve("deploy").await.unwrap().expect("hit");
        assert_eq!(resolved.source, RegistrySource::Workspace);
        assert_eq!(resolved.spec.name, "deploy");
        assert!(registry.resolve("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bare_id_errors_when_ambiguous() {
        let registry = StaticRegistry::new();
        registry.register(RegistrySource::Workspace, "deploy", spec("a"));
        registry.register(RegistrySource::Plugin, "deploy", spec("b"));

        let err = registry.resolve("deploy").await.unwrap_err();
        assert!(matches!(err, RegistryError::AmbiguousId { .. }));
    }

    #[tokio::test]
    async fn prefixed_id_targets_one_source() {
        let registry = StaticRegistry::new();
        registry.register(RegistrySource::Workspace, "deploy", spec("a"));
        registry.register(RegistrySource::Plugin, "deploy", spec("b"));

        let resolved = registry
            .resolve("plugin:deploy")
            .await
            .unwrap()
            .expect("hit");
        assert_eq!(resolved.source, RegistrySource::Plugin);
        assert_eq!(resolved.spec.name, "b");
        assert!(registry.resolve("remote:deploy").await.unwrap().is_none());
    }

    #[test]
    fn split_id_recognises_known_prefixes() {
        assert_eq!(split_id("workspace:x"), (Some(RegistrySource::Workspace), "x"));
        assert_eq!(split_id("remote:org/x"), (Some(RegistrySource::Remote), "org/x"));
        // Unknown prefixes are part of the bare id.
        assert_eq!(split_id("team:x"), (None, "team:x"));
        assert_eq!(split_id("plain"), (None, "plain"));
    }
}
