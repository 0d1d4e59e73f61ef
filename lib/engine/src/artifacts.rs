//! Artifact handoff between jobs.
//!
//! Each job reads and writes artifacts through a client scoped to
//! `<artifactsRoot>/<runId>/<jobName>`; the filesystem (or object-store)
//! driver lives outside the engine. The engine owns the path-safety
//! contract, the post-job capture of declared produced paths, and the
//! declarative merge of artifacts from other jobs.

use crate::error::{ErrorInfo, codes};
use crate::spec::{MergeSpec, MergeStrategy};
use async_trait::async_trait;
use camshaft_core::RunId;
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Errors from artifact operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// The path escapes the client's root or is otherwise malformed.
    UnsafePath { path: String },
    /// The artifact does not exist.
    NotFound { path: String },
    /// Listing is not supported by this driver.
    ListUnsupported,
    /// The driver failed.
    Io { message: String },
}

impl std::fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsafePath { path } => write!(f, "unsafe artifact path: {path}"),
            Self::NotFound { path } => write!(f, "artifact not found: {path}"),
            Self::ListUnsupported => write!(f, "artifact listing not supported"),
            Self::Io { message } => write!(f, "artifact I/O error: {message}"),
        }
    }
}

impl std::error::Error for ArtifactError {}

/// Metadata of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    /// Path relative to the client's root.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified_at: DateTime<Utc>,
}

/// Rejects any path that could escape a client's root.
///
/// # Errors
///
/// Returns [`ArtifactError::UnsafePath`] for empty, absolute or
/// parent-traversing paths.
pub fn validate_path(path: &str) -> Result<(), ArtifactError> {
    let unsafe_path = || ArtifactError::UnsafePath {
        path: path.to_string(),
    };
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') || path.contains('\0') {
        return Err(unsafe_path());
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(unsafe_path());
    }
    Ok(())
}

/// Per-job artifact access, scoped to `<artifactsRoot>/<runId>/<jobName>`.
#[async_trait]
pub trait ArtifactClient: Send + Sync {
    /// Writes an artifact.
    async fn produce(&self, path: &str, bytes: &[u8]) -> Result<(), ArtifactError>;

    /// Reads an artifact.
    async fn consume(&self, path: &str) -> Result<Vec<u8>, ArtifactError>;

    /// Lists stored artifacts, optionally under a prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ArtifactEntry>, ArtifactError>;

    /// The client's root path.
    fn base_path(&self) -> String;
}

/// Factory of per-job artifact clients.
pub trait ArtifactStore: Send + Sync {
    /// Returns the client scoped to one job of one run.
    fn client_for(&self, run_id: RunId, job_name: &str) -> Arc<dyn ArtifactClient>;
}

/// Intersects the paths a job actually produced with its declaration.
///
/// When the driver cannot list, the declaration is trusted as-is.
pub async fn capture_produced(client: &dyn ArtifactClient, declared: &[String]) -> Vec<String> {
    match client.list(None).await {
        Ok(entries) => declared
            .iter()
            .filter(|path| entries.iter().any(|entry| &entry.path == *path))
            .cloned()
            .collect(),
        Err(e) => {
            if e != ArtifactError::ListUnsupported {
                tracing::warn!(error = %e, "artifact listing failed, trusting declaration");
            }
            declared.to_vec()
        }
    }
}

/// Executes a job's declarative artifact merge.
///
/// Sources are `<jobName>/<path>` references into sibling jobs' roots; the
/// merged file lands inside the merging job's own root at
/// `merged/<target>`, keeping the path-safety contract intact. Returns the
/// produced path relative to the merging job's root.
pub async fn merge_artifacts(
    store: &dyn ArtifactStore,
    run_id: RunId,
    merge: &MergeSpec,
    own_client: &dyn ArtifactClient,
) -> Result<String, ErrorInfo> {
    let merge_err =
        |message: String| ErrorInfo::coded(codes::ARTIFACT_MERGE_FAILED, message);

    if merge.sources.is_empty() {
        return Err(merge_err("merge declares no sources".to_string()));
    }

    let mut contents: Vec<(String, Vec<u8>)> = Vec::with_capacity(merge.sources.len());
    for source in &merge.sources {
        let (job_name, path) = source
            .split_once('/')
            .ok_or_else(|| merge_err(format!("merge source {source:?} is not <job>/<path>")))?;
        validate_path(path).map_err(|e| merge_err(e.to_string()))?;
        let bytes = store
            .client_for(run_id, job_name)
            .consume(path)
            .await
            .map_err(|e| merge_err(format!("reading {source:?}: {e}")))?;
        contents.push((source.clone(), bytes));
    }

    let merged = match merge.strategy {
        MergeStrategy::Append => {
            let mut combined = Vec::new();
            for (_, bytes) in &contents {
                combined.extend_from_slice(bytes);
            }
            combined
        }
        MergeStrategy::Overwrite => contents
            .last()
            .map(|(_, bytes)| bytes.clone())
            .unwrap_or_default(),
        MergeStrategy::JsonMerge => {
            let mut combined = JsonMap::new();
            for (source, bytes) in &contents {
                let value: JsonValue = serde_json::from_slice(bytes)
                    .map_err(|e| merge_err(format!("parsing {source:?}: {e}")))?;
                let JsonValue::Object(object) = value else {
                    return Err(merge_err(format!("{source:?} is not a JSON object")));
                };
                combined.extend(object);
            }
            serde_json::to_vec(&JsonValue::Object(combined))
                .map_err(|e| merge_err(e.to_string()))?
        }
    };

    let target_name = match &merge.target {
        Some(target) => target.clone(),
        None => {
            let first = &merge.sources[0];
            first
                .rsplit('/')
                .next()
                .unwrap_or(first.as_str())
                .to_string()
        }
    };
    let target_path = format!("merged/{target_name}");
    validate_path(&target_path).map_err(|e| merge_err(e.to_string()))?;
    own_client
        .produce(&target_path, &merged)
        .await
        .map_err(|e| merge_err(format!("writing {target_path:?}: {e}")))?;
    Ok(target_path)
}

#[derive(Default)]
struct MemoryArtifactState {
    // (run, job, path) -> (bytes, modified_at)
    files: HashMap<(RunId, String, String), (Vec<u8>, DateTime<Utc>)>,
}

/// In-memory artifact store for tests and single-process embedding.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    state: Arc<Mutex<MemoryArtifactState>>,
}

impl MemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn client_for(&self, run_id: RunId, job_name: &str) -> Arc<dyn ArtifactClient> {
        Arc::new(MemoryArtifactClient {
            state: Arc::clone(&self.state),
            run_id,
            job_name: job_name.to_string(),
        })
    }
}

/// Per-job view over a [`MemoryArtifactStore`].
pub struct MemoryArtifactClient {
    state: Arc<Mutex<MemoryArtifactState>>,
    run_id: RunId,
    job_name: String,
}

impl MemoryArtifactClient {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryArtifactState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ArtifactClient for MemoryArtifactClient {
    async fn produce(&self, path: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        validate_path(path)?;
        self.lock().files.insert(
            (self.run_id, self.job_name.clone(), path.to_string()),
            (bytes.to_vec(), Utc::now()),
        );
        Ok(())
    }

    async fn consume(&self, path: &str) -> Result<Vec<u8>, ArtifactError> {
        validate_path(path)?;
        self.lock()
            .files
            .get(&(self.run_id, self.job_name.clone(), path.to_string()))
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| ArtifactError::NotFound {
                path: path.to_string(),
            })
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ArtifactEntry>, ArtifactError> {
        let state = self.lock();
        let mut entries: Vec<ArtifactEntry> = state
            .files
            .iter()
            .filter(|((run_id, job_name, path), _)| {
                *run_id == self.run_id
                    && *job_name == self.job_name
                    && prefix.is_none_or(|prefix| path.starts_with(prefix))
            })
            .map(|((_, _, path), (bytes, modified_at))| ArtifactEntry {
                path: path.clone(),
                size: bytes.len() as u64,
                modified_at: *modified_at,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn base_path(&self) -> String {
        format!("memory://{}/{}", self.run_id, self.job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_safety() {
        assert!(validate_path("dist/app.tar").is_ok());
        assert!(validate_path("report.json").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("../sibling/file").is_err());
        assert!(validate_path("dist/../../escape").is_err());
        assert!(validate_path("dist\\..\\escape").is_err());
    }

    #[tokio::test]
    async fn clients_are_isolated_per_job() {
        let store = MemoryArtifactStore::new();
        let run_id = RunId::new();
        let build = store.client_for(run_id, "build");
        let test = store.client_for(run_id, "test");

        build.produce("dist/app.tar", b"tar bytes").await.unwrap();
        assert_eq!(build.consume("dist/app.tar").await.unwrap(), b"tar bytes");
        assert!(matches!(
            test.consume("dist/app.tar").await,
            Err(ArtifactError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryArtifactStore::new();
        let client = store.client_for(RunId::new(), "build");
        client.produce("dist/app.tar", b"a").await.unwrap();
        client.produce("dist/app.sha", b"b").await.unwrap();
        client.produce("logs/build.log", b"c").await.unwrap();

        let all = client.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
        let dist = client.list(Some("dist/")).await.unwrap();
        assert_eq!(dist.len(), 2);
    }

    #[tokio::test]
    async fn capture_intersects_declared_and_present() {
        let store = MemoryArtifactStore::new();
        let client = store.client_for(RunId::new(), "build");
        client.produce("dist/app.tar", b"a").await.unwrap();

        let declared = vec!["dist/app.tar".to_string(), "dist/missing.txt".to_string()];
        let captured = capture_produced(client.as_ref(), &declared).await;
        assert_eq!(captured, vec!["dist/app.tar".to_string()]);
    }

    #[tokio::test]
    async fn merge_append_concatenates_in_order() {
        let store = MemoryArtifactStore::new();
        let run_id = RunId::new();
        store
            .client_for(run_id, "a")
            .produce("part.txt", b"alpha\n")
            .await
            .unwrap();
        store
            .client_for(run_id, "b")
            .produce("part.txt", b"beta\n")
            .await
            .unwrap();

        let own = store.client_for(run_id, "merge");
        let merge = MergeSpec {
            strategy: MergeStrategy::Append,
            sources: vec!["a/part.txt".to_string(), "b/part.txt".to_string()],
            target: Some("combined.txt".to_string()),
        };
        let path = merge_artifacts(&store, run_id, &merge, own.as_ref())
            .await
            .unwrap();
        assert_eq!(path, "merged/combined.txt");
        assert_eq!(own.consume(&path).await.unwrap(), b"alpha\nbeta\n");
    }

    #[tokio::test]
    async fn merge_json_overrides_later_keys() {
        let store = MemoryArtifactStore::new();
        let run_id = RunId::new();
        store
            .client_for(run_id, "a")
            .produce("out.json", br#"{"x":1,"y":1}"#)
            .await
            .unwrap();
        store
            .client_for(run_id, "b")
            .produce("out.json", br#"{"y":2,"z":3}"#)
            .await
            .unwrap();

        let own = store.client_for(run_id, "merge");
        let merge = MergeSpec {
            strategy: MergeStrategy::JsonMerge,
            sources: vec!["a/out.json".to_string(), "b/out.json".to_string()],
            target: None,
        };
        let path = merge_artifacts(&store, run_id, &merge, own.as_ref())
            .await
            .unwrap();
        // Target defaults to the first source's basename.
        assert_eq!(path, "merged/out.json");

        let merged: JsonValue = serde_json::from_slice(&own.consume(&path).await.unwrap()).unwrap();
        assert_eq!(merged, serde_json::json!({ "x": 1, "y": 2, "z": 3 }));
    }

    #[tokio::test]
    async fn merge_fails_on_missing_source() {
        let store = MemoryArtifactStore::new();
        let run_id = RunId::new();
        let own = store.client_for(run_id, "merge");
        let merge = MergeSpec {
            strategy: MergeStrategy::Overwrite,
            sources: vec!["ghost/file.txt".to_string()],
            target: None,
        };
        let err = merge_artifacts(&store, run_id, &merge, own.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some(codes::ARTIFACT_MERGE_FAILED));
    }
}
