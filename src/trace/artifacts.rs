use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::NdjsonTraceSink;
use crate::error::ArtifactResult;
use crate::orchestrator::SecurityGate;

/// Persisted artifact kinds; the file names are a tooling contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    PreflightPlan,
    ExecutionTrace,
    RouterMetrics,
    MemoryPre,
    MemoryPost,
}

impl ArtifactKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::PreflightPlan => "preflight_plan.json",
            ArtifactKind::ExecutionTrace => "execution_trace.ndjson",
            ArtifactKind::RouterMetrics => "router_metrics.json",
            ArtifactKind::MemoryPre => "memory_pre.json",
            ArtifactKind::MemoryPost => "memory_post.json",
        }
    }
}

/// Wrapper carried by every JSON artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub run_id: String,
    pub correlation_id: String,
    pub kind: ArtifactKind,
    pub written_at: DateTime<Utc>,
    pub payload: T,
}

/// Root of the per-run artifact directories.
#[derive(Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
    gate: Arc<dyn SecurityGate>,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>, gate: Arc<dyn SecurityGate>) -> Self {
        Self {
            root: root.into(),
            gate,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `<root>/<run_id>/`.
    pub fn begin_run(&self, run_id: &str, correlation_id: &str) -> ArtifactResult<RunArtifacts> {
        let dir = self.root.join(run_id);
        fs::create_dir_all(&dir)?;
        debug!(run_id, dir = %dir.display(), "Artifact directory ready");
        Ok(RunArtifacts {
            dir,
            run_id: run_id.to_string(),
            correlation_id: correlation_id.to_string(),
            gate: Arc::clone(&self.gate),
        })
    }
}

impl std::fmt::Debug for ArtifactWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactWriter")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Artifact files of one run.
pub struct RunArtifacts {
    dir: PathBuf,
    run_id: String,
    correlation_id: String,
    gate: Arc<dyn SecurityGate>,
}

impl RunArtifacts {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Write a JSON artifact inside an envelope. Every string in the payload
    /// passes through the security gate.
    pub fn write<T: Serialize>(&self, kind: ArtifactKind, payload: &T) -> ArtifactResult<PathBuf> {
        let mut payload = serde_json::to_value(payload)?;
        sanitize_value(&mut payload, self.gate.as_ref());

        let envelope = Envelope {
            run_id: self.run_id.clone(),
            correlation_id: self.correlation_id.clone(),
            kind,
            written_at: Utc::now(),
            payload,
        };
        let path = self.path(kind);
        fs::write(&path, serde_json::to_vec_pretty(&envelope)?)?;
        debug!(run_id = %self.run_id, kind = kind.file_name(), "Artifact written");
        Ok(path)
    }

    /// Sink for this run's `execution_trace.ndjson`.
    pub fn trace_sink(&self) -> ArtifactResult<NdjsonTraceSink> {
        NdjsonTraceSink::open(&self.path(ArtifactKind::ExecutionTrace))
    }
}

/// Read back a JSON artifact.
pub fn read_envelope(path: &Path) -> ArtifactResult<Envelope<Value>> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

fn sanitize_value(value: &mut Value, gate: &dyn SecurityGate) {
    match value {
        Value::String(s) => *s = gate.sanitize(s),
        Value::Array(items) => items.iter_mut().for_each(|v| sanitize_value(v, gate)),
        Value::Object(map) => map.values_mut().for_each(|v| sanitize_value(v, gate)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::PatternGate;

    #[test]
    fn test_envelope_and_redaction() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), Arc::new(PatternGate::new().unwrap()));
        let run = writer.begin_run("run_a", "corr_a").unwrap();

        let path = run
            .write(
                ArtifactKind::PreflightPlan,
                &serde_json::json!({"nodes": [{"text": "email bob@corp.example please"}]}),
            )
            .unwrap();
        assert_eq!(path, dir.path().join("run_a").join("preflight_plan.json"));

        let envelope = read_envelope(&path).unwrap();
        assert_eq!(envelope.run_id, "run_a");
        assert_eq!(envelope.correlation_id, "corr_a");
        assert_eq!(envelope.kind, ArtifactKind::PreflightPlan);
        let text = envelope.payload["nodes"][0]["text"].as_str().unwrap();
        assert!(!text.contains("bob@corp.example"));
    }
}
