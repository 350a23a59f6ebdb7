//! Persistence of the final policy.

use fx_policy::PolicySnapshot;
use fx_types::FxResult;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name the policy is written to inside the output directory.
pub const POLICY_FILE: &str = "policy.json";

/// Receives the policy snapshot when a run finishes.
pub trait PolicySink: Send {
    fn persist(&mut self, snapshot: &PolicySnapshot) -> FxResult<()>;
}

/// Writes the snapshot as JSON to `<outdir>/policy.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    outdir: PathBuf,
}

impl JsonFileSink {
    pub fn new(outdir: impl Into<PathBuf>) -> Self {
        Self {
            outdir: outdir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.outdir.join(POLICY_FILE)
    }

    /// Read back a snapshot written by this sink.
    pub fn load(path: impl AsRef<Path>) -> FxResult<PolicySnapshot> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl PolicySink for JsonFileSink {
    fn persist(&mut self, snapshot: &PolicySnapshot) -> FxResult<()> {
        std::fs::create_dir_all(&self.outdir)?;
        let path = self.path();
        std::fs::write(&path, serde_json::to_vec_pretty(snapshot)?)?;
        info!(path = %path.display(), aspects = snapshot.log_probs.len(), "saved policy");
        Ok(())
    }
}
