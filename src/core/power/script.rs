// src/core/power/script.rs

//! The script-runner collaborator: launching suspend/resume programs
//! without ever blocking the controller loop.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    Suspend,
    Resume,
    ResumeFail,
}

/// One script invocation. The node list rides as the single argument; the
/// resume flow additionally passes the JSON document path in the
/// environment.
#[derive(Clone, Debug)]
pub struct ScriptSpec {
    pub kind: ScriptKind,
    pub program: PathBuf,
    pub nodelist: String,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Reported back to the controller when a script exits (or is killed).
#[derive(Clone, Debug)]
pub struct ScriptCompletion {
    pub kind: ScriptKind,
    pub nodelist: String,
    pub success: bool,
}

/// The launch seam. The controller fires and forgets; completions come back
/// over a channel and are reconciled on a later pass.
pub trait ScriptRunner: Send + Sync {
    fn spawn(&self, spec: ScriptSpec);
}

/// Runs scripts as real child processes under the tokio runtime, killing
/// them at the timeout. Exit status is reported on the completion channel.
pub struct ProcessScriptRunner {
    completion_tx: mpsc::Sender<ScriptCompletion>,
}

impl ProcessScriptRunner {
    pub fn new(completion_tx: mpsc::Sender<ScriptCompletion>) -> Self {
        Self { completion_tx }
    }
}

impl ScriptRunner for ProcessScriptRunner {
    fn spawn(&self, spec: ScriptSpec) {
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let mut cmd = tokio::process::Command::new(&spec.program);
            cmd.arg(&spec.nodelist)
                .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let success = match cmd.spawn() {
                Ok(mut child) => {
                    match tokio::time::timeout(spec.timeout, child.wait()).await {
                        Ok(Ok(status)) => status.success(),
                        Ok(Err(e)) => {
                            warn!(
                                "{:?} script {} failed to run: {e}",
                                spec.kind,
                                spec.program.display()
                            );
                            false
                        }
                        Err(_) => {
                            warn!(
                                "{:?} script {} exceeded its {:?} timeout; killing",
                                spec.kind,
                                spec.program.display(),
                                spec.timeout
                            );
                            let _ = child.kill().await;
                            false
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Could not launch {:?} script {}: {e}",
                        spec.kind,
                        spec.program.display()
                    );
                    false
                }
            };
            debug!(
                "{:?} script for '{}' finished, success={success}",
                spec.kind, spec.nodelist
            );
            let _ = tx
                .send(ScriptCompletion {
                    kind: spec.kind,
                    nodelist: spec.nodelist,
                    success,
                })
                .await;
        });
    }
}

/// One job's entry in the resume document handed to the resume program.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeJobRecord {
    pub job_id: u32,
    pub extra: Option<String>,
    pub features: Option<String>,
    pub nodes_alloc: String,
    pub nodes_resume: String,
    pub oversubscribe: String,
    pub partition: String,
    pub reservation: Option<String>,
}

/// The resume document: a cluster-level aggregate plus per-job records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeFile {
    pub all_nodes_resume: String,
    pub jobs: Vec<ResumeJobRecord>,
}

/// Environment variable carrying the resume document path.
pub const RESUME_FILE_ENV: &str = "LODESTAR_RESUME_FILE";

impl ResumeFile {
    /// Writes the document under the state directory and returns its path.
    pub fn write(&self, state_dir: &std::path::Path) -> std::io::Result<PathBuf> {
        let path = state_dir.join(format!("resume_{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}
