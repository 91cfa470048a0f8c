//! Enclave runtime capability
//!
//! The lifecycle manager only needs three things from the platform: start an
//! image, stop an instance and list what is running. `NitroCli` drives the
//! `nitro-cli` tool for production; tests use an in-memory runtime.

use crate::config::EnclaveConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Parameters for one enclave launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub eif_path: PathBuf,
    pub cpu_count: u32,
    pub memory_mb: u32,
    pub cid: u32,
    pub debug: bool,
}

impl LaunchSpec {
    pub fn from_config(config: &EnclaveConfig) -> Self {
        Self {
            eif_path: config.eif_path.clone(),
            cpu_count: config.cpu_count,
            memory_mb: config.memory_mb,
            cid: config.cid,
            debug: config.debug,
        }
    }
}

/// Platform operations on enclaves.
#[async_trait]
pub trait EnclaveRuntime: Send + Sync {
    /// Start an enclave and return its instance identifier.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    /// Stop the enclave with the given identifier.
    async fn terminate(&self, instance_id: &str) -> Result<()>;

    /// Identifiers of the enclaves currently running on this host.
    async fn list(&self) -> Result<Vec<String>>;
}

/// `nitro-cli` backed runtime.
#[derive(Debug, Clone)]
pub struct NitroCli {
    binary: PathBuf,
}

impl NitroCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn launch_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run-enclave".to_string(),
            "--eif-path".to_string(),
            spec.eif_path.display().to_string(),
            "--cpu-count".to_string(),
            spec.cpu_count.to_string(),
            "--memory".to_string(),
            spec.memory_mb.to_string(),
            "--enclave-cid".to_string(),
            spec.cid.to_string(),
        ];
        if spec.debug {
            args.push("--debug-mode".to_string());
        }
        args
    }

    /// Run the tool to completion and return its stdout.
    async fn run(&self, args: &[String]) -> Result<String> {
        tracing::debug!(binary = %self.binary.display(), args = ?args, "Running nitro-cli");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::Lifecycle(format!(
                    "Failed to run {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Lifecycle(format!(
                "{} {} failed ({}): {}",
                self.binary.display(),
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                detail
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for NitroCli {
    fn default() -> Self {
        Self::new("nitro-cli")
    }
}

#[async_trait]
impl EnclaveRuntime for NitroCli {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let stdout = self.run(&Self::launch_args(spec)).await?;
        parse_launch_output(&stdout)
    }

    async fn terminate(&self, instance_id: &str) -> Result<()> {
        self.run(&[
            "terminate-enclave".to_string(),
            "--enclave-id".to_string(),
            instance_id.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let stdout = self.run(&["describe-enclaves".to_string()]).await?;
        parse_describe_output(&stdout)
    }
}

#[derive(Deserialize)]
struct RunEnclaveOutput {
    #[serde(rename = "EnclaveID", default)]
    enclave_id: Option<String>,
}

#[derive(Deserialize)]
struct DescribedEnclave {
    #[serde(rename = "EnclaveID", default)]
    enclave_id: Option<String>,
}

/// Extract the instance identifier from `run-enclave` output.
///
/// The tool may print log lines before the JSON document, so parsing starts
/// at the first `{`.
fn parse_launch_output(stdout: &str) -> Result<String> {
    let start = stdout
        .find('{')
        .ok_or_else(|| Error::Lifecycle("run-enclave printed no JSON output".to_string()))?;
    let output: RunEnclaveOutput = serde_json::from_str(stdout[start..].trim())
        .map_err(|e| Error::Lifecycle(format!("Invalid run-enclave output: {}", e)))?;

    output
        .enclave_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Lifecycle("run-enclave output has no EnclaveID".to_string()))
}

fn parse_describe_output(stdout: &str) -> Result<Vec<String>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let enclaves: Vec<DescribedEnclave> = serde_json::from_str(trimmed)
        .map_err(|e| Error::Lifecycle(format!("Invalid describe-enclaves output: {}", e)))?;

    // An entry without an id still counts as a running enclave.
    Ok(enclaves
        .into_iter()
        .map(|e| e.enclave_id.unwrap_or_default())
        .collect())
}
