//! Enclave lifecycle management
//!
//! Tracks the single enclave this host runs:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!               |
//!               +-> Failed -> Starting (relaunch)
//! ```
//!
//! The instance identifier and the state live in one slot behind a write
//! lock, so they always change together. The identifier is set only while
//! the enclave is `Running` or `Stopping`.

use super::runtime::{EnclaveRuntime, LaunchSpec};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Enclave lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnclaveState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for EnclaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of the tracked enclave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnclaveInstance {
    pub instance_id: String,
    pub cid: u32,
    pub port: u32,
    pub state: EnclaveState,
    pub launched_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Slot {
    state: EnclaveState,
    instance: Option<EnclaveInstance>,
}

impl Slot {
    fn set(&mut self, state: EnclaveState) {
        self.state = state;
        if let Some(instance) = self.instance.as_mut() {
            instance.state = state;
        }
    }
}

/// Resets the slot to `Failed` if a launch is dropped before the runtime
/// call returns.
struct LaunchGuard {
    slot: Arc<RwLock<Slot>>,
    armed: bool,
}

impl LaunchGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

fn reset_abandoned(slot: &mut Slot) {
    if slot.state == EnclaveState::Starting {
        slot.instance = None;
        slot.set(EnclaveState::Failed);
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("Enclave launch cancelled before the runtime returned");

        if let Ok(mut slot) = self.slot.try_write() {
            reset_abandoned(&mut slot);
            return;
        }
        // A reader holds the lock; finish the reset once it is released.
        let slot = self.slot.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                reset_abandoned(&mut *slot.write().await);
            });
        }
    }
}

/// Owns the enclave instance and drives it through the runtime.
pub struct EnclaveLifecycle {
    runtime: Arc<dyn EnclaveRuntime>,
    port: u32,
    slot: Arc<RwLock<Slot>>,
}

impl std::fmt::Debug for EnclaveLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveLifecycle")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl EnclaveLifecycle {
    /// `port` is the vsock port the enclave server listens on.
    pub fn new(runtime: Arc<dyn EnclaveRuntime>, port: u32) -> Self {
        Self {
            runtime,
            port,
            slot: Arc::new(RwLock::new(Slot {
                state: EnclaveState::Stopped,
                instance: None,
            })),
        }
    }

    /// Launch the enclave.
    ///
    /// Refused while an enclave is starting, running or stopping. On runtime
    /// failure the state becomes `Failed` and the error is returned. Dropping
    /// the future mid-launch also leaves the state `Failed`.
    pub async fn launch(&self, spec: &LaunchSpec) -> Result<EnclaveInstance> {
        {
            let mut slot = self.slot.write().await;
            match slot.state {
                EnclaveState::Stopped | EnclaveState::Failed => {}
                state => {
                    return Err(Error::Lifecycle(format!(
                        "Cannot launch enclave while {}",
                        state
                    )))
                }
            }
            slot.instance = None;
            slot.set(EnclaveState::Starting);
        }

        tracing::info!(
            eif = %spec.eif_path.display(),
            cpus = spec.cpu_count,
            memory_mb = spec.memory_mb,
            cid = spec.cid,
            debug = spec.debug,
            "Launching enclave"
        );

        let mut guard = LaunchGuard {
            slot: self.slot.clone(),
            armed: true,
        };
        let launched = self.runtime.launch(spec).await;
        guard.disarm();

        match launched {
            Ok(instance_id) => {
                let instance = EnclaveInstance {
                    instance_id,
                    cid: spec.cid,
                    port: self.port,
                    state: EnclaveState::Running,
                    launched_at: Utc::now(),
                };
                let mut slot = self.slot.write().await;
                slot.state = EnclaveState::Running;
                slot.instance = Some(instance.clone());

                tracing::info!(instance_id = %instance.instance_id, "Enclave running");
                Ok(instance)
            }
            Err(e) => {
                let mut slot = self.slot.write().await;
                slot.instance = None;
                slot.set(EnclaveState::Failed);

                tracing::error!(error = %e, "Enclave launch failed");
                Err(e)
            }
        }
    }

    /// Stop the enclave. Best-effort: runtime errors are logged, and the
    /// instance is forgotten either way. No-op when nothing is tracked.
    pub async fn terminate(&self) {
        let instance_id = {
            let mut slot = self.slot.write().await;
            if slot.state != EnclaveState::Running {
                return;
            }
            let Some(id) = slot.instance.as_ref().map(|i| i.instance_id.clone()) else {
                return;
            };
            slot.set(EnclaveState::Stopping);
            id
        };

        tracing::info!(instance_id = %instance_id, "Terminating enclave");

        if let Err(e) = self.runtime.terminate(&instance_id).await {
            tracing::warn!(
                instance_id = %instance_id,
                error = %e,
                "Failed to terminate enclave"
            );
        }

        let mut slot = self.slot.write().await;
        slot.instance = None;
        slot.set(EnclaveState::Stopped);
    }

    /// True if the runtime reports any running enclave.
    ///
    /// This is a liveness probe of the host, not a check of the tracked
    /// identifier.
    pub async fn is_healthy(&self) -> bool {
        match self.runtime.list().await {
            Ok(ids) => !ids.is_empty(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list enclaves");
                false
            }
        }
    }

    pub async fn state(&self) -> EnclaveState {
        self.slot.read().await.state
    }

    pub async fn instance(&self) -> Option<EnclaveInstance> {
        self.slot.read().await.instance.clone()
    }

    /// Identifier of the tracked enclave, empty when none.
    pub async fn instance_id(&self) -> String {
        self.slot
            .read()
            .await
            .instance
            .as_ref()
            .map(|i| i.instance_id.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnclaveConfig;
    use crate::enclave::testing::FakeRuntime;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn setup() -> (Arc<FakeRuntime>, EnclaveLifecycle, LaunchSpec) {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = EnclaveLifecycle::new(runtime.clone(), 5000);
        (runtime, lifecycle, LaunchSpec::from_config(&EnclaveConfig::default()))
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (_, lifecycle, _) = setup();
        assert_eq!(lifecycle.state().await, EnclaveState::Stopped);
        assert_eq!(lifecycle.instance_id().await, "");
        assert!(!lifecycle.is_healthy().await);
    }

    #[tokio::test]
    async fn test_launch_records_instance() {
        let (runtime, lifecycle, spec) = setup();

        let instance = lifecycle.launch(&spec).await.unwrap();
        assert_eq!(instance.cid, 16);
        assert_eq!(instance.port, 5000);
        assert_eq!(instance.state, EnclaveState::Running);
        assert_eq!(lifecycle.state().await, EnclaveState::Running);
        assert_eq!(lifecycle.instance_id().await, instance.instance_id);
        assert!(lifecycle.is_healthy().await);
        assert_eq!(runtime.launches.lock().unwrap()[0], spec);
    }

    #[tokio::test]
    async fn test_launch_refused_while_running() {
        let (runtime, lifecycle, spec) = setup();
        lifecycle.launch(&spec).await.unwrap();

        let err = lifecycle.launch(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert_eq!(runtime.launches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_then_relaunch_gets_fresh_id() {
        let (runtime, lifecycle, spec) = setup();

        let first = lifecycle.launch(&spec).await.unwrap();
        lifecycle.terminate().await;
        assert_eq!(lifecycle.state().await, EnclaveState::Stopped);
        assert_eq!(lifecycle.instance_id().await, "");
        assert!(lifecycle.instance().await.is_none());

        let second = lifecycle.launch(&spec).await.unwrap();
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(lifecycle.state().await, EnclaveState::Running);
        assert_eq!(*runtime.terminated.lock().unwrap(), vec![first.instance_id]);
    }

    #[tokio::test]
    async fn test_failed_launch_then_relaunch() {
        let (runtime, lifecycle, spec) = setup();
        runtime.fail_launch.store(true, Ordering::SeqCst);

        let err = lifecycle.launch(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert_eq!(lifecycle.state().await, EnclaveState::Failed);
        assert_eq!(lifecycle.instance_id().await, "");

        runtime.fail_launch.store(false, Ordering::SeqCst);
        lifecycle.launch(&spec).await.unwrap();
        assert_eq!(lifecycle.state().await, EnclaveState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_launch_can_be_retried() {
        let (runtime, lifecycle, spec) = setup();
        runtime.hang_launch.store(true, Ordering::SeqCst);

        let launch = tokio::time::timeout(Duration::from_secs(1), lifecycle.launch(&spec)).await;
        assert!(launch.is_err());
        assert_eq!(lifecycle.state().await, EnclaveState::Failed);
        assert_eq!(lifecycle.instance_id().await, "");

        runtime.hang_launch.store(false, Ordering::SeqCst);
        let instance = lifecycle.launch(&spec).await.unwrap();
        assert_eq!(lifecycle.state().await, EnclaveState::Running);
        assert_eq!(lifecycle.instance_id().await, instance.instance_id);
    }

    #[tokio::test]
    async fn test_terminate_without_instance_is_noop() {
        let (runtime, lifecycle, _) = setup();
        lifecycle.terminate().await;

        assert_eq!(lifecycle.state().await, EnclaveState::Stopped);
        assert!(runtime.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_error_is_swallowed() {
        let (runtime, lifecycle, spec) = setup();
        lifecycle.launch(&spec).await.unwrap();
        runtime.fail_terminate.store(true, Ordering::SeqCst);

        lifecycle.terminate().await;
        assert_eq!(lifecycle.state().await, EnclaveState::Stopped);
        assert_eq!(lifecycle.instance_id().await, "");
        assert_eq!(runtime.terminated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_is_independent_of_tracked_id() {
        let (runtime, lifecycle, spec) = setup();
        runtime.launch(&spec).await.unwrap();

        // Enclave started outside this manager still counts as healthy.
        assert!(lifecycle.is_healthy().await);
        assert_eq!(lifecycle.instance_id().await, "");
    }
}
