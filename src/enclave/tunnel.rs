//! KMS tunnel supervision
//!
//! The enclave has no network of its own. It reaches the key-management
//! endpoint through a `vsock-proxy` process on the host that forwards a
//! local vsock port to `kms.<region>.amazonaws.com:443`. `KeyTunnel` runs
//! that process as a supervised background task and publishes its health on
//! a watch channel.

use crate::config::{KmsConfig, TunnelConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Observable tunnel state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelHealth {
    /// Spawn in progress
    Starting,
    /// Process is alive
    Running { pid: Option<u32> },
    /// Process exited on its own
    Exited { code: Option<i32> },
    /// Process could not be spawned or waited on
    Failed { reason: String },
    /// Shut down by the gateway
    Stopped,
}

impl TunnelHealth {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Exited or failed, as opposed to starting, running or stopped.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Failed { .. })
    }
}

/// Program and arguments of the tunnel process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TunnelCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `vsock-proxy <proxy_port> <remote_host> <remote_port>`
    pub fn vsock_proxy(tunnel: &TunnelConfig, kms: &KmsConfig) -> Self {
        Self::new(
            tunnel.program.clone(),
            vec![
                kms.proxy_port.to_string(),
                tunnel.remote_host(&kms.region),
                tunnel.remote_port.to_string(),
            ],
        )
    }
}

/// Respawn behaviour after the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    pub fn never() -> Self {
        Self {
            enabled: false,
            ..Self::with_backoff()
        }
    }

    /// Restart with 2s backoff doubling up to 60s.
    pub fn with_backoff() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        if config.restart_on_exit {
            Self::with_backoff()
        } else {
            Self::never()
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Handle to the supervised tunnel process.
pub struct KeyTunnel {
    health: watch::Receiver<TunnelHealth>,
    cancel: CancellationToken,
    spawns: Arc<AtomicU32>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for KeyTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyTunnel")
            .field("health", &*self.health.borrow())
            .field("spawns", &self.spawns.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl KeyTunnel {
    /// Start supervising `command` in a background task. Returns immediately.
    pub fn spawn(command: TunnelCommand, restart: RestartPolicy) -> Self {
        let (tx, rx) = watch::channel(TunnelHealth::Starting);
        let cancel = CancellationToken::new();
        let spawns = Arc::new(AtomicU32::new(0));

        let task = tokio::spawn(supervise(command, restart, tx, cancel.clone(), spawns.clone()));

        Self {
            health: rx,
            cancel,
            spawns,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn health(&self) -> TunnelHealth {
        self.health.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelHealth> {
        self.health.clone()
    }

    /// Wait until the current spawn attempt has either started or failed.
    pub async fn settled(&self) -> TunnelHealth {
        let mut rx = self.health.clone();
        let health = match rx.wait_for(|h| *h != TunnelHealth::Starting).await {
            Ok(health) => health.clone(),
            Err(_) => self.health(),
        };
        health
    }

    /// Number of times the process has been spawned.
    pub fn spawns(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Blocks `shutdown` from reaping the supervisor while the guard lives.
    #[cfg(test)]
    pub(crate) async fn hold_shutdown(
        &self,
    ) -> tokio::sync::OwnedMutexGuard<Option<JoinHandle<()>>> {
        self.task.clone().lock_owned().await
    }

    /// Kill the process and stop supervising. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "KMS tunnel supervisor panicked");
            }
        }
    }
}

async fn supervise(
    command: TunnelCommand,
    restart: RestartPolicy,
    tx: watch::Sender<TunnelHealth>,
    cancel: CancellationToken,
    spawns: Arc<AtomicU32>,
) {
    let mut backoff = restart.initial_backoff;

    loop {
        tx.send_replace(TunnelHealth::Starting);
        spawns.fetch_add(1, Ordering::SeqCst);

        let spawned = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                let pid = child.id();
                tracing::info!(
                    program = %command.program.display(),
                    args = ?command.args,
                    pid = ?pid,
                    "KMS tunnel started"
                );
                tx.send_replace(TunnelHealth::Running { pid });

                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(error = %e, "Failed to kill KMS tunnel");
                        }
                        tx.send_replace(TunnelHealth::Stopped);
                        tracing::info!("KMS tunnel stopped");
                        return;
                    }
                    status = child.wait() => match status {
                        Ok(status) => {
                            tracing::warn!(code = ?status.code(), "KMS tunnel exited");
                            tx.send_replace(TunnelHealth::Exited { code: status.code() });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to wait on KMS tunnel");
                            tx.send_replace(TunnelHealth::Failed { reason: e.to_string() });
                        }
                    },
                }
            }
            Err(e) => {
                tracing::error!(
                    program = %command.program.display(),
                    error = %e,
                    "Failed to start KMS tunnel"
                );
                tx.send_replace(TunnelHealth::Failed {
                    reason: format!("Failed to spawn {}: {}", command.program.display(), e),
                });
            }
        }

        if !restart.enabled {
            return;
        }

        tracing::info!(delay_ms = backoff.as_millis() as u64, "Restarting KMS tunnel");
        tokio::select! {
            _ = cancel.cancelled() => {
                tx.send_replace(TunnelHealth::Stopped);
                return;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff, restart.max_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for<F>(tunnel: &KeyTunnel, pred: F) -> TunnelHealth
    where
        F: FnMut(&TunnelHealth) -> bool,
    {
        let mut rx = tunnel.subscribe();
        let health = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
            .await
            .expect("tunnel health did not change in time")
            .expect("tunnel supervisor ended");
        health.clone()
    }

    #[test]
    fn test_vsock_proxy_command() {
        let command = TunnelCommand::vsock_proxy(&TunnelConfig::default(), &KmsConfig::default());
        assert_eq!(command.program, PathBuf::from("vsock-proxy"));
        assert_eq!(command.args, vec!["8000", "kms.us-east-1.amazonaws.com", "443"]);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = RestartPolicy::with_backoff();
        let mut delay = policy.initial_backoff;
        let mut seen = vec![delay.as_secs()];
        for _ in 0..6 {
            delay = next_backoff(delay, policy.max_backoff);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_restart_policy_from_config() {
        let mut config = TunnelConfig::default();
        assert!(!RestartPolicy::from_config(&config).enabled);
        config.restart_on_exit = true;
        assert_eq!(RestartPolicy::from_config(&config), RestartPolicy::with_backoff());
    }

    #[tokio::test]
    async fn test_missing_program_reports_failed() {
        let tunnel = KeyTunnel::spawn(
            TunnelCommand::new("/nonexistent/vsock-proxy", vec![]),
            RestartPolicy::never(),
        );

        let health = wait_for(&tunnel, |h| h.is_down()).await;
        assert!(matches!(health, TunnelHealth::Failed { ref reason } if reason.contains("/nonexistent")));
        tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_settled_skips_starting() {
        let tunnel = KeyTunnel::spawn(
            TunnelCommand::new("/nonexistent/vsock-proxy", vec![]),
            RestartPolicy::never(),
        );

        let health = tokio::time::timeout(Duration::from_secs(10), tunnel.settled())
            .await
            .expect("tunnel did not settle");
        assert!(matches!(health, TunnelHealth::Failed { .. }));

        // The supervisor has finished, so settling reads the last value.
        tunnel.shutdown().await;
        assert!(matches!(tunnel.settled().await, TunnelHealth::Failed { .. }));
    }

    #[tokio::test]
    async fn test_exiting_process_reports_exit_code() {
        let tunnel = KeyTunnel::spawn(
            TunnelCommand::new("sh", vec!["-c".to_string(), "exit 3".to_string()]),
            RestartPolicy::never(),
        );

        let health = wait_for(&tunnel, |h| h.is_down()).await;
        assert_eq!(health, TunnelHealth::Exited { code: Some(3) });
        assert_eq!(tunnel.spawns(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_kills_running_process() {
        let tunnel = KeyTunnel::spawn(
            TunnelCommand::new("sleep", vec!["30".to_string()]),
            RestartPolicy::never(),
        );

        let health = wait_for(&tunnel, |h| h.is_running()).await;
        assert!(matches!(health, TunnelHealth::Running { pid: Some(_) }));

        tunnel.shutdown().await;
        assert_eq!(tunnel.health(), TunnelHealth::Stopped);

        // Second shutdown is a no-op.
        tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_on_exit() {
        let restart = RestartPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        };
        let tunnel = KeyTunnel::spawn(TunnelCommand::new("true", vec![]), restart);

        tokio::time::timeout(Duration::from_secs(10), async {
            while tunnel.spawns() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tunnel was not restarted");

        tunnel.shutdown().await;
        assert_eq!(tunnel.health(), TunnelHealth::Stopped);
    }

    #[test]
    fn test_health_serialization() {
        let json = serde_json::to_value(TunnelHealth::Running { pid: Some(42) }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "running", "pid": 42}));
        assert!(TunnelHealth::Exited { code: Some(1) }.is_down());
        assert!(!TunnelHealth::Stopped.is_down());
    }
}
