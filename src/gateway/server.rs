//! Gateway server implementation

use crate::config::{GatewayConfig, TunnelPolicy};
use crate::enclave::{
    AwsCredentialProvider, AwsKms, Connector, CredentialProvider, CredentialRelay,
    EnclaveChannel, EnclaveLifecycle, EnclaveOrchestrator, EnclaveRuntime, KeyManagement,
    KeyTunnel, LaunchSpec, NitroCli, RestartPolicy, TunnelCommand, TunnelHealth, VsockConnector,
};
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Longest wait for the tunnel's first spawn attempt when it is required.
const TUNNEL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Starting up
    Starting,
    /// Running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// Enclave gateway: owns the enclave, the KMS tunnel and the orchestrator.
pub struct Gateway {
    config: GatewayConfig,
    state: Arc<RwLock<GatewayState>>,
    lifecycle: Arc<EnclaveLifecycle>,
    orchestrator: Arc<EnclaveOrchestrator>,
    tunnel_command: Option<TunnelCommand>,
    tunnel: RwLock<Option<KeyTunnel>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .field("tunnel_command", &self.tunnel_command)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build a gateway wired to the production collaborators: `nitro-cli`,
    /// vsock, AWS KMS and the AWS default credential chain.
    pub fn from_sdk_config(config: GatewayConfig, sdk_config: &aws_config::SdkConfig) -> Result<Self> {
        let runtime = Arc::new(NitroCli::new(config.enclave.nitro_cli.clone()));
        let connector = Arc::new(VsockConnector::new(config.enclave.cid, config.enclave.port));
        let kms = Arc::new(AwsKms::from_sdk_config(sdk_config));
        let provider = Arc::new(AwsCredentialProvider::from_sdk_config(sdk_config)?);

        GatewayBuilder::new(config)
            .runtime(runtime)
            .connector(connector)
            .kms(kms)
            .credential_provider(provider)
            .build()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    pub fn lifecycle(&self) -> &Arc<EnclaveLifecycle> {
        &self.lifecycle
    }

    pub fn orchestrator(&self) -> &Arc<EnclaveOrchestrator> {
        &self.orchestrator
    }

    /// Current tunnel health, `None` when the tunnel is not running under
    /// this gateway.
    pub async fn tunnel_health(&self) -> Option<TunnelHealth> {
        self.tunnel.read().await.as_ref().map(KeyTunnel::health)
    }

    /// Start the gateway
    ///
    /// Spawns the tunnel, launches the enclave, waits for warm-up and
    /// verifies the enclave with a ping. Launch and ping failures are fatal;
    /// a dead tunnel is fatal only under [`TunnelPolicy::Required`]. On
    /// failure everything started so far is torn down again.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Lifecycle("Gateway already running".to_string()));
        }
        *state = GatewayState::Starting;
        drop(state);

        tracing::info!("Starting enclave gateway");

        if let Err(e) = self.boot().await {
            tracing::error!(error = %e, "Enclave gateway startup failed");
            self.teardown().await;
            *self.state.write().await = GatewayState::Stopped;
            return Err(e);
        }

        *self.state.write().await = GatewayState::Running;

        tracing::info!(
            enclave_cid = self.config.enclave.cid,
            vsock_port = self.config.enclave.port,
            "Enclave gateway started"
        );

        Ok(())
    }

    async fn boot(&self) -> Result<()> {
        if let Some(command) = &self.tunnel_command {
            let tunnel = KeyTunnel::spawn(
                command.clone(),
                RestartPolicy::from_config(&self.config.tunnel),
            );
            *self.tunnel.write().await = Some(tunnel);
        } else {
            tracing::info!("KMS tunnel disabled");
        }

        self.lifecycle
            .launch(&LaunchSpec::from_config(&self.config.enclave))
            .await?;

        let warmup = self.config.startup.warmup();
        if !warmup.is_zero() {
            tracing::info!(seconds = warmup.as_secs(), "Waiting for enclave to warm up");
            tokio::time::sleep(warmup).await;
        }

        if !self.orchestrator.ping().await? {
            return Err(Error::Lifecycle(
                "Enclave ping returned a non-ok status".to_string(),
            ));
        }
        tracing::info!("Enclave answered ping");

        self.check_tunnel().await
    }

    async fn check_tunnel(&self) -> Result<()> {
        let tunnel = self.tunnel.read().await;
        let Some(tunnel) = tunnel.as_ref() else {
            if self.config.tunnel.policy == TunnelPolicy::Required {
                tracing::warn!("KMS tunnel is required but disabled; policy ignored");
            }
            return Ok(());
        };

        let health = match self.config.tunnel.policy {
            TunnelPolicy::Required => tokio::time::timeout(TUNNEL_SETTLE_TIMEOUT, tunnel.settled())
                .await
                .unwrap_or_else(|_| tunnel.health()),
            TunnelPolicy::BestEffort => tunnel.health(),
        };

        if health.is_down() {
            match self.config.tunnel.policy {
                TunnelPolicy::Required => {
                    return Err(Error::Tunnel(format!("KMS tunnel is down: {:?}", health)))
                }
                TunnelPolicy::BestEffort => {
                    tracing::warn!(health = ?health, "KMS tunnel is down, continuing without it")
                }
            }
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.lifecycle.terminate().await;
        let tunnel = self.tunnel.write().await.take();
        if let Some(tunnel) = tunnel {
            tunnel.shutdown().await;
        }
    }

    /// Stop the gateway: terminate the enclave, then the tunnel.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return Ok(());
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping enclave gateway");

        self.teardown().await;

        *self.state.write().await = GatewayState::Stopped;

        tracing::info!("Enclave gateway stopped");

        Ok(())
    }
}

/// Builder for Gateway
pub struct GatewayBuilder {
    config: GatewayConfig,
    runtime: Option<Arc<dyn EnclaveRuntime>>,
    connector: Option<Arc<dyn Connector>>,
    kms: Option<Arc<dyn KeyManagement>>,
    provider: Option<Arc<dyn CredentialProvider>>,
    tunnel_command: Option<Option<TunnelCommand>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            runtime: None,
            connector: None,
            kms: None,
            provider: None,
            tunnel_command: None,
        }
    }

    pub fn runtime(mut self, runtime: Arc<dyn EnclaveRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn kms(mut self, kms: Arc<dyn KeyManagement>) -> Self {
        self.kms = Some(kms);
        self
    }

    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Override the tunnel process (`None` = no tunnel). Defaults to
    /// `vsock-proxy` when the tunnel is enabled in config.
    pub fn tunnel_command(mut self, command: Option<TunnelCommand>) -> Self {
        self.tunnel_command = Some(command);
        self
    }

    /// Build the gateway
    pub fn build(self) -> Result<Gateway> {
        let config = self.config;
        let runtime = self
            .runtime
            .ok_or_else(|| Error::Config("Gateway requires an enclave runtime".to_string()))?;
        let connector = self
            .connector
            .ok_or_else(|| Error::Config("Gateway requires an enclave connector".to_string()))?;
        let kms = self
            .kms
            .ok_or_else(|| Error::Config("Gateway requires a KMS client".to_string()))?;
        let provider = self
            .provider
            .ok_or_else(|| Error::Config("Gateway requires a credential provider".to_string()))?;

        let tunnel_command = self.tunnel_command.unwrap_or_else(|| {
            config
                .tunnel
                .enabled
                .then(|| TunnelCommand::vsock_proxy(&config.tunnel, &config.kms))
        });

        let channel = EnclaveChannel::from_config(connector, &config.channel);
        let credentials = CredentialRelay::new(
            provider,
            config.kms.region.clone(),
            config.kms.request_timeout(),
        );
        let orchestrator = EnclaveOrchestrator::new(channel, kms, credentials, &config.kms);
        let lifecycle = EnclaveLifecycle::new(runtime, config.enclave.port);

        Ok(Gateway {
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            lifecycle: Arc::new(lifecycle),
            orchestrator: Arc::new(orchestrator),
            tunnel_command,
            tunnel: RwLock::new(None),
            config,
        })
    }
}
