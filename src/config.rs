//! Enclave gateway configuration management
//!
//! Configuration is read from an optional TOML file and then overridden by
//! the environment variables the deployment manifests set (`ENCLAVE_CID`,
//! `KMS_KEY_ARN`, ...). Every section has a usable default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Enclave launch parameters
    pub enclave: EnclaveConfig,

    /// Vsock channel behaviour
    pub channel: ChannelConfig,

    /// Key-management configuration
    pub kms: KmsConfig,

    /// KMS tunnel (vsock-proxy) configuration
    pub tunnel: TunnelConfig,

    /// Startup sequencing
    pub startup: StartupConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

/// Enclave launch parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Context identifier assigned to the enclave
    pub cid: u32,

    /// Vsock port the enclave server listens on
    pub port: u32,

    /// Path to the enclave image file
    pub eif_path: PathBuf,

    /// vCPUs allotted to the enclave
    pub cpu_count: u32,

    /// Memory allotted to the enclave in MiB
    pub memory_mb: u32,

    /// Launch in debug mode (console attached, attestation PCRs zeroed)
    pub debug: bool,

    /// Path to the `nitro-cli` binary (bare name = search PATH)
    pub nitro_cli: PathBuf,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            cid: 16,
            port: 5000,
            eif_path: PathBuf::from("/enclave/server.eif"),
            cpu_count: 2,
            memory_mb: 2048,
            debug: false,
            nitro_cli: PathBuf::from("nitro-cli"),
        }
    }
}

/// Vsock channel behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Dial attempts per call before giving up
    pub connect_attempts: u32,

    /// Fixed delay between dial attempts in milliseconds
    pub retry_delay_ms: u64,

    /// Deadline covering one write+read exchange in seconds
    pub call_timeout_secs: u64,

    /// Largest frame accepted or produced, in bytes
    pub max_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            retry_delay_ms: 1000,
            call_timeout_secs: 30,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ChannelConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Key-management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// KMS key ARN or id used to encrypt payloads (empty = not configured)
    pub key_id: String,

    /// AWS region for KMS and relayed credentials
    pub region: String,

    /// Vsock port the enclave uses to reach the KMS tunnel
    pub proxy_port: u16,

    /// Timeout for encrypt and credential calls in seconds
    pub request_timeout_secs: u64,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            region: "us-east-1".to_string(),
            proxy_port: 8000,
            request_timeout_secs: 10,
        }
    }
}

impl KmsConfig {
    /// The configured key, if any.
    pub fn key_id(&self) -> Option<&str> {
        let key = self.key_id.trim();
        (!key.is_empty()).then_some(key)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// What a dead KMS tunnel means for startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelPolicy {
    /// Log tunnel failures and keep serving
    #[default]
    BestEffort,
    /// Abort startup if the tunnel is down after warm-up
    Required,
}

/// KMS tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Spawn the tunnel at startup
    pub enabled: bool,

    /// Tunnel program (bare name = search PATH)
    pub program: PathBuf,

    /// Remote endpoint host (None = `kms.<region>.amazonaws.com`)
    pub remote_host: Option<String>,

    /// Remote endpoint port
    pub remote_port: u16,

    /// Startup policy when the tunnel is down
    pub policy: TunnelPolicy,

    /// Respawn the tunnel when it exits
    pub restart_on_exit: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: PathBuf::from("vsock-proxy"),
            remote_host: None,
            remote_port: 443,
            policy: TunnelPolicy::BestEffort,
            restart_on_exit: false,
        }
    }
}

impl TunnelConfig {
    /// Remote host the tunnel forwards to.
    pub fn remote_host(&self, region: &str) -> String {
        self.remote_host
            .clone()
            .unwrap_or_else(|| format!("kms.{}.amazonaws.com", region))
    }
}

/// Startup sequencing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Delay between enclave launch and the verification ping, in seconds
    pub warmup_secs: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { warmup_secs: 5 }
    }
}

impl StartupConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from an optional TOML file, then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Apply environment overrides. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_env(&get, "PORT") {
            self.server.port = port;
        }
        if let Some(cid) = parse_env(&get, "ENCLAVE_CID") {
            self.enclave.cid = cid;
        }
        if let Some(port) = parse_env(&get, "VSOCK_PORT") {
            self.enclave.port = port;
        }
        if let Some(path) = get("EIF_PATH") {
            self.enclave.eif_path = PathBuf::from(path);
        }
        if let Some(cpus) = parse_env(&get, "ENCLAVE_CPUS") {
            self.enclave.cpu_count = cpus;
        }
        if let Some(memory) = parse_env(&get, "ENCLAVE_MEMORY_MB") {
            self.enclave.memory_mb = memory;
        }
        if get("DEBUG").is_some() {
            self.enclave.debug = true;
        }
        if let Some(key) = get("KMS_KEY_ARN") {
            self.kms.key_id = key;
        }
        if let Some(port) = parse_env(&get, "KMS_PROXY_PORT") {
            self.kms.proxy_port = port;
        }
        if let Some(region) = get("AWS_REGION") {
            self.kms.region = region;
        }
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.enclave.cpu_count == 0 {
            return Err(Error::Config("enclave.cpu_count must be at least 1".to_string()));
        }
        if self.enclave.memory_mb == 0 {
            return Err(Error::Config("enclave.memory_mb must be at least 1".to_string()));
        }
        if self.channel.connect_attempts == 0 {
            return Err(Error::Config(
                "channel.connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.channel.call_timeout_secs == 0 {
            return Err(Error::Config(
                "channel.call_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.channel.max_frame_bytes == 0 || self.channel.max_frame_bytes > u32::MAX as usize {
            return Err(Error::Config(
                "channel.max_frame_bytes must be between 1 and 4294967295".to_string(),
            ));
        }
        if self.kms.region.trim().is_empty() {
            return Err(Error::Config("kms.region must not be empty".to_string()));
        }
        if self.kms.request_timeout_secs == 0 {
            return Err(Error::Config(
                "kms.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T, G>(get: &G, key: &str) -> Option<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
