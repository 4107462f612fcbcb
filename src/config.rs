//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name used for the shared handshake secret.
pub const KEYRING_SERVICE: &str = "live-harness";

/// Environment variable consulted when the keychain has no secret.
pub const TOKEN_ENV_VAR: &str = "LIVE_HARNESS_TOKEN";

/// Execution engine tuning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Frames per second of the driving update loop.
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Logical seconds an operator gets after choosing `Pause` at a checkpoint.
    #[serde(default = "default_pause_grace_seconds")]
    pub pause_grace_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_rate: default_frame_rate(),
            pause_grace_seconds: default_pause_grace_seconds(),
        }
    }
}

impl EngineConfig {
    /// Wall-clock period between two engine ticks.
    #[must_use]
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate))
    }

    /// Grace interval granted by a `Pause` decision.
    ///
    /// Falls back to zero for values that config validation rejects.
    #[must_use]
    pub fn pause_grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.pause_grace_seconds).unwrap_or(Duration::ZERO)
    }
}

/// One UI element exposed by the simulated target application.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ElementConfig {
    /// Element name scripts refer to.
    pub name: String,
    /// Logical seconds after startup before the element becomes clickable.
    #[serde(default)]
    pub clickable_after_seconds: f64,
}

/// Simulated target application description.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TargetConfig {
    /// Host modules code images may import or require.
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,
    /// UI elements known to the target.
    #[serde(default)]
    pub elements: Vec<ElementConfig>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            modules: default_modules(),
            elements: Vec::new(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    7878
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_handshake_timeout_seconds() -> u64 {
    10
}

fn default_max_sessions() -> usize {
    8
}

fn default_frame_rate() -> u32 {
    60
}

fn default_pause_grace_seconds() -> f64 {
    10.0
}

fn default_modules() -> Vec<String> {
    vec!["host.input".into(), "host.ui".into()]
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Interface the host listens on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port the host listens on; 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest frame accepted after the handshake.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Seconds a new connection has to send its `Hello`.
    #[serde(default = "default_handshake_timeout_seconds")]
    pub handshake_timeout_seconds: u64,
    /// Maximum simultaneously registered sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Simulated target application.
    #[serde(default)]
    pub target: TargetConfig,
    /// Shared handshake secret (populated at runtime, never read from the file).
    #[serde(skip)]
    pub handshake_token: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_frame_bytes: default_max_frame_bytes(),
            handshake_timeout_seconds: default_handshake_timeout_seconds(),
            max_sessions: default_max_sessions(),
            engine: EngineConfig::default(),
            target: TargetConfig::default(),
            handshake_token: String::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the handshake secret from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither source provides a secret.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.handshake_token = load_credential("handshake_token", TOKEN_ENV_VAR).await?;
        Ok(())
    }

    /// Socket address the listener binds to.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `bind_address` is not an IP address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|err| AppError::Config(format!("invalid bind_address: {err}")))
    }

    /// Time a connection may take to complete the handshake.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.max_sessions == 0 {
            return Err(AppError::Config(
                "max_sessions must be greater than zero".into(),
            ));
        }

        if self.max_frame_bytes < crate::wire::codec::MAX_HANDSHAKE_FRAME_BYTES {
            return Err(AppError::Config(format!(
                "max_frame_bytes must be at least {} bytes",
                crate::wire::codec::MAX_HANDSHAKE_FRAME_BYTES
            )));
        }

        if self.engine.frame_rate == 0 {
            return Err(AppError::Config(
                "engine.frame_rate must be greater than zero".into(),
            ));
        }

        if Duration::try_from_secs_f64(self.engine.pause_grace_seconds).is_err() {
            return Err(AppError::Config(
                "engine.pause_grace_seconds must be a representable non-negative duration".into(),
            ));
        }

        for element in &self.target.elements {
            if element.name.trim().is_empty() {
                return Err(AppError::Config("target element name must not be empty".into()));
            }
            if Duration::try_from_secs_f64(element.clickable_after_seconds).is_err() {
                return Err(AppError::Config(format!(
                    "target element '{}' has an invalid clickable_after_seconds",
                    element.name
                )));
            }
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
