//! Common utility functions shared across CLI commands.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use rollcall_core::{
    is_secure_origin, AttendanceGateway, CameraAdapter, ClientConfig, HttpGateway,
    MockBackendConfig, MockGateway, Operation, RollcallError,
};
use tracing::{debug, warn};

/// Backend selection flags shared by every subcommand.
pub struct BackendOptions {
    pub base_url: Option<String>,
    pub cookie: Option<String>,
    pub quiet: bool,
}

/// Gateway plus whether the camera may be used against it.
pub struct Backend {
    pub gateway: Arc<dyn AttendanceGateway>,
    pub secure_context: bool,
}

impl BackendOptions {
    /// Environment configuration with command-line overrides applied.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_env();
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(cookie) = self.cookie.as_ref().filter(|c| !c.trim().is_empty()) {
            config.cookie = Some(cookie.clone());
        }
        config
    }

    /// Connect to the configured HTTP backend.
    pub fn http(&self) -> Result<Backend> {
        let config = self.client_config();
        let secure_context = is_secure_origin(&config.base_url);
        if !secure_context {
            warn!(
                base_url = %config.base_url,
                "Backend origin is not a secure context; camera is blocked"
            );
        }
        let gateway = HttpGateway::new(config)?;
        debug!(base_url = %gateway.base_url(), "Using HTTP backend");
        Ok(Backend {
            gateway: Arc::new(gateway),
            secure_context,
        })
    }

    /// Wrap an in-memory backend, telling the user it is not real.
    pub fn mock(&self, gateway: Arc<MockGateway>) -> Backend {
        warn!("Using MOCK backend (nothing is recorded)");
        if !self.quiet {
            eprintln!("{}", "Using MOCK backend (nothing is recorded)".yellow());
        }
        Backend {
            gateway,
            secure_context: true,
        }
    }
}

/// Seed for the in-memory backend, so mock tokens are stable across runs.
const MOCK_SEED: u64 = 0x0A77_E4D5;

pub fn mock_gateway(config: MockBackendConfig) -> Arc<MockGateway> {
    Arc::new(MockGateway::with_config(MOCK_SEED, config))
}

/// Fail early when the camera cannot be used against this backend at all.
pub fn ensure_camera(camera: &CameraAdapter) -> Result<()> {
    camera
        .probe()
        .map_err(|reason| RollcallError::CameraBlocked(reason).into())
}

/// Attach the user-facing wording for `op` to a core error, keeping the
/// typed error in the chain for exit-code mapping.
pub fn failed(op: Operation) -> impl FnOnce(RollcallError) -> anyhow::Error {
    move |err| {
        let message = err.user_message(op);
        if message == err.to_string() {
            anyhow::Error::new(err)
        } else {
            anyhow::Error::new(err).context(message)
        }
    }
}

/// Format a token expiry as a human-readable UTC string.
pub fn format_expiry(expires_at: DateTime<Utc>) -> String {
    expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
