//! Deployment configuration
//!
//! Protocol constants are compiled in; everything that differs between
//! deployments lives in a small YAML file:
//!
//! ```yaml
//! protocol: dynamic          # dynamic | fixed | dynamic_ccitt
//! replay:
//!   policy: counter          # fixed | counter
//!   path: /var/lib/relay/nonce.json
//! require_encryption: true
//! ack_timeout_secs: 900     # null keeps SENDING items until acknowledged
//! firmware_url: https://relay.example/api/fota/firmware
//! firmware_dir: /var/lib/relay/uploads
//! ```
//!
//! Keys this version does not know are kept and logged, not rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::ProtocolGeneration;
use crate::protocol::FIXED_NONCE;
use crate::security::{
    CounterNonceGuard, FileNonceStore, FixedNonceGuard, MemoryNonceStore, ReplayGuard,
};
use crate::storage::{RegisterGain, RegisterGains};
use crate::{Result, UplinkError};

const DEFAULT_FIRMWARE_URL: &str = "https://eco-watt-cloud.vercel.app/api/fota/firmware";
const DEFAULT_ACK_TIMEOUT_SECS: u64 = 900;

/// Nonce policy for encrypted uplinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// Accept exactly one nonce value
    Fixed {
        #[serde(default = "fixed_nonce")]
        nonce: u64,
    },
    /// Accept increasing nonces; persisted when `path` is set
    Counter {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

fn fixed_nonce() -> u64 {
    FIXED_NONCE
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        ReplayPolicy::Fixed { nonce: FIXED_NONCE }
    }
}

impl ReplayPolicy {
    /// Build the guard for this policy, opening the nonce file if any.
    pub async fn build_guard(&self) -> Result<Arc<dyn ReplayGuard>> {
        match self {
            ReplayPolicy::Fixed { nonce } => Ok(Arc::new(FixedNonceGuard::new(*nonce))),
            ReplayPolicy::Counter { path: Some(path) } => {
                let store = FileNonceStore::open(path.clone()).await?;
                Ok(Arc::new(CounterNonceGuard::new(Arc::new(store))))
            }
            ReplayPolicy::Counter { path: None } => {
                warn!("Replay counter is not persisted; restarts reset it to 0");
                Ok(Arc::new(CounterNonceGuard::new(Arc::new(MemoryNonceStore::default()))))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub protocol: ProtocolGeneration,
    pub replay: ReplayPolicy,
    /// Reject uplinks without the `Encryption` header
    pub require_encryption: bool,
    /// Expected `Authorization` header value, if any
    pub api_key: Option<String>,
    /// Fail `SENDING` items without acknowledgment after this many seconds;
    /// `null` waits forever
    pub ack_timeout_secs: Option<u64>,
    /// Download URL placed in firmware manifests
    pub firmware_url: String,
    /// Directory holding `firmware.bin`; firmware jobs are not gated without it
    pub firmware_dir: Option<PathBuf>,
    /// Register names and divisors; defaults to the inverter register map
    pub gains: Option<Vec<RegisterGain>>,

    #[serde(flatten)]
    pub unknown_fields: HashMap<String, serde_yaml_ng::Value>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolGeneration::default(),
            replay: ReplayPolicy::default(),
            require_encryption: false,
            api_key: None,
            ack_timeout_secs: Some(DEFAULT_ACK_TIMEOUT_SECS),
            firmware_url: DEFAULT_FIRMWARE_URL.to_string(),
            firmware_dir: None,
            gains: None,
            unknown_fields: HashMap::new(),
        }
    }
}

impl IngestConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path).await.map_err(|err| {
            UplinkError::config(format!("cannot read {}: {}", path.display(), err))
        })?;
        let config = Self::from_yaml_str(&yaml)?;
        info!("Loaded configuration from {} (protocol {})", path.display(), config.protocol);
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|err| UplinkError::config(format!("invalid YAML: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for key in self.unknown_fields.keys() {
            warn!("Ignoring unknown configuration key '{}'", key);
        }
        if self.ack_timeout_secs == Some(0) {
            return Err(UplinkError::config("ack_timeout_secs must be greater than 0"));
        }
        if self.firmware_url.trim().is_empty() {
            return Err(UplinkError::config("firmware_url must not be empty"));
        }
        if let Some(gains) = &self.gains {
            if let Some(bad) =
                gains.iter().find(|gain| !gain.divisor.is_finite() || gain.divisor == 0.0)
            {
                return Err(UplinkError::config(format!(
                    "gain divisor for '{}' must be finite and non-zero",
                    bad.name
                )));
            }
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_secs.map(Duration::from_secs)
    }

    pub fn register_gains(&self) -> RegisterGains {
        match &self.gains {
            Some(gains) => RegisterGains::new(gains.clone()),
            None => RegisterGains::default(),
        }
    }
}
