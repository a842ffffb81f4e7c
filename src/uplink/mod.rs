//! Uplink orchestration.
//!
//! [`UplinkService`] turns one device upload into one response: it checks the
//! request envelope, authenticates and decrypts the body, decodes the frame,
//! stores the readings best-effort and piggybacks at most one command of each
//! kind onto the response.
//!
//! ```text
//! api key ─▶ content type ─▶ [nonce ─▶ MAC ─▶ consume nonce ─▶ decrypt] ─▶ decode
//!        ─▶ inline Config-Ack ─▶ store readings ─▶ claim config / write / firmware
//! ```
//!
//! Any failure up to and including decode is returned as an [`UplinkError`];
//! everything after decode degrades instead of failing the request.
//!
//! ```rust
//! use std::sync::Arc;
//! use uplink_relay::codec::ProtocolGeneration;
//! use uplink_relay::queue::MemoryCommandStore;
//! use uplink_relay::storage::MemoryReadingSink;
//! use uplink_relay::uplink::{UplinkRequest, UplinkService};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let service = UplinkService::new(
//!     ProtocolGeneration::Dynamic,
//!     Arc::new(MemoryReadingSink::new()),
//!     Arc::new(MemoryCommandStore::new()),
//! );
//! let err = service.handle(&UplinkRequest::new(vec![0u8; 3])).await.unwrap_err();
//! assert_eq!(err.status_code(), 400);
//! # }
//! ```

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::codec::{DecodedFrame, FrameCodec, ProtocolGeneration};
use crate::config::IngestConfig;
use crate::protocol::{ENCRYPTION_SCHEME, UPLINK_CONTENT_TYPE};
use crate::queue::{
    AckOutcome, ArtifactGate, CommandKind, CommandQueue, CommandResult, CommandStore, ConfigAck,
    ConfigKind, ConfigUpdate, DeliveryContext, FirmwareKind, FirmwareLog, FotaManifest, QueueKind,
    RegisterWriteKind, TransitionFeed, UplinkId, WriteCommand, lenient_json,
};
use crate::security::{
    BodyCipher, CipherError, FixedNonceGuard, MacAuthenticator, ReplayGuard, ReplayVerdict,
    verify_mac,
};
use crate::storage::{
    ArtifactStore, DirectoryArtifactStore, ReadingSink, RegisterGains, TelemetryBatch,
};
use crate::{Result, UplinkError};

pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const ENCRYPTION_HEADER: &str = "Encryption";
pub const NONCE_HEADER: &str = "Nonce";
pub const MAC_HEADER: &str = "Mac";
pub const CONFIG_ACK_HEADER: &str = "Config-Ack";

/// One device upload: raw body plus the request headers the relay reads.
#[derive(Debug, Clone, Default)]
pub struct UplinkRequest {
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl UplinkRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into(), headers: Vec::new() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Where the decoded readings ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOutcome {
    Stored,
    /// Decoded but not persisted; the uplink still succeeds
    ProcessingOnly,
}

/// Success body of an uplink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UplinkResponse {
    pub status: &'static str,
    pub uplink_id: UplinkId,
    pub values_processed: usize,
    /// Flattened row-major raw samples
    pub values: Vec<u16>,
    pub storage: StorageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_info: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<WriteCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_update: Option<ConfigUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fota: Option<FotaManifest>,
}

/// Failure body of an uplink or acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    /// HTTP status and body for `err`.
    pub fn from_error(err: &UplinkError) -> (u16, Self) {
        (err.status_code(), Self { error: err.to_string() })
    }
}

/// Acknowledgment applied through [`UplinkService::acknowledge_json`].
#[derive(Debug, Clone, PartialEq)]
pub struct AckReceipt {
    pub kind: CommandKind,
    pub outcome: AckOutcome,
}

/// Composes frame decoding, storage and command delivery.
pub struct UplinkService {
    codec: Box<dyn FrameCodec>,
    replay: Arc<dyn ReplayGuard>,
    mac: MacAuthenticator,
    cipher: BodyCipher,
    require_encryption: bool,
    api_key: Option<String>,
    sink: Arc<dyn ReadingSink>,
    gains: RegisterGains,
    feed: TransitionFeed,
    configs: CommandQueue<ConfigKind>,
    writes: CommandQueue<RegisterWriteKind>,
    firmware: CommandQueue<FirmwareKind>,
    store: Arc<dyn CommandStore>,
    fallback_uplink: AtomicU64,
}

impl UplinkService {
    /// Service with the fixed-nonce policy, the device key and default gains.
    pub fn new(
        generation: ProtocolGeneration,
        sink: Arc<dyn ReadingSink>,
        store: Arc<dyn CommandStore>,
    ) -> Self {
        let feed = TransitionFeed::default();
        Self {
            codec: generation.codec(),
            replay: Arc::new(FixedNonceGuard::default()),
            mac: MacAuthenticator::from_psk(),
            cipher: BodyCipher::from_psk(),
            require_encryption: false,
            api_key: None,
            sink,
            gains: RegisterGains::default(),
            configs: CommandQueue::new(Arc::clone(&store)).with_feed(feed.clone()),
            writes: CommandQueue::new(Arc::clone(&store)).with_feed(feed.clone()),
            firmware: CommandQueue::new(Arc::clone(&store)).with_feed(feed.clone()),
            store,
            feed,
            // Only used while the store is down; never recorded as `delivered_in`
            fallback_uplink: AtomicU64::new(Utc::now().timestamp_millis().max(1) as u64),
        }
    }

    /// Build a service from deployment configuration.
    pub async fn from_config(
        config: &IngestConfig,
        sink: Arc<dyn ReadingSink>,
        store: Arc<dyn CommandStore>,
    ) -> Result<Self> {
        config.validate()?;
        let mut service = Self::new(config.protocol, sink, store)
            .with_replay_guard(config.replay.build_guard().await?)
            .require_encryption(config.require_encryption)
            .with_gains(config.register_gains())
            .with_firmware_url(config.firmware_url.clone());

        if let Some(key) = &config.api_key {
            service = service.with_api_key(key.clone());
        }
        if let Some(timeout) = config.ack_timeout() {
            service = service.with_ack_timeout(timeout);
        }
        if let Some(dir) = &config.firmware_dir {
            service = service.with_artifacts(Arc::new(DirectoryArtifactStore::new(dir)));
        }

        info!(
            "Uplink service ready: protocol {}, replay policy {}, encryption {}",
            config.protocol,
            service.replay.policy(),
            if config.require_encryption { "required" } else { "optional" }
        );
        Ok(service)
    }

    pub fn with_replay_guard(mut self, replay: Arc<dyn ReplayGuard>) -> Self {
        self.replay = replay;
        self
    }

    pub fn with_mac(mut self, mac: MacAuthenticator) -> Self {
        self.mac = mac;
        self
    }

    pub fn with_cipher(mut self, cipher: BodyCipher) -> Self {
        self.cipher = cipher;
        self
    }

    /// Reject uplinks without the `Encryption` header.
    pub fn require_encryption(mut self, required: bool) -> Self {
        self.require_encryption = required;
        self
    }

    /// Require `Authorization: <key>` on every uplink.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_gains(mut self, gains: RegisterGains) -> Self {
        self.gains = gains;
        self
    }

    pub fn with_firmware_url(mut self, url: impl Into<String>) -> Self {
        self.firmware = self.firmware.with_context(DeliveryContext { firmware_url: url.into() });
        self
    }

    /// Fail firmware jobs whose image is missing from `artifacts`.
    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.firmware = self.firmware.with_gate(Arc::new(ArtifactGate::new(artifacts)));
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.configs = self.configs.with_ack_timeout(timeout);
        self.writes = self.writes.with_ack_timeout(timeout);
        self.firmware = self.firmware.with_ack_timeout(timeout);
        self
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.codec.generation()
    }

    pub fn configs(&self) -> &CommandQueue<ConfigKind> {
        &self.configs
    }

    pub fn writes(&self) -> &CommandQueue<RegisterWriteKind> {
        &self.writes
    }

    pub fn firmware(&self) -> &CommandQueue<FirmwareKind> {
        &self.firmware
    }

    /// Transitions of all three queues.
    pub fn transitions(&self) -> &TransitionFeed {
        &self.feed
    }

    /// Process one uplink.
    pub async fn handle(&self, request: &UplinkRequest) -> Result<UplinkResponse> {
        self.check_api_key(request)?;
        check_content_type(request)?;

        let frame = match self.open_envelope(request).await {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Rejected uplink envelope: {}", err);
                return Err(err);
            }
        };
        let decoded = match self.codec.decode(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("Rejected {} byte {} frame: {}", frame.len(), self.codec.generation(), err);
                return Err(err);
            }
        };

        let (uplink_id, deliverable) = match self.store.allocate_uplink_id().await {
            Ok(id) => (id, true),
            Err(err) => {
                error!("Cannot allocate uplink id, commands withheld: {}", err);
                (UplinkId(self.fallback_uplink.fetch_add(1, Ordering::Relaxed)), false)
            }
        };
        info!(
            "Uplink {}: {} samples x {} registers",
            uplink_id,
            decoded.samples.sample_count(),
            decoded.samples.register_count()
        );

        if let Some(raw) = request.header(CONFIG_ACK_HEADER) {
            self.apply_inline_ack(raw).await;
        }

        let (storage, storage_info) = self.store_readings(uplink_id, &decoded).await;

        let (config_update, command, fota) = if deliverable {
            (
                self.deliver(&self.configs, uplink_id).await,
                self.deliver(&self.writes, uplink_id).await,
                self.deliver(&self.firmware, uplink_id).await,
            )
        } else {
            (None, None, None)
        };

        let values = decoded.samples.into_vec();
        Ok(UplinkResponse {
            status: "success",
            uplink_id,
            values_processed: values.len(),
            values,
            storage,
            storage_info: Some(storage_info),
            timestamp: Utc::now(),
            command,
            config_update,
            fota,
        })
    }

    /// Apply an acknowledgment body sent outside an uplink.
    ///
    /// The kind is chosen by the body's shape: `config_ack`, `command_result`
    /// or a firmware log with `final_status`.
    pub async fn acknowledge_json(&self, raw: &str) -> Result<AckReceipt> {
        let value: serde_json::Value = lenient_json(raw)?;
        let (kind, outcome) = if value.get("config_ack").is_some() {
            (CommandKind::Config, self.configs.acknowledge(ConfigAck::from_json(raw)?).await?)
        } else if value.get("command_result").is_some() {
            (CommandKind::RegisterWrite, self.writes.acknowledge(CommandResult::from_json(raw)?).await?)
        } else if value.get("final_status").is_some() {
            (CommandKind::Firmware, self.firmware.acknowledge(FirmwareLog::from_json(raw)?).await?)
        } else {
            return Err(UplinkError::invalid_command(
                "acknowledgment needs config_ack, command_result or final_status",
            ));
        };
        Ok(AckReceipt { kind, outcome })
    }

    fn check_api_key(&self, request: &UplinkRequest) -> Result<()> {
        let Some(expected) = &self.api_key else {
            return Ok(());
        };
        match request.header(AUTHORIZATION_HEADER) {
            Some(received) if verify_mac(received.trim(), expected) => Ok(()),
            Some(_) => Err(UplinkError::authentication("invalid API key")),
            None => Err(UplinkError::authentication("missing Authorization header")),
        }
    }

    /// Plaintext frame of the request.
    async fn open_envelope<'a>(&self, request: &'a UplinkRequest) -> Result<Cow<'a, [u8]>> {
        let scheme = request.header(ENCRYPTION_HEADER).map(str::trim).filter(|s| !s.is_empty());
        let Some(scheme) = scheme else {
            if self.require_encryption {
                return Err(UplinkError::authentication("plaintext uplinks are not accepted"));
            }
            return Ok(Cow::Borrowed(request.body()));
        };
        if !scheme.eq_ignore_ascii_case(ENCRYPTION_SCHEME) {
            return Err(CipherError::UnsupportedScheme { scheme: scheme.to_string() }.into());
        }

        let nonce_raw = request
            .header(NONCE_HEADER)
            .ok_or_else(|| UplinkError::authentication("missing Nonce header"))?;
        let nonce: u64 = nonce_raw
            .trim()
            .parse()
            .map_err(|_| UplinkError::authentication(format!("invalid nonce '{}'", nonce_raw)))?;
        if let ReplayVerdict::Rejected { reason } = self.replay.peek(nonce).await? {
            return Err(UplinkError::authentication(reason));
        }

        let mac = request
            .header(MAC_HEADER)
            .ok_or_else(|| UplinkError::authentication("missing Mac header"))?;
        self.mac.authenticate(request.body(), mac.trim())?;

        // Consume the nonce only for authenticated bodies; a concurrent
        // uplink may have taken it since the peek
        if let ReplayVerdict::Rejected { reason } = self.replay.check(nonce).await? {
            return Err(UplinkError::authentication(reason));
        }

        let plaintext = self.cipher.decrypt(request.body())?;
        debug!(
            "Decrypted {} byte body into {} byte frame (nonce {})",
            request.body().len(),
            plaintext.len(),
            nonce
        );
        Ok(Cow::Owned(plaintext))
    }

    async fn apply_inline_ack(&self, raw: &str) {
        let ack = match ConfigAck::from_json(raw) {
            Ok(ack) => ack,
            Err(err) => {
                warn!("Ignoring malformed {} header: {}", CONFIG_ACK_HEADER, err);
                return;
            }
        };
        match self.configs.acknowledge(ack).await {
            Ok(AckOutcome::Applied(record)) => {
                debug!("Inline acknowledgment resolved config #{} as {}", record.id, record.status)
            }
            Ok(AckOutcome::Orphaned) => {}
            Err(err) => warn!("Inline acknowledgment not applied: {}", err),
        }
    }

    async fn store_readings(&self, uplink_id: UplinkId, decoded: &DecodedFrame) -> (StorageOutcome, String) {
        let batch = TelemetryBatch::new(uplink_id, decoded.header.shape, &decoded.samples, &self.gains);
        match self.sink.store(&batch).await {
            Ok(()) => (StorageOutcome::Stored, "Data stored in database".to_string()),
            Err(err) => {
                warn!("Uplink {} decoded but not stored: {}", uplink_id, err);
                (StorageOutcome::ProcessingOnly, format!("Processing successful, storage skipped: {}", err))
            }
        }
    }

    async fn deliver<K: QueueKind>(&self, queue: &CommandQueue<K>, uplink_id: UplinkId) -> Option<K::Delivery> {
        match queue.claim(uplink_id).await {
            Ok(delivery) => delivery.map(|delivery| delivery.payload),
            Err(err) => {
                error!("Could not poll {} queue for uplink {}: {}", queue.kind(), uplink_id, err);
                None
            }
        }
    }
}

impl std::fmt::Debug for UplinkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UplinkService")
            .field("generation", &self.codec.generation())
            .field("replay", &self.replay)
            .field("require_encryption", &self.require_encryption)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

fn check_content_type(request: &UplinkRequest) -> Result<()> {
    let Some(content_type) = request.header(CONTENT_TYPE_HEADER) else {
        return Ok(());
    };
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if media_type.eq_ignore_ascii_case(UPLINK_CONTENT_TYPE) {
        Ok(())
    } else {
        Err(UplinkError::UnsupportedContentType { content_type: content_type.to_string() })
    }
}

#[cfg(test)]
mod tests;
