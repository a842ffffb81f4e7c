//! Test fixtures: the device side of the protocol
//!
//! Production code only decodes. The helpers here encode register columns
//! into token streams, wrap them into frames of any generation and seal
//! frames the way the firmware does, so tests and benches can start from
//! known samples.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use aes::Aes256;
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;

use crate::codec::ProtocolGeneration;
use crate::protocol::{ENCRYPTION_SCHEME, FIXED_NONCE, TOKEN_DELTA, TOKEN_RLE, UPLOAD_PSK};
use crate::queue::{
    CommandId, CommandKind, CommandRecord, CommandStatus, CommandStore, MemoryCommandStore,
    StatusUpdate, UplinkId,
};
use crate::security::{derive_key, generate_mac};
use crate::storage::{ReadingSink, TelemetryBatch};
use crate::types::Endianness;
use crate::uplink::{
    CONTENT_TYPE_HEADER, ENCRYPTION_HEADER, MAC_HEADER, NONCE_HEADER, UplinkRequest,
};
use crate::{Result, UplinkError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Encode one register column as `initial` followed by RLE and DELTA tokens.
///
/// Repeats of the current value become runs of at most 255; every change
/// becomes a wrapping delta.
pub fn encode_register(column: &[u16], order: Endianness) -> Vec<u8> {
    let Some((&first, rest)) = column.split_first() else {
        return Vec::new();
    };

    let mut out = order.encode_u16(first).to_vec();
    let mut current = first;
    let mut index = 0;
    while index < rest.len() {
        if rest[index] == current {
            let run = rest[index..].iter().take(255).take_while(|&&value| value == current).count();
            out.extend_from_slice(&[TOKEN_RLE, run as u8]);
            index += run;
        } else {
            let delta = rest[index].wrapping_sub(current) as i16;
            out.push(TOKEN_DELTA);
            out.extend_from_slice(&order.encode_i16(delta));
            current = rest[index];
            index += 1;
        }
    }
    out
}

/// Builds complete frames from register columns.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    generation: ProtocolGeneration,
    columns: Vec<Vec<u16>>,
    metadata_flag: u8,
    corrupt_crc: bool,
}

impl FrameBuilder {
    pub fn new(generation: ProtocolGeneration) -> Self {
        Self { generation, columns: Vec::new(), metadata_flag: 0, corrupt_crc: false }
    }

    /// One column per register, all of equal length.
    pub fn columns(mut self, columns: Vec<Vec<u16>>) -> Self {
        self.columns = columns;
        self
    }

    /// Leading shape byte of dynamic frames; ignored for fixed frames.
    pub fn metadata_flag(mut self, flag: u8) -> Self {
        self.metadata_flag = flag;
        self
    }

    /// Flip one bit of the trailing CRC.
    pub fn corrupt_crc(mut self) -> Self {
        self.corrupt_crc = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let order = self.generation.endianness();
        let payload: Vec<u8> =
            self.columns.iter().flat_map(|column| encode_register(column, order)).collect();
        let sample_count = self.columns.first().map_or(0, Vec::len) as u16;
        let register_count = self.columns.len() as u8;
        let size = payload.len() as u16;

        let mut frame = match self.generation {
            ProtocolGeneration::Fixed => {
                let mut frame = vec![0x00, sample_count as u8, register_count];
                frame.extend_from_slice(&size.to_le_bytes());
                frame
            }
            ProtocolGeneration::Dynamic | ProtocolGeneration::DynamicCcitt => {
                let mut frame = vec![self.metadata_flag];
                frame.extend_from_slice(&sample_count.to_be_bytes());
                frame.push(register_count);
                frame.extend_from_slice(&size.to_be_bytes());
                frame
            }
        };
        frame.extend_from_slice(&payload);
        self.generation.crc_variant().append(&mut frame);

        if self.corrupt_crc {
            let last = frame.len() - 1;
            frame[last] ^= 0x01;
        }
        frame
    }
}

/// `iv ‖ AES-256-CBC(PKCS#7(plaintext))` under the device key.
pub fn encrypt_body(plaintext: &[u8], iv: [u8; 16]) -> Vec<u8> {
    let key = derive_key(UPLOAD_PSK);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    [iv.as_slice(), ciphertext.as_slice()].concat()
}

/// Like [`encrypt_body`] but without padding; `data` must be block aligned.
pub fn encrypt_blocks(data: &[u8], iv: [u8; 16]) -> Vec<u8> {
    let key = derive_key(UPLOAD_PSK);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<NoPadding>(data);
    [iv.as_slice(), ciphertext.as_slice()].concat()
}

/// Plaintext uplink carrying `frame`.
pub fn plain_request(frame: &[u8]) -> UplinkRequest {
    UplinkRequest::new(frame.to_vec()).with_header(CONTENT_TYPE_HEADER, "application/octet-stream")
}

/// Encrypted and signed uplink as current firmware sends it.
pub fn sealed_request(frame: &[u8]) -> UplinkRequest {
    sealed_request_with_nonce(frame, FIXED_NONCE)
}

pub fn sealed_request_with_nonce(frame: &[u8], nonce: u64) -> UplinkRequest {
    let body = encrypt_body(frame, [0x5A; 16]);
    let mac = generate_mac(UPLOAD_PSK.as_bytes(), &body).expect("HMAC accepts any key");
    UplinkRequest::new(body)
        .with_header(CONTENT_TYPE_HEADER, "application/octet-stream")
        .with_header(ENCRYPTION_HEADER, ENCRYPTION_SCHEME)
        .with_header(NONCE_HEADER, nonce.to_string())
        .with_header(MAC_HEADER, mac)
}

/// Unique, not yet existing path under the system temp directory.
pub fn scratch_path(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("uplink-relay-{}-{}-{}", std::process::id(), n, name))
}

/// Command store whose transitions can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyCommandStore {
    inner: MemoryCommandStore,
    failing: AtomicBool,
}

impl FlakyCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transitions(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandStore for FlakyCommandStore {
    async fn insert(&self, kind: CommandKind, payload: serde_json::Value) -> Result<CommandRecord> {
        self.inner.insert(kind, payload).await
    }

    async fn get(&self, kind: CommandKind, id: CommandId) -> Result<Option<CommandRecord>> {
        self.inner.get(kind, id).await
    }

    async fn list_by_status(
        &self,
        kind: CommandKind,
        status: CommandStatus,
    ) -> Result<Vec<CommandRecord>> {
        self.inner.list_by_status(kind, status).await
    }

    async fn transition(
        &self,
        kind: CommandKind,
        id: CommandId,
        from: CommandStatus,
        update: StatusUpdate,
    ) -> Result<Option<CommandRecord>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UplinkError::persistence(format!("update {} #{}", kind.table(), id)));
        }
        self.inner.transition(kind, id, from, update).await
    }

    async fn recent(&self, kind: CommandKind, limit: usize) -> Result<Vec<CommandRecord>> {
        self.inner.recent(kind, limit).await
    }

    async fn count_by_status(&self, kind: CommandKind) -> Result<BTreeMap<CommandStatus, usize>> {
        self.inner.count_by_status(kind).await
    }

    async fn allocate_uplink_id(&self) -> Result<UplinkId> {
        self.inner.allocate_uplink_id().await
    }
}

/// Sink standing in for an unreachable database.
#[derive(Debug, Default)]
pub struct FailingSink;

#[async_trait]
impl ReadingSink for FailingSink {
    async fn store(&self, _batch: &TelemetryBatch) -> Result<()> {
        Err(UplinkError::persistence("insert eco_data: connection refused"))
    }
}
