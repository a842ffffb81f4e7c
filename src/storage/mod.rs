//! Persistence of decoded readings and firmware artifacts.
//!
//! Decoded samples are stored best-effort: a [`ReadingSink`] failure never
//! fails the uplink, it only changes the `storage` field of the response.
//! Raw register values are scaled to engineering units by [`RegisterGains`]
//! before they reach the sink.

mod artifacts;

pub use artifacts::{
    ArtifactStore, DirectoryArtifactStore, FIRMWARE_FILE_NAME, FirmwareArtifact,
    MemoryArtifactStore,
};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::Result;
use crate::protocol::{DEFAULT_GAINS, REGISTER_NAMES};
use crate::queue::UplinkId;
use crate::types::{PayloadShape, SampleMatrix};

/// Name and divisor of each register position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterGains {
    registers: Vec<RegisterGain>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterGain {
    pub name: String,
    pub divisor: f64,
}

impl RegisterGains {
    pub fn new(registers: Vec<RegisterGain>) -> Self {
        Self { registers }
    }

    pub fn registers(&self) -> &[RegisterGain] {
        &self.registers
    }

    /// Name of register `index`; positions beyond the table are `reg<N>`.
    pub fn name(&self, index: usize) -> String {
        self.registers
            .get(index)
            .map(|register| register.name.clone())
            .unwrap_or_else(|| format!("reg{}", index))
    }

    /// Divisor of register `index`; positions beyond the table use 1.
    pub fn divisor(&self, index: usize) -> f64 {
        self.registers.get(index).map(|register| register.divisor).unwrap_or(1.0)
    }

    pub fn scale(&self, index: usize, raw: u16) -> f64 {
        raw as f64 / self.divisor(index)
    }

    /// One `name → value` row per sample.
    pub fn scale_rows(&self, samples: &SampleMatrix) -> Vec<BTreeMap<String, f64>> {
        samples
            .rows()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(index, raw)| (self.name(index), self.scale(index, *raw)))
                    .collect()
            })
            .collect()
    }
}

impl Default for RegisterGains {
    fn default() -> Self {
        Self::new(
            REGISTER_NAMES
                .iter()
                .zip(DEFAULT_GAINS)
                .map(|(name, divisor)| RegisterGain { name: name.to_string(), divisor })
                .collect(),
        )
    }
}

/// Readings of one uplink as handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryBatch {
    pub uplink_id: UplinkId,
    pub received_at: DateTime<Utc>,
    pub shape: PayloadShape,
    pub sample_count: usize,
    pub register_count: usize,
    /// Flattened row-major raw values
    pub raw: Vec<u16>,
    pub scaled: Vec<BTreeMap<String, f64>>,
}

impl TelemetryBatch {
    pub fn new(
        uplink_id: UplinkId,
        shape: PayloadShape,
        samples: &SampleMatrix,
        gains: &RegisterGains,
    ) -> Self {
        Self {
            uplink_id,
            received_at: Utc::now(),
            shape,
            sample_count: samples.sample_count(),
            register_count: samples.register_count(),
            raw: samples.as_slice().to_vec(),
            scaled: gains.scale_rows(samples),
        }
    }
}

/// Destination of decoded readings (the sensor table of a deployment).
#[async_trait]
pub trait ReadingSink: Send + Sync + std::fmt::Debug {
    async fn store(&self, batch: &TelemetryBatch) -> Result<()>;
}

/// Keeps every batch in memory.
#[derive(Debug, Default)]
pub struct MemoryReadingSink {
    batches: Mutex<Vec<TelemetryBatch>>,
}

impl MemoryReadingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn batches(&self) -> Vec<TelemetryBatch> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl ReadingSink for MemoryReadingSink {
    async fn store(&self, batch: &TelemetryBatch) -> Result<()> {
        self.batches.lock().await.push(batch.clone());
        Ok(())
    }
}
