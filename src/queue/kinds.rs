//! The three command kinds: configuration updates, register writes and
//! firmware jobs.
//!
//! Each kind fixes its enqueue request, the projection the device receives,
//! the acknowledgment it sends back, and how that acknowledgment maps to a
//! terminal status.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use super::types::{CommandId, CommandKind, CommandRecord, CommandStatus, UplinkId};
use super::{Admission, AckTarget, DeliveryContext, DeliveryGate, QueueKind, Verdict};
use crate::protocol::{
    CONFIGURABLE_REGISTERS, MAX_INTERVAL_SECS, MAX_WRITE_VALUE, MIN_INTERVAL_SECS,
    WRITE_TARGET_REGISTER,
};
use crate::storage::ArtifactStore;
use crate::{Result, UplinkError};

const SUCCESS_WORDS: [&str; 3] = ["success", "completed", "ok"];
const FAILURE_WORDS: [&str; 3] = ["failed", "error", "timeout"];

/// Device configuration change. Absent fields are left unchanged on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registers: Option<Vec<String>>,
}

/// Parameter-level verdict of the device on a configuration update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAck {
    #[serde(default)]
    pub accepted: Vec<String>,
    #[serde(default)]
    pub rejected: Vec<String>,
    #[serde(default)]
    pub unchanged: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_id: Option<UplinkId>,
}

impl ConfigAck {
    /// Parse `{"config_ack": {...}}` or a bare acknowledgment object.
    pub fn from_json(raw: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            config_ack: ConfigAck,
        }

        let value: serde_json::Value = lenient_json(raw)?;
        if value.get("config_ack").is_some() {
            let envelope: Envelope =
                serde_json::from_value(value).map_err(|err| UplinkError::json("config_ack", err))?;
            return Ok(envelope.config_ack);
        }
        serde_json::from_value(value).map_err(|err| UplinkError::json("config_ack", err))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigKind;

impl QueueKind for ConfigKind {
    const KIND: CommandKind = CommandKind::Config;
    type Request = ConfigUpdate;
    type Delivery = ConfigUpdate;
    type Ack = ConfigAck;

    fn validate(request: &ConfigUpdate) -> Result<()> {
        let mut errors = Vec::new();
        let intervals =
            [("sampling_interval", request.sampling_interval), ("upload_interval", request.upload_interval)];
        for (name, value) in intervals {
            if value.is_some_and(|secs| !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs)) {
                errors.push(format!(
                    "{} must be between {} and {} seconds",
                    name, MIN_INTERVAL_SECS, MAX_INTERVAL_SECS
                ));
            }
        }
        if let Some(registers) = &request.registers {
            let invalid: Vec<&str> = registers
                .iter()
                .map(String::as_str)
                .filter(|register| !CONFIGURABLE_REGISTERS.contains(register))
                .collect();
            if !invalid.is_empty() {
                errors.push(format!("Invalid registers: {}", invalid.join(", ")));
            }
        }
        if request == &ConfigUpdate::default() {
            errors.push(
                "At least one of sampling_interval, upload_interval or registers must be provided"
                    .to_string(),
            );
        }

        if errors.is_empty() { Ok(()) } else { Err(UplinkError::invalid_command(errors.join("; "))) }
    }

    fn project(_record: &CommandRecord, request: ConfigUpdate, _ctx: &DeliveryContext) -> ConfigUpdate {
        request
    }

    fn target(ack: &ConfigAck) -> Option<AckTarget> {
        ack.uplink_id.map(AckTarget::Uplink)
    }

    fn verdict(ack: &ConfigAck) -> Verdict {
        let processed = !ack.accepted.is_empty() || !ack.unchanged.is_empty();
        match (ack.rejected.is_empty(), processed) {
            (true, true) => Verdict::new(CommandStatus::Success),
            (false, true) => Verdict::failed_with(
                CommandStatus::PartiallyApplied,
                format!("Device rejected: {}", ack.rejected.join(", ")),
            ),
            (false, false) => Verdict::failed_with(
                CommandStatus::Failed,
                format!("Device rejected: {}", ack.rejected.join(", ")),
            ),
            (true, false) => {
                Verdict::failed_with(CommandStatus::Failed, "No parameters were processed")
            }
        }
    }
}

/// Export power percentage to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub value: u16,
}

/// `command` field of the uplink response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCommand {
    pub action: String,
    pub register: String,
    pub value: u16,
}

/// Execution report of a register write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_id: Option<UplinkId>,
}

impl CommandResult {
    /// Parse `{"command_result": {...}}` as sent by the device.
    ///
    /// Device bodies sometimes carry NUL bytes or trailing garbage; both are
    /// tolerated.
    pub fn from_json(raw: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            command_result: CommandResult,
        }

        let envelope: Envelope = lenient_json(raw)?;
        Ok(envelope.command_result)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterWriteKind;

impl QueueKind for RegisterWriteKind {
    const KIND: CommandKind = CommandKind::RegisterWrite;
    type Request = RegisterWrite;
    type Delivery = WriteCommand;
    type Ack = CommandResult;

    fn validate(request: &RegisterWrite) -> Result<()> {
        if request.value > MAX_WRITE_VALUE {
            return Err(UplinkError::invalid_command(format!(
                "Value must be between 0 and {}",
                MAX_WRITE_VALUE
            )));
        }
        Ok(())
    }

    fn project(_record: &CommandRecord, request: RegisterWrite, _ctx: &DeliveryContext) -> WriteCommand {
        WriteCommand {
            action: "write_register".to_string(),
            register: WRITE_TARGET_REGISTER.to_string(),
            value: request.value,
        }
    }

    fn target(ack: &CommandResult) -> Option<AckTarget> {
        ack.uplink_id.map(AckTarget::Uplink)
    }

    fn verdict(ack: &CommandResult) -> Verdict {
        let status = ack.status.to_lowercase();
        if SUCCESS_WORDS.contains(&status.as_str()) {
            return Verdict::new(CommandStatus::Success);
        }
        let reason = match &ack.error_message {
            Some(message) => message.clone(),
            None if FAILURE_WORDS.contains(&status.as_str()) => {
                format!("Command execution failed: {}", ack.status)
            }
            None => format!("Unknown status: {}", ack.status),
        };
        Verdict::failed_with(CommandStatus::Failed, reason)
    }
}

/// Firmware image to deploy, identified by its SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareJob {
    pub firmware_sha256: String,
    pub firmware_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// `fota` field of the uplink response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FotaManifest {
    pub job_id: String,
    #[serde(rename = "fwUrl")]
    pub fw_url: String,
    #[serde(rename = "fwSize")]
    pub fw_size: u64,
    #[serde(rename = "shaExpected")]
    pub sha_expected: String,
}

/// Deployment log reported after a firmware job ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareLog {
    #[serde(rename = "jobId", default, deserialize_with = "job_id_repr", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<CommandId>,
    pub final_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

impl FirmwareLog {
    pub fn from_json(raw: &str) -> Result<Self> {
        lenient_json(raw)
    }
}

/// Job ids travel as strings in the manifest and come back as either form.
fn job_id_repr<'de, D>(deserializer: D) -> std::result::Result<Option<CommandId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(CommandId),
        Text(String),
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Repr::Number(id)) => Ok(Some(id)),
        Some(Repr::Text(text)) => text.trim().parse().map(Some).map_err(de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FirmwareKind;

impl QueueKind for FirmwareKind {
    const KIND: CommandKind = CommandKind::Firmware;
    type Request = FirmwareJob;
    type Delivery = FotaManifest;
    type Ack = FirmwareLog;

    fn validate(request: &FirmwareJob) -> Result<()> {
        let sha = &request.firmware_sha256;
        let is_hex = sha.len() == 64 && sha.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !is_hex {
            return Err(UplinkError::invalid_command("firmware_sha256 must be 64 lowercase hex digits"));
        }
        if request.firmware_size == 0 {
            return Err(UplinkError::invalid_command("firmware_size must be non-zero"));
        }
        Ok(())
    }

    fn project(record: &CommandRecord, request: FirmwareJob, ctx: &DeliveryContext) -> FotaManifest {
        FotaManifest {
            job_id: record.id.to_string(),
            fw_url: ctx.firmware_url.clone(),
            fw_size: request.firmware_size,
            sha_expected: request.firmware_sha256,
        }
    }

    fn target(ack: &FirmwareLog) -> Option<AckTarget> {
        ack.job_id.map(AckTarget::Item)
    }

    fn verdict(ack: &FirmwareLog) -> Verdict {
        if SUCCESS_WORDS.contains(&ack.final_status.to_lowercase().as_str()) {
            Verdict::new(CommandStatus::Completed)
        } else {
            Verdict::failed_with(CommandStatus::Failed, format!("Firmware update {}", ack.final_status))
        }
    }
}

/// Refuses firmware jobs whose image is not in the artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactGate {
    artifacts: Arc<dyn ArtifactStore>,
}

impl ArtifactGate {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl DeliveryGate for ArtifactGate {
    async fn admit(&self, record: &CommandRecord) -> Result<Admission> {
        let job: FirmwareJob = serde_json::from_value(record.payload.clone())
            .map_err(|err| UplinkError::json("fota_updates payload", err))?;
        match self.artifacts.locate(&job.firmware_sha256).await? {
            Some(artifact) if artifact.size == job.firmware_size => Ok(Admission::Admit),
            Some(artifact) => {
                warn!(
                    "Firmware job #{} expects {} bytes, stored artifact has {}",
                    record.id, job.firmware_size, artifact.size
                );
                Ok(Admission::Reject("firmware artifact size mismatch".to_string()))
            }
            None => Ok(Admission::Reject("firmware artifact missing".to_string())),
        }
    }
}

/// Parse device JSON, dropping control characters and anything outside the
/// outermost braces when the body does not parse as-is.
pub fn lenient_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    match serde_json::from_str(cleaned) {
        Ok(value) => Ok(value),
        Err(err) => {
            let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) else {
                return Err(UplinkError::json("device acknowledgment", err));
            };
            if end <= start {
                return Err(UplinkError::json("device acknowledgment", err));
            }
            serde_json::from_str(&cleaned[start..=end])
                .map_err(|err| UplinkError::json("device acknowledgment", err))
        }
    }
}
