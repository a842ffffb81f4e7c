//! Command records and their status lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row identifier of a command item, unique within its kind.
pub type CommandId = u64;

/// Identifier of one processed uplink.
///
/// Recorded on every item moved to `SENDING` so an acknowledgment can name
/// the exact delivery it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UplinkId(pub u64);

impl std::fmt::Display for UplinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device-bound command kinds, one queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Config,
    RegisterWrite,
    Firmware,
}

impl CommandKind {
    pub const ALL: [CommandKind; 3] =
        [CommandKind::Config, CommandKind::RegisterWrite, CommandKind::Firmware];

    /// Name of the backing table.
    pub fn table(self) -> &'static str {
        match self {
            CommandKind::Config => "configuration_logs",
            CommandKind::RegisterWrite => "write_commands",
            CommandKind::Firmware => "fota_updates",
        }
    }

    /// Field of the uplink response carrying a delivered item.
    pub fn response_field(self) -> &'static str {
        match self {
            CommandKind::Config => "config_update",
            CommandKind::RegisterWrite => "command",
            CommandKind::Firmware => "fota",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Lifecycle status: `PENDING → SENDING → terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Sending,
    Success,
    PartiallyApplied,
    Failed,
    Completed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandStatus::Pending | CommandStatus::Sending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Sending => "SENDING",
            CommandStatus::Success => "SUCCESS",
            CommandStatus::PartiallyApplied => "PARTIALLY_APPLIED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored command item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub kind: CommandKind,
    /// Kind-specific request as enqueued
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub error_message: Option<String>,
    /// Acknowledgment body as received from the device
    pub device_response: Option<serde_json::Value>,
    /// Uplink whose response carried this item
    pub delivered_in: Option<UplinkId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field changes applied together with a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub to: CommandStatus,
    pub error_message: Option<String>,
    pub device_response: Option<serde_json::Value>,
    pub delivered_in: Option<UplinkId>,
}

impl StatusUpdate {
    pub fn to(status: CommandStatus) -> Self {
        Self { to: status, error_message: None, device_response: None, delivered_in: None }
    }

    pub fn sending(uplink: UplinkId) -> Self {
        Self { delivered_in: Some(uplink), ..Self::to(CommandStatus::Sending) }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { error_message: Some(reason.into()), ..Self::to(CommandStatus::Failed) }
    }

    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.device_response = Some(response);
        self
    }
}
