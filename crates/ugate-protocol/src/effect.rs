//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote node radio protocol model and positional decoders."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::CommandCode;
use crate::frame::{FrameStatus, NodeAddress, TxStatus};
use crate::readings::{GateState, SensorSnapshot};
use crate::settings::{AccessKeys, RemoteSettings};

/// Audible cue a presentation collaborator may play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundKind {
    /// Outbound frame acknowledged.
    Blip,
    /// Transmission or link failure.
    Error,
    /// Unused frame received.
    Confirm,
    /// A new image transfer started.
    Camera,
    /// A remote node was tripped and its image is ready.
    DoorBell,
    /// Image materialization finished.
    Complete,
}

/// Typed notification payloads consumed by presentation and persistence collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Delivery status of an outbound frame.
    TxStatus {
        /// Reported status.
        status: TxStatus,
    },
    /// The modem driver reported a link error.
    TransportError {
        /// Node associated with the failing exchange, when known.
        source: Option<NodeAddress>,
        /// Driver description.
        message: String,
        /// Raw bytes as comma-delimited hex.
        raw: String,
    },
    /// A node reported new keypad access keys.
    KeysUpdated {
        /// Reporting node.
        source: NodeAddress,
        /// Decoded keys.
        keys: AccessKeys,
    },
    /// A node reported its current sensor readings.
    ReadingsAvailable {
        /// Reporting node.
        source: NodeAddress,
        /// Failure status carried by the frame.
        status: FrameStatus,
        /// Decoded readings.
        readings: SensorSnapshot,
        /// Gate position, when the node reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gate: Option<GateState>,
    },
    /// A node finished calibrating its laser against the servo positions.
    LaserCalibrated {
        /// Reporting node.
        source: NodeAddress,
        /// `GeneralFailure` when calibration failed.
        status: FrameStatus,
    },
    /// A node reported its settings.
    SettingsAvailable {
        /// Reporting node.
        source: NodeAddress,
        /// Decoded settings.
        settings: RemoteSettings,
    },
    /// An image capture failed after exhausting its retries.
    ImageLost {
        /// Node that was capturing.
        source: NodeAddress,
        /// Command that started the capture.
        command: CommandCode,
        /// Retries spent before giving up.
        attempts: u32,
    },
    /// A stalled transfer was abandoned.
    TransferTimedOut {
        /// Node whose transfer stalled.
        source: NodeAddress,
        /// Age of the abandoned transfer.
        elapsed_ms: u64,
        /// Chunks discarded with it.
        discarded_chunks: usize,
    },
    /// A frame was dropped because it could not be decoded.
    MalformedFrame {
        /// Reporting node.
        source: NodeAddress,
        /// Command byte of the frame.
        command: u8,
        /// Decoder error.
        detail: String,
        /// Raw payload as comma-delimited hex.
        raw: String,
    },
}

impl Notification {
    /// Static label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::TxStatus { .. } => "tx_status",
            Notification::TransportError { .. } => "transport_error",
            Notification::KeysUpdated { .. } => "keys_updated",
            Notification::ReadingsAvailable { .. } => "readings_available",
            Notification::LaserCalibrated { .. } => "laser_calibrated",
            Notification::SettingsAvailable { .. } => "settings_available",
            Notification::ImageLost { .. } => "image_lost",
            Notification::TransferTimedOut { .. } => "transfer_timed_out",
            Notification::MalformedFrame { .. } => "malformed_frame",
        }
    }
}

/// Description of a reassembled image handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Node that captured the image.
    pub source: NodeAddress,
    /// Command that started the capture.
    pub command: CommandCode,
    /// Total number of image bytes.
    pub byte_count: usize,
    /// Readings carried by the first chunk.
    pub readings: SensorSnapshot,
    /// Wall-clock creation time of the transfer.
    pub created_at: DateTime<Utc>,
    /// Time between the first and last chunk.
    pub elapsed_ms: u64,
    /// Suggested file name, derived from the creation time.
    pub file_name: String,
}

impl ImageMetadata {
    /// File name for an image created at `created_at`, with colons replaced by dashes.
    pub fn file_name_for(created_at: DateTime<Utc>) -> String {
        format!("{}.jpg", created_at.format("%Y-%m-%dT%H-%M-%S%.3f"))
    }
}

/// Side-effecting instruction emitted by the core for a collaborator to carry out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", content = "data", rename_all = "snake_case")]
pub enum Effect {
    /// Play an audible cue.
    PlaySound(SoundKind),
    /// Publish a notification.
    Notify(Notification),
    /// Persist a reassembled image.
    PersistImage {
        /// Complete image bytes in arrival order.
        bytes: Vec<u8>,
        /// Image description.
        metadata: ImageMetadata,
    },
    /// Send a command frame to a node.
    Retransmit {
        /// Destination node.
        address: NodeAddress,
        /// Frame bytes, command code first.
        command_bytes: Vec<u8>,
    },
    /// Surface a warning with no further action.
    Warn(String),
}

impl Effect {
    /// Static label used for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Effect::PlaySound(_) => "play_sound",
            Effect::Notify(_) => "notify",
            Effect::PersistImage { .. } => "persist_image",
            Effect::Retransmit { .. } => "retransmit",
            Effect::Warn(_) => "warn",
        }
    }
}

/// Envelope stamping an effect for tracing across collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectEnvelope {
    /// Unique identifier for deduplication and tracing.
    pub id: Uuid,
    /// Time the effect was emitted.
    pub timestamp: DateTime<Utc>,
    /// The effect itself.
    pub effect: Effect,
}

impl EffectEnvelope {
    /// Stamp an effect with a fresh id and the current time.
    pub fn new(effect: Effect) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            effect,
        }
    }
}
