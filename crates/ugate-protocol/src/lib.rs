//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote node radio protocol model and positional decoders."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Radio protocol primitives spoken between the gateway and its remote
//! sensor nodes: frame kinds, the command table, the positional decoders
//! for readings and settings, and the effects the core hands to its
//! collaborators.

pub mod command;
pub mod effect;
pub mod frame;
pub mod readings;
pub mod settings;
pub mod sink;

/// Shared result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Failure taxonomy of the radio and mail command protocol.
///
/// None of these are fatal; callers degrade each into a logged effect and
/// keep processing subsequent frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Payload too short for the positional fields its command requires.
    #[error("malformed frame for command {command}: need {required} bytes, got {actual}")]
    MalformedFrame {
        /// Command byte carried by the frame.
        command: u8,
        /// Minimum payload length required by the decoder.
        required: usize,
        /// Actual payload length received.
        actual: usize,
    },
    /// A field carried a value outside its enumerated domain.
    #[error("malformed frame for command {command}: {field} has unknown value {value}")]
    InvalidField {
        /// Command byte carried by the frame.
        command: u8,
        /// Name of the offending field.
        field: &'static str,
        /// Raw value received.
        value: u8,
    },
    /// An image transfer reached its end marker with the error flag set.
    #[error("image transfer from {0} arrived corrupted")]
    TransferError(String),
    /// An open image transfer went stale and was abandoned.
    #[error("image transfer from {0} timed out")]
    TransferTimeout(String),
    /// A text token parsed as an integer but names no known command.
    #[error("Invalid Command \"{0}\"")]
    InvalidCommand(i64),
    /// A radio frame carried a command byte outside the command table.
    #[error("unrecognized command {0}")]
    UnrecognizedCommand(u8),
    /// A command sender is not on the allow-list.
    #[error("sender is not authorized to issue commands")]
    Unauthorized,
    /// The effect sink's consumer has gone away.
    #[error("effect sink closed: {0}")]
    SinkClosed(&'static str),
    /// Wrapper for IO errors encountered while reading frame sources.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use command::CommandCode;
pub use effect::{Effect, EffectEnvelope, ImageMetadata, Notification, SoundKind};
pub use frame::{
    base16, DataFrame, ErrorFrame, FrameStatus, NodeAddress, RadioFrame, TxStatus,
    UnclassifiedFrame,
};
pub use readings::{GateState, SensorSnapshot};
pub use settings::{
    AccessKeys, AlarmStates, CameraResolution, DistanceThreshold, MultiAlarmTrip, PanTilt,
    RemoteSettings, SpeedThreshold, TripCameraAngles,
};
pub use sink::{ChannelEffectSink, EffectSink, InMemoryEffectSink};
pub use ugate_common::config::ProtocolLayout;
