//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary frame dispatch and gateway lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Gateway core: classifies inbound radio frames, reassembles chunked image
//! transfers per node, and drives the runtime loop that hands effects to
//! collaborators and commands to the radio link.

pub mod dispatcher;
pub mod link;
pub mod reassembly;
pub mod replay;
pub mod runtime;

use ugate_protocol::ProtocolError;

/// Shared result type for the gateway core.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Protocol decoding or effect delivery failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The outbound radio link is no longer accepting frames.
    #[error("radio link closed: {0}")]
    LinkClosed(&'static str),
    /// A command targeted an address that is not a configured node.
    #[error("unknown node {0}")]
    UnknownNode(String),
    /// IO failure while reading a frame source.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A replay record could not be parsed.
    #[error("invalid replay record on line {line}: {source}")]
    Replay {
        /// One-based line number.
        line: usize,
        /// Parser error.
        source: serde_json::Error,
    },
}

pub use dispatcher::PacketDispatcher;
pub use link::{LoopbackLink, RadioLink, SentFrame};
pub use reassembly::{
    ChunkOutcome, ChunkReport, ImageCapture, ImageReassembler, ReassemblyPolicy, StaleTransfer,
    TransferState,
};
pub use replay::{replay_from_file, replay_from_reader, ReplayRecord};
pub use runtime::{GatewayHandle, GatewayRuntime};
