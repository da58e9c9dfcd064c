//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote node radio protocol model and positional decoders."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, ProtocolLayout, Result};

/// Render raw bytes as comma-delimited hex pairs, e.g. `ff,d9`.
pub fn base16(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| hex::encode([*byte]))
        .collect::<Vec<_>>()
        .join(",")
}

/// 16-bit radio address of a remote node, rendered as four hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress(u16);

impl NodeAddress {
    /// Wrap a raw 16-bit address.
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Address as transmitted on the radio, most significant byte first.
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Raw numeric address.
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl FromStr for NodeAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.len() > 4 {
            return Err(format!("invalid node address: {}", s));
        }
        u16::from_str_radix(trimmed, 16)
            .map(NodeAddress)
            .map_err(|_| format!("invalid node address: {}", s))
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(value: NodeAddress) -> Self {
        value.to_string()
    }
}

/// Outcome reported by the node's failure-count byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    /// The node reported no failures while producing the frame.
    Normal,
    /// The node reported one or more failures.
    GeneralFailure,
}

/// Data frame received from a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    /// Address of the transmitting node.
    pub source: NodeAddress,
    /// Received signal strength as reported by the modem.
    #[serde(default)]
    pub rssi: i16,
    /// Length field from the link-layer header.
    #[serde(default)]
    pub length: u16,
    /// Frame payload; byte zero is the command code.
    pub payload: Vec<u8>,
}

impl DataFrame {
    /// Construct a data frame whose length field mirrors the payload.
    pub fn new(source: NodeAddress, rssi: i16, payload: Vec<u8>) -> Self {
        let length = u16::try_from(payload.len()).unwrap_or(u16::MAX);
        Self {
            source,
            rssi,
            length,
            payload,
        }
    }

    /// Command byte at index zero, if the payload is not empty.
    pub fn command_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Ensure the payload is at least `required` bytes long.
    pub fn require(&self, required: usize) -> Result<()> {
        if self.payload.len() < required {
            return Err(ProtocolError::MalformedFrame {
                command: self.command_byte().unwrap_or_default(),
                required,
                actual: self.payload.len(),
            });
        }
        Ok(())
    }

    /// Failure status reported by the node, when the layout carries one.
    pub fn status(&self, layout: &ProtocolLayout) -> FrameStatus {
        match layout
            .failure_count_offset
            .and_then(|offset| self.payload.get(offset))
        {
            Some(failures) if *failures != 0 => FrameStatus::GeneralFailure,
            _ => FrameStatus::Normal,
        }
    }
}

/// Delivery report for a frame the gateway transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// The remote node acknowledged delivery.
    Success,
    /// No acknowledgement was received.
    NoAck,
    /// Clear channel assessment failed.
    CcaFailure,
    /// The frame was purged before transmission.
    Purged,
}

impl TxStatus {
    /// True when the transmission was acknowledged.
    pub fn is_success(self) -> bool {
        matches!(self, TxStatus::Success)
    }
}

/// Link-layer error reported by the modem driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Node the failing exchange was associated with, when known.
    #[serde(default)]
    pub source: Option<NodeAddress>,
    /// Driver-provided description.
    pub message: String,
    /// Raw packet bytes for diagnostics.
    #[serde(default)]
    pub raw: Vec<u8>,
}

/// Any other link-layer response the gateway does not act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnclassifiedFrame {
    /// Processed packet bytes for diagnostics.
    #[serde(default)]
    pub raw: Vec<u8>,
}

/// One decoded unit from the radio link, classified once at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RadioFrame {
    /// Sensor, command or image data from a remote node.
    Data(DataFrame),
    /// Transmit status for an outbound frame.
    TxStatus {
        /// Reported delivery status.
        status: TxStatus,
    },
    /// Error reported by the modem driver.
    Error(ErrorFrame),
    /// Response type with no handling in the gateway.
    Unclassified(UnclassifiedFrame),
}

impl RadioFrame {
    /// Static label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RadioFrame::Data(_) => "data",
            RadioFrame::TxStatus { .. } => "tx_status",
            RadioFrame::Error(_) => "error",
            RadioFrame::Unclassified(_) => "unclassified",
        }
    }
}
