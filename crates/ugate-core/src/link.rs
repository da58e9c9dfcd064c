//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Outbound radio link abstraction and loopback implementation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use ugate_protocol::NodeAddress;

use crate::{GatewayError, Result};

/// Outbound side of the radio transport.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Transmit `bytes` to the node at `address`.
    async fn send_data(&self, address: NodeAddress, bytes: Vec<u8>) -> Result<()>;
    /// Human-readable link name for logging.
    fn name(&self) -> &'static str;
}

/// A frame handed to the loopback link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub address: NodeAddress,
    pub bytes: Vec<u8>,
}

/// Link that records outbound frames instead of transmitting them.
///
/// Used by the daemon when no modem is attached and by tests. An optional
/// tap forwards every frame to a channel so callers can await delivery.
#[derive(Debug, Clone, Default)]
pub struct LoopbackLink {
    sent: Arc<Mutex<Vec<SentFrame>>>,
    tap: Option<mpsc::UnboundedSender<SentFrame>>,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loopback link that also forwards frames to the returned receiver.
    pub fn with_tap() -> (Self, mpsc::UnboundedReceiver<SentFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sent: Arc::default(),
                tap: Some(tx),
            },
            rx,
        )
    }

    /// Frames sent so far, oldest first.
    pub async fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl RadioLink for LoopbackLink {
    async fn send_data(&self, address: NodeAddress, bytes: Vec<u8>) -> Result<()> {
        debug!(node = %address, bytes = bytes.len(), "loopback transmit");
        let frame = SentFrame { address, bytes };
        self.sent.lock().await.push(frame.clone());
        if let Some(tap) = &self.tap {
            tap.send(frame)
                .map_err(|_| GatewayError::LinkClosed(self.name()))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}
