//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote node radio protocol model and positional decoders."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::effect::{Effect, EffectEnvelope};
use crate::{ProtocolError, Result};

/// Destination for effects emitted by the core.
pub trait EffectSink: Send + Sync {
    /// Hand an effect to the collaborator layer.
    fn emit(&self, envelope: EffectEnvelope) -> Result<()>;
    /// Human-readable sink name for logging/metrics.
    fn name(&self) -> &'static str;

    /// Stamp and emit every effect in order.
    fn emit_all(&self, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            self.emit(EffectEnvelope::new(effect))?;
        }
        Ok(())
    }
}

/// In-memory sink backed by a mutex protected queue.
#[derive(Clone, Default)]
pub struct InMemoryEffectSink {
    queue: Arc<Mutex<VecDeque<EffectEnvelope>>>,
}

impl InMemoryEffectSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every queued effect in emission order.
    pub fn drain(&self) -> Vec<Effect> {
        self.queue
            .lock()
            .drain(..)
            .map(|envelope| envelope.effect)
            .collect()
    }

    /// Number of queued effects.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl EffectSink for InMemoryEffectSink {
    fn emit(&self, envelope: EffectEnvelope) -> Result<()> {
        self.queue.lock().push_back(envelope);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Sink forwarding effects to an async consumer over an unbounded channel.
#[derive(Clone)]
pub struct ChannelEffectSink {
    tx: mpsc::UnboundedSender<EffectEnvelope>,
}

impl ChannelEffectSink {
    /// Create a sink together with the receiving half for the consumer task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EffectEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EffectSink for ChannelEffectSink {
    fn emit(&self, envelope: EffectEnvelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| ProtocolError::SinkClosed(self.name()))
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
