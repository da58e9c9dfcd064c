//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary frame dispatch and gateway lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use ugate_common::config::{EofRule, GatewayConfig};
use ugate_protocol::{
    CommandCode, DataFrame, FrameStatus, ImageMetadata, NodeAddress, ProtocolLayout,
    SensorSnapshot,
};

use crate::Result;

const JPEG_TRAILER: [u8; 2] = [0xFF, 0xD9];
const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Knobs governing chunk reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyPolicy {
    /// Frame offsets; `image_header_len` bytes are stripped from every chunk.
    pub layout: ProtocolLayout,
    /// Age after which an open transfer is considered stale.
    pub timeout: Duration,
    /// Capture resends allowed before an image is reported lost. Zero disables retries.
    pub max_retries: u32,
    /// End-of-image detection rule.
    pub eof: EofRule,
}

impl Default for ReassemblyPolicy {
    fn default() -> Self {
        Self {
            layout: ProtocolLayout::default(),
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            eof: EofRule::default(),
        }
    }
}

impl ReassemblyPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            layout: config.protocol.clone(),
            timeout: config.image.transfer_timeout,
            max_retries: config.image.capture_retries,
            eof: config.image.eof,
        }
    }
}

#[derive(Debug)]
struct ImageTransfer {
    command: CommandCode,
    readings: SensorSnapshot,
    created: Instant,
    created_at: DateTime<Utc>,
    chunks: Vec<Vec<u8>>,
    errored: bool,
}

impl ImageTransfer {
    fn new(command: CommandCode, readings: SensorSnapshot, status: FrameStatus, now: Instant) -> Self {
        Self {
            command,
            readings,
            created: now,
            created_at: Utc::now(),
            chunks: Vec::new(),
            errored: status == FrameStatus::GeneralFailure,
        }
    }

    fn has_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created) > timeout
    }

    fn byte_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Last two bytes of the stream, looking back at most one chunk.
    fn trailing_pair(&self) -> Option<[u8; 2]> {
        let last = self.chunks.last()?;
        match last.as_slice() {
            [] => None,
            [only] => {
                let previous = self.chunks.len().checked_sub(2)?;
                let before = self.chunks.get(previous)?.last()?;
                Some([*before, *only])
            }
            [.., a, b] => Some([*a, *b]),
        }
    }

    fn reached_eof(&mut self, rule: EofRule) -> bool {
        match rule {
            EofRule::JpegTrailer => match self.trailing_pair() {
                Some(pair) => pair == JPEG_TRAILER,
                None => {
                    // Cannot tell where the image ends; close it out as corrupt.
                    self.errored = true;
                    true
                }
            },
            EofRule::ShortChunk { nominal_chunk_len } => self
                .chunks
                .last()
                .map_or(true, |chunk| chunk.len() < nominal_chunk_len),
        }
    }

    fn stale(&self, now: Instant) -> StaleTransfer {
        StaleTransfer {
            command: self.command,
            elapsed: now.saturating_duration_since(self.created),
            discarded_chunks: self.chunks.len(),
        }
    }

    fn into_capture(self, source: NodeAddress, now: Instant) -> ImageCapture {
        ImageCapture {
            source,
            command: self.command,
            readings: self.readings,
            created_at: self.created_at,
            elapsed: now.saturating_duration_since(self.created),
            bytes: self.chunks.concat(),
        }
    }
}

#[derive(Debug, Default)]
struct NodeSlot {
    transfer: Option<ImageTransfer>,
    attempts: u32,
}

/// An open transfer abandoned because it outlived the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleTransfer {
    /// Command that started it.
    pub command: CommandCode,
    /// Age when it was abandoned.
    pub elapsed: Duration,
    /// Number of chunks thrown away.
    pub discarded_chunks: usize,
}

/// A complete image assembled from its chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCapture {
    pub source: NodeAddress,
    pub command: CommandCode,
    pub bytes: Vec<u8>,
    pub readings: SensorSnapshot,
    pub created_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl ImageCapture {
    /// Metadata handed to the persistence collaborator alongside the bytes.
    pub fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            source: self.source,
            command: self.command,
            byte_count: self.bytes.len(),
            readings: self.readings,
            created_at: self.created_at,
            elapsed_ms: u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
            file_name: ImageMetadata::file_name_for(self.created_at),
        }
    }
}

/// What a chunk did to its node's transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// More chunks are expected.
    Receiving { chunks: usize, bytes: usize },
    /// The end marker arrived on a clean transfer.
    Materialized(ImageCapture),
    /// The end marker arrived on a corrupted transfer and the capture should be resent.
    RetryRequested {
        command: CommandCode,
        attempt: u32,
        max_retries: u32,
    },
    /// The end marker arrived on a corrupted transfer with no retries left.
    RetriesExhausted { command: CommandCode, attempts: u32 },
}

/// Result of feeding one image chunk to the reassembler.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    /// The chunk opened a new transfer.
    pub started: bool,
    /// A stale transfer was discarded to make room for this one.
    pub replaced: Option<StaleTransfer>,
    pub outcome: ChunkOutcome,
}

/// Observable per-node transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Receiving {
        command: CommandCode,
        chunks: usize,
        errored: bool,
    },
}

/// Per-node image reassembly.
///
/// Each node address owns an independent slot so that chunks from one node
/// never block or corrupt another node's transfer. The outer map lock is only
/// held long enough to find the slot.
#[derive(Debug, Default)]
pub struct ImageReassembler {
    policy: ReassemblyPolicy,
    slots: Mutex<HashMap<NodeAddress, Arc<Mutex<NodeSlot>>>>,
}

impl ImageReassembler {
    pub fn new(policy: ReassemblyPolicy) -> Self {
        Self {
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ReassemblyPolicy {
        &self.policy
    }

    fn slot(&self, address: NodeAddress) -> Arc<Mutex<NodeSlot>> {
        self.slots.lock().entry(address).or_default().clone()
    }

    fn existing_slot(&self, address: NodeAddress) -> Option<Arc<Mutex<NodeSlot>>> {
        self.slots.lock().get(&address).cloned()
    }

    /// Append one image chunk to its node's transfer.
    ///
    /// The frame is validated before any state changes, so a malformed chunk
    /// leaves an open transfer untouched.
    pub fn handle_chunk(
        &self,
        frame: &DataFrame,
        command: CommandCode,
        now: Instant,
    ) -> Result<ChunkReport> {
        let layout = &self.policy.layout;
        frame.require(layout.image_header_len)?;
        let readings = SensorSnapshot::decode(frame, layout)?;

        let slot = self.slot(frame.source);
        let mut slot = slot.lock();
        let mut replaced = None;
        let (mut transfer, started) = match slot.transfer.take() {
            Some(current) if !current.has_timed_out(now, self.policy.timeout) => (current, false),
            previous => {
                if let Some(stale) = previous {
                    let stale = stale.stale(now);
                    warn!(
                        node = %frame.source,
                        elapsed_ms = stale.elapsed.as_millis() as u64,
                        chunks = stale.discarded_chunks,
                        "last image capture timed out, starting a new one"
                    );
                    slot.attempts = 0;
                    replaced = Some(stale);
                }
                info!(node = %frame.source, command = %command, "image transfer started");
                (
                    ImageTransfer::new(command, readings, frame.status(layout), now),
                    true,
                )
            }
        };

        transfer
            .chunks
            .push(frame.payload[layout.image_header_len..].to_vec());

        if !transfer.reached_eof(self.policy.eof) {
            let outcome = ChunkOutcome::Receiving {
                chunks: transfer.chunks.len(),
                bytes: transfer.byte_count(),
            };
            debug!(node = %frame.source, ?outcome, "image chunk buffered");
            slot.transfer = Some(transfer);
            return Ok(ChunkReport {
                started,
                replaced,
                outcome,
            });
        }

        let outcome = if transfer.errored {
            self.retry_or_give_up(&mut slot, frame.source, transfer.command)
        } else {
            slot.attempts = 0;
            let capture = transfer.into_capture(frame.source, now);
            info!(
                node = %frame.source,
                bytes = capture.bytes.len(),
                elapsed_ms = capture.elapsed.as_millis() as u64,
                "image transfer complete"
            );
            ChunkOutcome::Materialized(capture)
        };
        Ok(ChunkReport {
            started,
            replaced,
            outcome,
        })
    }

    fn retry_or_give_up(
        &self,
        slot: &mut NodeSlot,
        source: NodeAddress,
        command: CommandCode,
    ) -> ChunkOutcome {
        let max_retries = self.policy.max_retries;
        if max_retries > 0 && slot.attempts < max_retries {
            slot.attempts += 1;
            warn!(
                node = %source,
                attempt = slot.attempts,
                max_retries,
                "lost image packets, retrying capture"
            );
            ChunkOutcome::RetryRequested {
                command,
                attempt: slot.attempts,
                max_retries,
            }
        } else {
            let attempts = std::mem::take(&mut slot.attempts);
            warn!(node = %source, attempts, "image capture failed, giving up");
            ChunkOutcome::RetriesExhausted { command, attempts }
        }
    }

    /// Flag open transfers as corrupted after a link error.
    ///
    /// With no address every open transfer is flagged, since the link cannot
    /// say which exchange failed. Returns the flagged addresses in order.
    pub fn mark_error(&self, address: Option<NodeAddress>) -> Vec<NodeAddress> {
        let slots: Vec<(NodeAddress, Arc<Mutex<NodeSlot>>)> = {
            let map = self.slots.lock();
            match address {
                Some(address) => map
                    .get(&address)
                    .map(|slot| vec![(address, slot.clone())])
                    .unwrap_or_default(),
                None => map
                    .iter()
                    .map(|(address, slot)| (*address, slot.clone()))
                    .collect(),
            }
        };

        let mut flagged = Vec::new();
        for (address, slot) in slots {
            if let Some(transfer) = slot.lock().transfer.as_mut() {
                transfer.errored = true;
                flagged.push(address);
            }
        }
        flagged.sort();
        if !flagged.is_empty() {
            debug!(nodes = ?flagged, "flagged open transfers as corrupted");
        }
        flagged
    }

    /// True iff `address` has an open transfer older than the timeout.
    pub fn has_timed_out(&self, address: NodeAddress, now: Instant) -> bool {
        let Some(slot) = self.existing_slot(address) else {
            return false;
        };
        let slot = slot.lock();
        slot.transfer
            .as_ref()
            .is_some_and(|transfer| transfer.has_timed_out(now, self.policy.timeout))
    }

    /// Drop a stale transfer for `address`, resetting its retry budget.
    pub fn abandon_if_timed_out(&self, address: NodeAddress, now: Instant) -> Option<StaleTransfer> {
        let slot = self.existing_slot(address)?;
        let mut slot = slot.lock();
        let timed_out = slot
            .transfer
            .as_ref()
            .is_some_and(|transfer| transfer.has_timed_out(now, self.policy.timeout));
        if !timed_out {
            return None;
        }
        let stale = slot.transfer.take().map(|transfer| transfer.stale(now));
        slot.attempts = 0;
        stale
    }

    pub fn state(&self, address: NodeAddress) -> TransferState {
        let Some(slot) = self.existing_slot(address) else {
            return TransferState::Idle;
        };
        let slot = slot.lock();
        match slot.transfer.as_ref() {
            Some(transfer) => TransferState::Receiving {
                command: transfer.command,
                chunks: transfer.chunks.len(),
                errored: transfer.errored,
            },
            None => TransferState::Idle,
        }
    }

    /// Retries spent on the current capture for `address`.
    pub fn attempts(&self, address: NodeAddress) -> u32 {
        let Some(slot) = self.existing_slot(address) else {
            return 0;
        };
        let attempts = slot.lock().attempts;
        attempts
    }

    /// Number of nodes with an open transfer.
    pub fn open_transfers(&self) -> usize {
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| slot.lock().transfer.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayError;
    use ugate_protocol::ProtocolError;

    const NODE: NodeAddress = NodeAddress::new(0x3333);
    const OTHER: NodeAddress = NodeAddress::new(0x4444);

    fn chunk_from(source: NodeAddress, failures: u8, data: &[u8]) -> DataFrame {
        let mut payload = vec![29, failures, 10, 6, 3, 8, 2];
        payload.extend_from_slice(data);
        DataFrame::new(source, -40, payload)
    }

    fn chunk(data: &[u8]) -> DataFrame {
        chunk_from(NODE, 0, data)
    }

    fn feed(reassembler: &ImageReassembler, frame: &DataFrame, now: Instant) -> ChunkReport {
        reassembler
            .handle_chunk(frame, CommandCode::CamTakePic, now)
            .expect("chunk accepted")
    }

    #[test]
    fn chunks_concatenate_in_arrival_order() {
        let reassembler = ImageReassembler::default();
        let now = Instant::now();
        let first = feed(&reassembler, &chunk(&[0xFF, 0xD8, 1, 2]), now);
        assert!(first.started);
        assert_eq!(first.outcome, ChunkOutcome::Receiving { chunks: 1, bytes: 4 });
        let second = feed(&reassembler, &chunk(&[3, 4]), now);
        assert!(!second.started);
        let last = feed(&reassembler, &chunk(&[5, 0xFF, 0xD9]), now);

        match last.outcome {
            ChunkOutcome::Materialized(capture) => {
                assert_eq!(capture.bytes, vec![0xFF, 0xD8, 1, 2, 3, 4, 5, 0xFF, 0xD9]);
                assert_eq!(capture.readings, SensorSnapshot::new(10, 6, 3, 8, 2));
                let metadata = capture.metadata();
                assert_eq!(metadata.byte_count, 9);
                assert!(metadata.file_name.ends_with(".jpg"));
            }
            other => panic!("expected image, got {other:?}"),
        }
        assert_eq!(reassembler.state(NODE), TransferState::Idle);
    }

    #[test]
    fn trailer_split_across_chunks() {
        let reassembler = ImageReassembler::default();
        let now = Instant::now();
        feed(&reassembler, &chunk(&[1, 0xFF]), now);
        let report = feed(&reassembler, &chunk(&[0xD9]), now);
        assert!(matches!(report.outcome, ChunkOutcome::Materialized(ref c) if c.bytes == vec![1, 0xFF, 0xD9]));
    }

    #[test]
    fn empty_chunk_is_treated_as_corrupt_end() {
        let reassembler = ImageReassembler::default();
        let now = Instant::now();
        feed(&reassembler, &chunk(&[1, 2]), now);
        let report = feed(&reassembler, &chunk(&[]), now);
        assert_eq!(
            report.outcome,
            ChunkOutcome::RetryRequested {
                command: CommandCode::CamTakePic,
                attempt: 1,
                max_retries: 3
            }
        );
        assert_eq!(reassembler.state(NODE), TransferState::Idle);
    }

    #[test]
    fn lone_byte_first_chunk_requests_retry() {
        let reassembler = ImageReassembler::default();
        let report = feed(&reassembler, &chunk(&[1]), Instant::now());
        assert!(report.started);
        assert_eq!(
            report.outcome,
            ChunkOutcome::RetryRequested {
                command: CommandCode::CamTakePic,
                attempt: 1,
                max_retries: 3
            }
        );
        assert_eq!(reassembler.state(NODE), TransferState::Idle);
    }

    #[test]
    fn error_then_retries_then_give_up_resets_budget() {
        let reassembler = ImageReassembler::new(ReassemblyPolicy {
            max_retries: 2,
            ..ReassemblyPolicy::default()
        });
        let now = Instant::now();
        for attempt in 1..=2 {
            feed(&reassembler, &chunk(&[1, 2]), now);
            assert_eq!(reassembler.mark_error(None), vec![NODE]);
            let report = feed(&reassembler, &chunk(&[0xFF, 0xD9]), now);
            assert_eq!(
                report.outcome,
                ChunkOutcome::RetryRequested {
                    command: CommandCode::CamTakePic,
                    attempt,
                    max_retries: 2
                }
            );
        }
        feed(&reassembler, &chunk(&[1, 2]), now);
        reassembler.mark_error(Some(NODE));
        let report = feed(&reassembler, &chunk(&[0xFF, 0xD9]), now);
        assert_eq!(
            report.outcome,
            ChunkOutcome::RetriesExhausted {
                command: CommandCode::CamTakePic,
                attempts: 2
            }
        );
        assert_eq!(reassembler.attempts(NODE), 0);
        assert_eq!(reassembler.state(NODE), TransferState::Idle);
    }

    #[test]
    fn zero_retries_gives_up_immediately() {
        let reassembler = ImageReassembler::new(ReassemblyPolicy {
            max_retries: 0,
            ..ReassemblyPolicy::default()
        });
        let report = feed(&reassembler, &chunk_from(NODE, 1, &[0xFF, 0xD9]), Instant::now());
        assert_eq!(
            report.outcome,
            ChunkOutcome::RetriesExhausted {
                command: CommandCode::CamTakePic,
                attempts: 0
            }
        );
    }

    #[test]
    fn success_resets_attempts() {
        let reassembler = ImageReassembler::default();
        let now = Instant::now();
        feed(&reassembler, &chunk_from(NODE, 2, &[0xFF, 0xD9]), now);
        assert_eq!(reassembler.attempts(NODE), 1);
        let report = feed(&reassembler, &chunk(&[0xFF, 0xD9]), now);
        assert!(matches!(report.outcome, ChunkOutcome::Materialized(_)));
        assert_eq!(reassembler.attempts(NODE), 0);
    }

    #[test]
    fn timeout_is_strictly_after_threshold() {
        let reassembler = ImageReassembler::default();
        let start = Instant::now();
        feed(&reassembler, &chunk(&[0xFF, 0xD8]), start);
        assert!(!reassembler.has_timed_out(NODE, start + Duration::from_secs(120)));
        assert!(reassembler.has_timed_out(NODE, start + Duration::from_secs(121)));
        assert!(!reassembler.has_timed_out(OTHER, start + Duration::from_secs(121)));
    }

    #[test]
    fn stale_transfer_is_replaced_by_next_chunk() {
        let reassembler = ImageReassembler::default();
        let start = Instant::now();
        feed(&reassembler, &chunk(&[0xFF, 0xD8]), start);
        feed(&reassembler, &chunk(&[1, 2]), start);
        let later = start + Duration::from_secs(121);
        let report = feed(&reassembler, &chunk(&[0xFF, 0xD8, 7]), later);
        assert!(report.started);
        let stale = report.replaced.expect("stale transfer reported");
        assert_eq!(stale.discarded_chunks, 2);
        assert_eq!(stale.elapsed, Duration::from_secs(121));
        assert_eq!(
            reassembler.state(NODE),
            TransferState::Receiving {
                command: CommandCode::CamTakePic,
                chunks: 1,
                errored: false
            }
        );
    }

    #[test]
    fn abandon_only_drops_stale_transfers() {
        let reassembler = ImageReassembler::default();
        let start = Instant::now();
        feed(&reassembler, &chunk(&[0xFF, 0xD8]), start);
        assert_eq!(reassembler.abandon_if_timed_out(NODE, start), None);
        let stale = reassembler
            .abandon_if_timed_out(NODE, start + Duration::from_secs(300))
            .expect("stale");
        assert_eq!(stale.discarded_chunks, 1);
        assert_eq!(reassembler.state(NODE), TransferState::Idle);
    }

    #[test]
    fn nodes_do_not_share_transfers() {
        let reassembler = ImageReassembler::default();
        let now = Instant::now();
        feed(&reassembler, &chunk_from(NODE, 0, &[1, 2]), now);
        feed(&reassembler, &chunk_from(OTHER, 0, &[9, 8]), now);
        assert_eq!(reassembler.mark_error(Some(OTHER)), vec![OTHER]);
        let report = feed(&reassembler, &chunk_from(NODE, 0, &[0xFF, 0xD9]), now);
        assert!(matches!(report.outcome, ChunkOutcome::Materialized(ref c) if c.bytes == vec![1, 2, 0xFF, 0xD9]));
        assert_eq!(reassembler.open_transfers(), 1);
    }

    #[test]
    fn malformed_chunk_leaves_state_untouched() {
        let reassembler = ImageReassembler::default();
        let now = Instant::now();
        feed(&reassembler, &chunk(&[1, 2]), now);
        let short = DataFrame::new(NODE, -40, vec![29, 0, 1]);
        let err = reassembler
            .handle_chunk(&short, CommandCode::CamTakePic, now)
            .expect_err("short chunk");
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::MalformedFrame { required: 7, actual: 3, .. })
        ));
        assert_eq!(
            reassembler.state(NODE),
            TransferState::Receiving {
                command: CommandCode::CamTakePic,
                chunks: 1,
                errored: false
            }
        );
    }

    #[test]
    fn short_chunk_rule_ends_on_partial_chunk() {
        let reassembler = ImageReassembler::new(ReassemblyPolicy {
            eof: EofRule::ShortChunk {
                nominal_chunk_len: 4,
            },
            ..ReassemblyPolicy::default()
        });
        let now = Instant::now();
        feed(&reassembler, &chunk(&[1, 2, 3, 4]), now);
        let report = feed(&reassembler, &chunk(&[5]), now);
        assert!(matches!(report.outcome, ChunkOutcome::Materialized(ref c) if c.bytes.len() == 5));
    }
}
