//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary frame dispatch and gateway lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info, warn};
use ugate_common::config::GatewayConfig;
use ugate_metrics::GatewayMetrics;
use ugate_protocol::{
    base16, AccessKeys, CommandCode, DataFrame, Effect, ErrorFrame, FrameStatus, GateState,
    NodeAddress, Notification, ProtocolError, ProtocolLayout, RadioFrame, RemoteSettings, SensorSnapshot, SoundKind,
    TxStatus, UnclassifiedFrame,
};

use crate::reassembly::{ChunkOutcome, ImageReassembler, ReassemblyPolicy, StaleTransfer};
use crate::{GatewayError, Result};

/// Routes classified radio frames to their handlers and collects the effects.
#[derive(Debug)]
pub struct PacketDispatcher {
    layout: ProtocolLayout,
    reassembler: ImageReassembler,
    nodes: HashSet<NodeAddress>,
    metrics: Option<GatewayMetrics>,
}

impl PacketDispatcher {
    /// Dispatcher accepting frames from `nodes`; an empty set accepts any source.
    pub fn new<I>(policy: ReassemblyPolicy, nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeAddress>,
    {
        Self {
            layout: policy.layout.clone(),
            reassembler: ImageReassembler::new(policy),
            nodes: nodes.into_iter().collect(),
            metrics: None,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let nodes = config
            .radio
            .nodes
            .iter()
            .map(|node| {
                node.parse::<NodeAddress>()
                    .map_err(|_| GatewayError::UnknownNode(node.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(ReassemblyPolicy::from_config(config), nodes))
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn reassembler(&self) -> &ImageReassembler {
        &self.reassembler
    }

    /// Configured nodes in address order.
    pub fn nodes(&self) -> Vec<NodeAddress> {
        let mut nodes: Vec<_> = self.nodes.iter().copied().collect();
        nodes.sort();
        nodes
    }

    /// True when frames from `address` are accepted.
    pub fn is_known(&self, address: NodeAddress) -> bool {
        self.nodes.is_empty() || self.nodes.contains(&address)
    }

    /// Handle one frame and return the effects it produced, in emission order.
    ///
    /// Decoding failures never propagate: they become diagnostic effects and
    /// the next frame is processed as usual.
    pub fn dispatch(&self, frame: &RadioFrame, now: Instant) -> Vec<Effect> {
        if let Some(metrics) = &self.metrics {
            metrics.observe_frame(frame.kind());
        }
        match frame {
            RadioFrame::Data(data) => match self.dispatch_data(data, now) {
                Ok(effects) => effects,
                Err(err) => self.rejected(data, err),
            },
            RadioFrame::TxStatus { status } => self.tx_status(*status),
            RadioFrame::Error(error) => self.link_error(error),
            RadioFrame::Unclassified(frame) => self.unclassified(frame),
        }
    }

    /// Abandon a stalled transfer before a new capture command goes out.
    pub fn prepare_capture(&self, address: NodeAddress, now: Instant) -> Vec<Effect> {
        match self.reassembler.abandon_if_timed_out(address, now) {
            Some(stale) => self.timed_out(address, stale),
            None => Vec::new(),
        }
    }

    fn dispatch_data(&self, data: &DataFrame, now: Instant) -> Result<Vec<Effect>> {
        if !self.is_known(data.source) {
            return Err(GatewayError::UnknownNode(data.source.to_string()));
        }
        data.require(1)?;
        let code = data.payload[0];
        let command = CommandCode::from_byte(code).ok_or(ProtocolError::UnrecognizedCommand(code))?;
        let source = data.source;

        match command {
            CommandCode::CamTakePic => self.image_chunk(data, command, now),
            CommandCode::AccessPinChange => {
                let keys = AccessKeys::decode(data, &self.layout)?;
                info!(node = %source, "access keys updated");
                Ok(vec![Effect::Notify(Notification::KeysUpdated { source, keys })])
            }
            CommandCode::ServoLaserCalibrate => {
                let status = data.status(&self.layout);
                if status == FrameStatus::Normal {
                    info!(node = %source, "laser calibration succeeded");
                } else {
                    warn!(node = %source, "laser calibration failed");
                }
                Ok(vec![Effect::Notify(Notification::LaserCalibrated { source, status })])
            }
            CommandCode::SensorGetReadings => {
                let readings = SensorSnapshot::decode(data, &self.layout)?;
                Ok(vec![Effect::Notify(Notification::ReadingsAvailable {
                    source,
                    status: data.status(&self.layout),
                    readings,
                    gate: GateState::decode(data, &self.layout),
                })])
            }
            CommandCode::SensorGetSettings => {
                let settings = RemoteSettings::decode(data, &self.layout)?;
                Ok(vec![Effect::Notify(Notification::SettingsAvailable {
                    source,
                    settings,
                })])
            }
            other => {
                warn!(node = %source, command = %other, "no handler for command response");
                Ok(vec![Effect::Warn(format!(
                    "no handler for {other} from {source}"
                ))])
            }
        }
    }

    fn image_chunk(
        &self,
        data: &DataFrame,
        command: CommandCode,
        now: Instant,
    ) -> Result<Vec<Effect>> {
        let report = self.reassembler.handle_chunk(data, command, now)?;
        let source = data.source;
        let mut effects = Vec::new();
        if let Some(stale) = report.replaced {
            effects.extend(self.timed_out(source, stale));
        }
        if report.started {
            effects.push(Effect::PlaySound(SoundKind::Camera));
        }

        match report.outcome {
            ChunkOutcome::Receiving { .. } => {}
            ChunkOutcome::Materialized(capture) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_image(capture.elapsed);
                }
                let metadata = capture.metadata();
                effects.push(Effect::PersistImage {
                    bytes: capture.bytes,
                    metadata,
                });
                effects.push(Effect::PlaySound(SoundKind::DoorBell));
                effects.push(Effect::PlaySound(SoundKind::Complete));
            }
            ChunkOutcome::RetryRequested {
                command,
                attempt,
                max_retries,
            } => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_retry();
                }
                let err = ProtocolError::TransferError(source.to_string());
                effects.push(Effect::Warn(format!(
                    "{err}, retrying capture ({attempt} of {max_retries})"
                )));
                effects.push(Effect::Retransmit {
                    address: source,
                    command_bytes: vec![command.code()],
                });
            }
            ChunkOutcome::RetriesExhausted { command, attempts } => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_image_lost();
                }
                let err = ProtocolError::TransferError(source.to_string());
                effects.push(Effect::Warn(format!(
                    "{err}, giving up after {attempts} retries"
                )));
                effects.push(Effect::PlaySound(SoundKind::Error));
                effects.push(Effect::Notify(Notification::ImageLost {
                    source,
                    command,
                    attempts,
                }));
            }
        }
        Ok(effects)
    }

    fn timed_out(&self, source: NodeAddress, stale: StaleTransfer) -> Vec<Effect> {
        if let Some(metrics) = &self.metrics {
            metrics.observe_timeout();
        }
        let elapsed_ms = u64::try_from(stale.elapsed.as_millis()).unwrap_or(u64::MAX);
        let err = ProtocolError::TransferTimeout(source.to_string());
        vec![
            Effect::Warn(format!("{err} after {}s", stale.elapsed.as_secs())),
            Effect::Notify(Notification::TransferTimedOut {
                source,
                elapsed_ms,
                discarded_chunks: stale.discarded_chunks,
            }),
        ]
    }

    fn rejected(&self, data: &DataFrame, err: GatewayError) -> Vec<Effect> {
        let source = data.source;
        match err {
            GatewayError::UnknownNode(_) => {
                debug!(node = %source, "discarding frame from unknown node");
                vec![Effect::Warn(format!("discarded frame from unknown node {source}"))]
            }
            GatewayError::Protocol(ProtocolError::UnrecognizedCommand(code)) => {
                warn!(node = %source, code, raw = %base16(&data.payload), "unrecognized command");
                vec![Effect::Warn(format!(
                    "unrecognized command {code} from {source}"
                ))]
            }
            err => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_malformed();
                }
                let raw = base16(&data.payload);
                warn!(node = %source, error = %err, raw = %raw, "dropping malformed frame");
                vec![
                    Effect::Notify(Notification::MalformedFrame {
                        source,
                        command: data.command_byte().unwrap_or_default(),
                        detail: err.to_string(),
                        raw,
                    }),
                    Effect::Warn(format!("dropped frame from {source}: {err}")),
                ]
            }
        }
    }

    fn tx_status(&self, status: TxStatus) -> Vec<Effect> {
        let sound = if status.is_success() {
            debug!(?status, "transmission acknowledged");
            SoundKind::Blip
        } else {
            warn!(?status, "transmission failed");
            SoundKind::Error
        };
        vec![
            Effect::PlaySound(sound),
            Effect::Notify(Notification::TxStatus { status }),
        ]
    }

    fn link_error(&self, error: &ErrorFrame) -> Vec<Effect> {
        let flagged = self.reassembler.mark_error(error.source);
        let raw = base16(&error.raw);
        warn!(
            node = ?error.source.map(|node| node.to_string()),
            message = %error.message,
            raw = %raw,
            flagged = flagged.len(),
            "radio link error"
        );
        vec![
            Effect::PlaySound(SoundKind::Error),
            Effect::Notify(Notification::TransportError {
                source: error.source,
                message: error.message.clone(),
                raw,
            }),
        ]
    }

    fn unclassified(&self, frame: &UnclassifiedFrame) -> Vec<Effect> {
        let raw = base16(&frame.raw);
        debug!(raw = %raw, "unused response");
        vec![
            Effect::PlaySound(SoundKind::Confirm),
            Effect::Warn(format!("unused response: {raw}")),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use ugate_protocol::MultiAlarmTrip;
    use crate::reassembly::TransferState;

    const NODE: NodeAddress = NodeAddress::new(0x3333);

    fn dispatcher() -> PacketDispatcher {
        PacketDispatcher::new(ReassemblyPolicy::default(), [NODE])
    }

    fn data(payload: Vec<u8>) -> RadioFrame {
        RadioFrame::Data(DataFrame::new(NODE, -48, payload))
    }

    fn image(failures: u8, bytes: &[u8]) -> RadioFrame {
        let mut payload = vec![29, failures, 1, 2, 3, 4, 5];
        payload.extend_from_slice(bytes);
        data(payload)
    }

    #[test]
    fn readings_carry_failure_status() {
        let effects = dispatcher().dispatch(&data(vec![103, 2, 12, 4, 9, 7, 11]), Instant::now());
        match effects.as_slice() {
            [Effect::Notify(Notification::ReadingsAvailable {
                source,
                status,
                readings,
                gate,
            })] => {
                assert_eq!(*source, NODE);
                assert_eq!(*status, FrameStatus::GeneralFailure);
                assert_eq!(*readings, SensorSnapshot::new(12, 4, 9, 7, 11));
                assert_eq!(*gate, None);
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }

    #[test]
    fn readings_report_trailing_gate_state() {
        let effects =
            dispatcher().dispatch(&data(vec![103, 0, 12, 4, 9, 7, 11, 1]), Instant::now());
        assert!(matches!(
            effects.as_slice(),
            [Effect::Notify(Notification::ReadingsAvailable {
                gate: Some(GateState::Open),
                ..
            })]
        ));
    }

    #[test]
    fn laser_calibration_reports_outcome() {
        let dispatcher = dispatcher();
        let now = Instant::now();
        assert_eq!(
            dispatcher.dispatch(&data(vec![11, 0]), now),
            vec![Effect::Notify(Notification::LaserCalibrated {
                source: NODE,
                status: FrameStatus::Normal
            })]
        );
        assert_eq!(
            dispatcher.dispatch(&data(vec![11, 3]), now),
            vec![Effect::Notify(Notification::LaserCalibrated {
                source: NODE,
                status: FrameStatus::GeneralFailure
            })]
        );
    }

    #[test]
    fn settings_snapshot_is_published() {
        let payload = vec![104, 0, 1, 2, 3, 0, 1, 1, 1, 1, 9, 6, 3, 4, 11, 2, 80, 5, 4];
        let effects = dispatcher().dispatch(&data(payload), Instant::now());
        match effects.as_slice() {
            [Effect::Notify(Notification::SettingsAvailable { settings, .. })] => {
                assert_eq!(settings.access_keys, AccessKeys([1, 2, 3]));
                assert_eq!(settings.multi_alarm_trip, MultiAlarmTrip::All);
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }

    #[test]
    fn short_settings_become_malformed_notifications() {
        let payload = vec![104, 0, 1, 2, 3, 0, 1, 1, 1, 1, 9, 6, 3, 4, 11, 2, 80, 5];
        let effects = dispatcher().dispatch(&data(payload), Instant::now());
        assert_eq!(effects.len(), 2);
        assert!(matches!(
            &effects[0],
            Effect::Notify(Notification::MalformedFrame { command: 104, .. })
        ));
        assert!(matches!(&effects[1], Effect::Warn(_)));
    }

    #[test]
    fn access_keys_are_announced() {
        let effects = dispatcher().dispatch(&data(vec![37, 7, 8, 9]), Instant::now());
        assert_eq!(
            effects,
            vec![Effect::Notify(Notification::KeysUpdated {
                source: NODE,
                keys: AccessKeys([7, 8, 9])
            })]
        );
    }

    #[test]
    fn unrecognized_and_empty_frames_do_not_abort() {
        let dispatcher = dispatcher();
        let effects = dispatcher.dispatch(&data(vec![200, 0]), Instant::now());
        assert_eq!(
            effects,
            vec![Effect::Warn("unrecognized command 200 from 3333".into())]
        );
        let effects = dispatcher.dispatch(&data(Vec::new()), Instant::now());
        assert!(matches!(
            &effects[0],
            Effect::Notify(Notification::MalformedFrame { command: 0, .. })
        ));
    }

    #[test]
    fn frames_from_unknown_nodes_are_discarded() {
        let frame = RadioFrame::Data(DataFrame::new(NodeAddress::new(0x9999), -48, vec![37, 1, 2, 3]));
        let effects = dispatcher().dispatch(&frame, Instant::now());
        assert_eq!(
            effects,
            vec![Effect::Warn("discarded frame from unknown node 9999".into())]
        );
        let open = PacketDispatcher::new(ReassemblyPolicy::default(), Vec::new());
        assert!(open.is_known(NodeAddress::new(0x9999)));
    }

    #[test]
    fn tx_status_selects_sound() {
        let dispatcher = dispatcher();
        let ok = dispatcher.dispatch(&RadioFrame::TxStatus { status: TxStatus::Success }, Instant::now());
        assert_eq!(ok[0], Effect::PlaySound(SoundKind::Blip));
        let failed = dispatcher.dispatch(&RadioFrame::TxStatus { status: TxStatus::NoAck }, Instant::now());
        assert_eq!(failed[0], Effect::PlaySound(SoundKind::Error));
        assert_eq!(
            failed[1],
            Effect::Notify(Notification::TxStatus {
                status: TxStatus::NoAck
            })
        );
    }

    #[test]
    fn image_transfer_effects_in_order() {
        let dispatcher = dispatcher();
        let now = Instant::now();
        assert_eq!(
            dispatcher.dispatch(&image(0, &[0xFF, 0xD8]), now),
            vec![Effect::PlaySound(SoundKind::Camera)]
        );
        assert!(dispatcher.dispatch(&image(0, &[1, 2, 3]), now).is_empty());
        let effects = dispatcher.dispatch(&image(0, &[0xFF, 0xD9]), now);
        assert_eq!(effects.len(), 3);
        match &effects[0] {
            Effect::PersistImage { bytes, metadata } => {
                assert_eq!(bytes, &vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
                assert_eq!(metadata.source, NODE);
                assert_eq!(metadata.byte_count, 7);
            }
            other => panic!("expected image, got {other:?}"),
        }
        assert_eq!(effects[1], Effect::PlaySound(SoundKind::DoorBell));
        assert_eq!(effects[2], Effect::PlaySound(SoundKind::Complete));
    }

    #[test]
    fn link_error_corrupts_transfer_and_requests_retransmit() {
        let dispatcher = dispatcher();
        let now = Instant::now();
        dispatcher.dispatch(&image(0, &[0xFF, 0xD8]), now);
        let effects = dispatcher.dispatch(
            &RadioFrame::Error(ErrorFrame {
                source: None,
                message: "checksum".into(),
                raw: vec![0x7E, 0x01],
            }),
            now,
        );
        assert_eq!(effects[0], Effect::PlaySound(SoundKind::Error));
        assert!(matches!(
            dispatcher.reassembler().state(NODE),
            TransferState::Receiving { errored: true, .. }
        ));

        let effects = dispatcher.dispatch(&image(0, &[0xFF, 0xD9]), now);
        assert_eq!(
            effects[0],
            Effect::Warn(
                "image transfer from 3333 arrived corrupted, retrying capture (1 of 3)".into()
            )
        );
        assert_eq!(
            effects[1],
            Effect::Retransmit {
                address: NODE,
                command_bytes: vec![29]
            }
        );
        assert_eq!(dispatcher.reassembler().state(NODE), TransferState::Idle);
    }

    #[test]
    fn corrupted_capture_without_retries_is_lost() {
        let dispatcher = PacketDispatcher::new(
            ReassemblyPolicy {
                max_retries: 0,
                ..ReassemblyPolicy::default()
            },
            [NODE],
        );
        let effects = dispatcher.dispatch(&image(1, &[0xFF, 0xD8, 0xFF, 0xD9]), Instant::now());
        assert_eq!(
            effects,
            vec![
                Effect::PlaySound(SoundKind::Camera),
                Effect::Warn("image transfer from 3333 arrived corrupted, giving up after 0 retries".into()),
                Effect::PlaySound(SoundKind::Error),
                Effect::Notify(Notification::ImageLost {
                    source: NODE,
                    command: CommandCode::CamTakePic,
                    attempts: 0
                }),
            ]
        );
    }

    #[test]
    fn prepare_capture_reports_stalled_transfer() {
        let dispatcher = dispatcher();
        let start = Instant::now();
        dispatcher.dispatch(&image(0, &[0xFF, 0xD8]), start);
        assert!(dispatcher.prepare_capture(NODE, start).is_empty());
        let effects = dispatcher.prepare_capture(NODE, start + Duration::from_secs(130));
        assert_eq!(
            effects[0],
            Effect::Warn("image transfer from 3333 timed out after 130s".into())
        );
        assert!(matches!(
            effects[1],
            Effect::Notify(Notification::TransferTimedOut {
                discarded_chunks: 1,
                elapsed_ms: 130_000,
                ..
            })
        ));
    }

    #[test]
    fn unclassified_frames_confirm_and_warn() {
        let effects = dispatcher().dispatch(
            &RadioFrame::Unclassified(UnclassifiedFrame { raw: vec![0x8A, 0x02] }),
            Instant::now(),
        );
        assert_eq!(
            effects,
            vec![
                Effect::PlaySound(SoundKind::Confirm),
                Effect::Warn("unused response: 8a,02".into())
            ]
        );
    }
}
