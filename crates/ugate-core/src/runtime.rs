//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary frame dispatch and gateway lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ugate_common::config::GatewayConfig;
use ugate_mail::{Destinations, Inbox, InboundMail, MailDecision};
use ugate_metrics::GatewayMetrics;
use ugate_protocol::{CommandCode, Effect, EffectSink, NodeAddress, RadioFrame};

use crate::dispatcher::PacketDispatcher;
use crate::link::RadioLink;
use crate::Result;

/// Wires the dispatcher to the radio link, the effect sink and the inbox.
pub struct GatewayRuntime {
    dispatcher: PacketDispatcher,
    inbox: Inbox,
    link: Arc<dyn RadioLink>,
    sink: Arc<dyn EffectSink>,
    metrics: Option<GatewayMetrics>,
}

impl GatewayRuntime {
    pub fn new(
        dispatcher: PacketDispatcher,
        inbox: Inbox,
        link: Arc<dyn RadioLink>,
        sink: Arc<dyn EffectSink>,
    ) -> Self {
        Self {
            dispatcher,
            inbox,
            link,
            sink,
            metrics: None,
        }
    }

    /// Build a runtime from validated configuration.
    pub fn from_config(
        config: &GatewayConfig,
        link: Arc<dyn RadioLink>,
        sink: Arc<dyn EffectSink>,
        metrics: Option<GatewayMetrics>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let mut dispatcher =
            PacketDispatcher::from_config(config).context("invalid radio node list")?;
        if let Some(metrics) = metrics.clone() {
            dispatcher = dispatcher.with_metrics(metrics);
        }
        let mut runtime = Self::new(dispatcher, Inbox::from_config(&config.mail), link, sink);
        runtime.metrics = metrics;
        Ok(runtime)
    }

    pub fn dispatcher(&self) -> &PacketDispatcher {
        &self.dispatcher
    }

    /// Dispatch one frame, hand its effects to the sink and start any resends.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle_frame(&self, frame: &RadioFrame, now: Instant) -> Result<()> {
        let effects = self.dispatcher.dispatch(frame, now);
        for effect in &effects {
            if let Effect::Retransmit {
                address,
                command_bytes,
            } = effect
            {
                self.spawn_send(*address, command_bytes.clone());
            }
        }
        self.sink.emit_all(effects)?;
        Ok(())
    }

    fn spawn_send(&self, address: NodeAddress, bytes: Vec<u8>) {
        let link = self.link.clone();
        tokio::spawn(async move {
            if let Err(err) = link.send_data(address, bytes).await {
                warn!(node = %address, link = link.name(), error = %err, "failed to send command");
            }
        });
    }

    /// Decide what to do with an inbound mail and start execution when accepted.
    ///
    /// Execution runs on its own task; the decision is returned immediately so
    /// the mail session can send any reply.
    pub fn handle_mail(self: &Arc<Self>, mail: &InboundMail) -> MailDecision {
        let decision = self.inbox.evaluate(mail);
        let label = match &decision {
            MailDecision::Execute { .. } => "execute",
            MailDecision::Reply { .. } => "reply",
            MailDecision::Ignore { .. } => "ignore",
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_mail_decision(label);
        }

        if let MailDecision::Execute {
            commands,
            destinations,
        } = &decision
        {
            let runtime = self.clone();
            let commands = commands.clone();
            let destinations = destinations.clone();
            let message_id = mail.message_id.clone().unwrap_or_default();
            tokio::spawn(async move {
                match runtime.execute(&commands, &destinations).await {
                    Ok(sent) => info!(message_id = %message_id, sent, "mail commands executed"),
                    Err(err) => {
                        error!(message_id = %message_id, error = %err, "mail command execution failed")
                    }
                }
            });
        }
        decision
    }

    /// Send every command to every destination, returning the number of frames sent.
    pub async fn execute(
        &self,
        commands: &BTreeSet<CommandCode>,
        destinations: &Destinations,
    ) -> Result<usize> {
        let targets = self.resolve(destinations);
        if targets.is_empty() {
            warn!(?destinations, "no known nodes to send commands to");
            return Ok(0);
        }

        let mut sent = 0;
        for address in targets {
            for command in commands {
                if *command == CommandCode::CamTakePic {
                    let effects = self.dispatcher.prepare_capture(address, Instant::now());
                    if !effects.is_empty() {
                        self.sink.emit_all(effects)?;
                    }
                }
                debug!(node = %address, command = %command, "sending command");
                self.link.send_data(address, vec![command.code()]).await?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    fn resolve(&self, destinations: &Destinations) -> Vec<NodeAddress> {
        match destinations {
            Destinations::AllNodes => self.dispatcher.nodes(),
            Destinations::Nodes(nodes) => nodes
                .iter()
                .copied()
                .filter(|node| {
                    let known = self.dispatcher.is_known(*node);
                    if !known {
                        warn!(node = %node, "skipping unknown destination");
                    }
                    known
                })
                .collect(),
        }
    }

    /// Run the frame loop on its own task until shutdown or until the frame source closes.
    pub fn spawn(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<RadioFrame>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> GatewayHandle {
        let task = tokio::spawn(async move {
            let mut processed = 0usize;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("frame loop shutdown");
                        break;
                    }
                    frame = frames.recv() => {
                        let Some(frame) = frame else {
                            info!("frame source closed");
                            break;
                        };
                        processed += 1;
                        if let Err(err) = self.handle_frame(&frame, Instant::now()) {
                            error!(kind = frame.kind(), error = %err, "failed to deliver effects");
                        }
                    }
                }
            }
            processed
        });
        GatewayHandle { task }
    }
}

/// Handle to the spawned frame loop.
#[derive(Debug)]
pub struct GatewayHandle {
    task: JoinHandle<usize>,
}

impl GatewayHandle {
    /// Wait for the loop to finish and return how many frames it processed.
    pub async fn join(self) -> anyhow::Result<usize> {
        self.task.await.context("frame loop task failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use ugate_protocol::{DataFrame, ErrorFrame, InMemoryEffectSink, SoundKind};

    use crate::link::{LoopbackLink, SentFrame};

    const NODE: NodeAddress = NodeAddress::new(0x3333);

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.radio.nodes = vec!["3333".into(), "4444".into()];
        config.mail.allow_list = vec!["owner@example.com".into()];
        config
    }

    fn runtime(link: LoopbackLink, sink: InMemoryEffectSink) -> Arc<GatewayRuntime> {
        Arc::new(
            GatewayRuntime::from_config(&config(), Arc::new(link), Arc::new(sink), None)
                .expect("runtime builds"),
        )
    }

    fn image(bytes: &[u8]) -> RadioFrame {
        let mut payload = vec![29, 0, 1, 2, 3, 4, 5];
        payload.extend_from_slice(bytes);
        RadioFrame::Data(DataFrame::new(NODE, -50, payload))
    }

    async fn next_sent(rx: &mut mpsc::UnboundedReceiver<SentFrame>) -> SentFrame {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame sent in time")
            .expect("tap open")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frame_loop_emits_effects_until_source_closes() {
        let sink = InMemoryEffectSink::new();
        let runtime = runtime(LoopbackLink::new(), sink.clone());
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = runtime.spawn(rx, shutdown_rx);

        tx.send(RadioFrame::TxStatus {
            status: ugate_protocol::TxStatus::Success,
        })
        .await
        .expect("send frame");
        tx.send(image(&[0xFF, 0xD8, 0xFF, 0xD9]))
            .await
            .expect("send frame");
        drop(tx);

        assert_eq!(handle.join().await.expect("loop joins"), 2);
        let effects = sink.drain();
        assert_eq!(effects[0], Effect::PlaySound(SoundKind::Blip));
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::PersistImage { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_the_loop() {
        let runtime = runtime(LoopbackLink::new(), InMemoryEffectSink::new());
        let (_tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = runtime.spawn(rx, shutdown_rx);
        shutdown_tx.send(()).expect("signal shutdown");
        assert_eq!(handle.join().await.expect("loop joins"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn corrupted_transfer_resends_capture() {
        let (link, mut sent) = LoopbackLink::with_tap();
        let sink = InMemoryEffectSink::new();
        let runtime = runtime(link, sink.clone());
        let now = Instant::now();
        runtime.handle_frame(&image(&[0xFF, 0xD8]), now).expect("chunk");
        runtime
            .handle_frame(
                &RadioFrame::Error(ErrorFrame {
                    source: Some(NODE),
                    message: "crc".into(),
                    raw: Vec::new(),
                }),
                now,
            )
            .expect("error frame");
        runtime.handle_frame(&image(&[0xFF, 0xD9]), now).expect("last chunk");

        assert_eq!(
            next_sent(&mut sent).await,
            SentFrame {
                address: NODE,
                bytes: vec![29]
            }
        );
        assert!(sink
            .drain()
            .iter()
            .any(|effect| matches!(effect, Effect::Retransmit { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accepted_mail_executes_on_every_node() {
        let (link, mut sent) = LoopbackLink::with_tap();
        let runtime = runtime(link, InMemoryEffectSink::new());
        let decision = runtime.handle_mail(&InboundMail {
            message_id: Some("<7@example.com>".into()),
            from: vec!["owner@example.com".into()],
            subject: "Re: 59".into(),
            body: String::new(),
        });
        assert!(matches!(decision, MailDecision::Execute { .. }));

        let mut targets = vec![next_sent(&mut sent).await, next_sent(&mut sent).await];
        targets.sort_by_key(|frame| frame.address);
        assert_eq!(targets[0].address, NODE);
        assert_eq!(targets[1].address, NodeAddress::new(0x4444));
        assert!(targets.iter().all(|frame| frame.bytes == vec![59]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_mail_sends_nothing() {
        let link = LoopbackLink::new();
        let runtime = runtime(link.clone(), InMemoryEffectSink::new());
        let decision = runtime.handle_mail(&InboundMail {
            message_id: None,
            from: vec!["owner@example.com".into()],
            subject: String::new(),
            body: "29;12".into(),
        });
        assert_eq!(
            decision,
            MailDecision::Reply {
                to: vec!["owner@example.com".into()],
                body: "Invalid Command \"12\"\n".into(),
            }
        );
        tokio::task::yield_now().await;
        assert!(link.sent().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn execute_skips_unknown_destinations() {
        let link = LoopbackLink::new();
        let runtime = runtime(link.clone(), InMemoryEffectSink::new());
        let sent = runtime
            .execute(
                &BTreeSet::from([CommandCode::SensorGetReadings]),
                &Destinations::Nodes(BTreeSet::from([NODE, NodeAddress::new(0x9999)])),
            )
            .await
            .expect("execute");
        assert_eq!(sent, 1);
        assert_eq!(link.sent().await[0].address, NODE);
    }
}
