//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Offline replay of recorded radio frames."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;
use ugate_protocol::{EffectSink, NodeAddress, RadioFrame};

use crate::dispatcher::PacketDispatcher;
use crate::{GatewayError, Result};

/// One line of a replay file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    /// Time elapsed since the previous record.
    #[serde(default)]
    pub delay_ms: Option<u64>,
    pub frame: RadioFrame,
}

/// Replay frames from a newline-delimited JSON file.
///
/// See [`replay_from_reader`].
pub fn replay_from_file<P: AsRef<Path>>(
    dispatcher: &PacketDispatcher,
    sink: &dyn EffectSink,
    path: P,
    source: Option<NodeAddress>,
) -> Result<usize> {
    let file = File::open(path)?;
    replay_from_reader(dispatcher, sink, BufReader::new(file), source)
}

/// Feed every record through the dispatcher and emit the effects to `sink`.
///
/// Delays advance a simulated clock instead of sleeping, so a recorded stall
/// of several minutes replays instantly and still trips the transfer timeout.
/// With `source` set, data frames from other nodes are skipped. Returns the
/// number of frames dispatched.
pub fn replay_from_reader<R: BufRead>(
    dispatcher: &PacketDispatcher,
    sink: &dyn EffectSink,
    reader: R,
    source: Option<NodeAddress>,
) -> Result<usize> {
    let start = Instant::now();
    let mut offset = Duration::ZERO;
    let mut count = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord =
            serde_json::from_str(&line).map_err(|source| GatewayError::Replay {
                line: index + 1,
                source,
            })?;
        if let Some(delay) = record.delay_ms {
            offset += Duration::from_millis(delay);
        }
        if let (Some(wanted), RadioFrame::Data(data)) = (source, &record.frame) {
            if data.source != wanted {
                debug!(node = %data.source, "skipping frame from other node");
                continue;
            }
        }
        sink.emit_all(dispatcher.dispatch(&record.frame, start + offset))?;
        count += 1;
    }

    Ok(count)
}
