//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Remote node radio protocol model and positional decoders."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::frame::DataFrame;
use crate::{ProtocolLayout, Result};

const MICROWAVE_SCALE: u64 = 30_000;
const MILLIMETERS_DIVISOR: u64 = 2_105;
const INCHES_DIVISOR: u64 = 53_467;

/// Sensor readings reported by a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    sonar_feet: u32,
    sonar_inches: u32,
    microwave_cycle_count: u32,
    ir_feet: u32,
    ir_inches: u32,
}

impl SensorSnapshot {
    /// Build a snapshot from already decoded values.
    pub fn new(
        sonar_feet: u32,
        sonar_inches: u32,
        microwave_cycle_count: u32,
        ir_feet: u32,
        ir_inches: u32,
    ) -> Self {
        Self {
            sonar_feet,
            sonar_inches,
            microwave_cycle_count,
            ir_feet,
            ir_inches,
        }
    }

    /// Decode the five readings bytes starting at `layout.readings_offset`.
    ///
    /// Fails with [`crate::ProtocolError::MalformedFrame`] when the payload
    /// ends before the readings block does.
    pub fn decode(frame: &DataFrame, layout: &ProtocolLayout) -> Result<Self> {
        frame.require(layout.readings_end())?;
        let block = &frame.payload[layout.readings_offset..layout.readings_end()];
        Ok(Self::new(
            u32::from(block[0]),
            u32::from(block[1]),
            u32::from(block[2]),
            u32::from(block[3]),
            u32::from(block[4]),
        ))
    }

    /// Distance reported by the sonar, whole feet part.
    pub fn sonar_feet(&self) -> u32 {
        self.sonar_feet
    }

    /// Distance reported by the sonar, inches part.
    pub fn sonar_inches(&self) -> u32 {
        self.sonar_inches
    }

    /// Cycle changes clocked by the microwave sensor.
    pub fn microwave_cycle_count(&self) -> u32 {
        self.microwave_cycle_count
    }

    /// Distance reported by the infrared sensor, whole feet part.
    pub fn ir_feet(&self) -> u32 {
        self.ir_feet
    }

    /// Distance reported by the infrared sensor, inches part.
    pub fn ir_inches(&self) -> u32 {
        self.ir_inches
    }

    /// Microwave speed in millimetres per second (integer division).
    pub fn speed_millimeters_per_sec(&self) -> u64 {
        u64::from(self.microwave_cycle_count) * MICROWAVE_SCALE / MILLIMETERS_DIVISOR
    }

    /// Microwave speed in inches per second (integer division).
    pub fn speed_inches_per_sec(&self) -> u64 {
        u64::from(self.microwave_cycle_count) * MICROWAVE_SCALE / INCHES_DIVISOR
    }

    /// Microwave speed in miles per hour, scaled from the whole inches per second.
    pub fn speed_mph(&self) -> f64 {
        (self.speed_inches_per_sec() * MICROWAVE_SCALE / INCHES_DIVISOR) as f64
    }
}

/// Gate position trailing the readings block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Closed,
    Open,
}

impl GateState {
    /// Decode the byte right after the readings block.
    ///
    /// Older node firmware ends the frame at the readings block, so a missing
    /// byte is `None` rather than a malformed frame. Only `1` reads as open.
    pub fn decode(frame: &DataFrame, layout: &ProtocolLayout) -> Option<Self> {
        frame
            .payload
            .get(layout.readings_end())
            .map(|byte| if *byte == 1 { Self::Open } else { Self::Closed })
    }
}
