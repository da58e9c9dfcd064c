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
use crate::{ProtocolError, ProtocolLayout, Result};

/// Number of positional fields in a settings snapshot frame.
pub const SETTINGS_FIELD_COUNT: usize = 17;
/// Camera pan/tilt bytes that newer firmware appends after the trip mode.
pub const TRIP_ANGLE_FIELD_COUNT: usize = 6;

/// The three access keys of the gate keypad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKeys(pub [u8; 3]);

impl AccessKeys {
    /// Decode the keys from an access code change frame.
    pub fn decode(frame: &DataFrame, layout: &ProtocolLayout) -> Result<Self> {
        let start = layout.access_keys_offset;
        frame.require(start + 3)?;
        let p = &frame.payload;
        Ok(Self([p[start], p[start + 1], p[start + 2]]))
    }
}

/// Resolution the node's camera captures at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CameraResolution {
    /// 320x240.
    Qvga,
    /// 640x480.
    Vga,
}

/// Which sensors must trip together before the alarm is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiAlarmTrip {
    /// Any single tripped sensor raises the alarm.
    Any,
    /// Sonar and infrared must both trip.
    SonarAndIr,
    /// Sonar and microwave must both trip.
    SonarAndMicrowave,
    /// Infrared and microwave must both trip.
    IrAndMicrowave,
    /// Sonar, infrared and microwave must all trip.
    All,
}

/// On/off state of each alarm source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmStates {
    /// Sonar alarm armed.
    pub sonar: bool,
    /// Infrared alarm armed.
    pub ir: bool,
    /// Microwave alarm armed.
    pub microwave: bool,
    /// Gate alarm armed.
    pub gate: bool,
}

/// Distance threshold of a ranging sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceThreshold {
    /// Whole feet.
    pub feet: u8,
    /// Inches.
    pub inches: u8,
    /// Delay between trips.
    pub trip_delay: u8,
}

/// Microwave speed threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedThreshold {
    /// Cycles per second before tripping.
    pub cycles_per_sec: u8,
    /// Delay between trips.
    pub trip_delay: u8,
}

/// Servo position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanTilt {
    pub pan: u8,
    pub tilt: u8,
}

/// Where the camera points when each sensor trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripCameraAngles {
    pub sonar: PanTilt,
    pub ir: PanTilt,
    pub microwave: PanTilt,
}

/// Settings snapshot reported by a remote node in reply to a get-settings command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Keypad access keys.
    pub access_keys: AccessKeys,
    /// Camera resolution used when taking pictures.
    pub resolution: CameraResolution,
    /// Alarm arm states.
    pub alarms: AlarmStates,
    /// Sonar distance threshold.
    pub sonar: DistanceThreshold,
    /// Infrared distance threshold.
    pub ir: DistanceThreshold,
    /// Microwave speed threshold.
    pub microwave: SpeedThreshold,
    /// Multi-alarm trip mode.
    pub multi_alarm_trip: MultiAlarmTrip,
    /// Camera angles per tripped sensor; absent on firmware that stops at the trip mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_camera_angles: Option<TripCameraAngles>,
}

impl RemoteSettings {
    /// Decode the fixed sequence of fields starting at `layout.settings_offset`.
    ///
    /// Field order: access keys (3), resolution, sonar/IR/microwave/gate
    /// alarm flags, sonar feet/inches/delay, IR feet/inches/delay, microwave
    /// cycles/delay, multi-alarm trip mode. When the frame carries six more
    /// bytes they are the sonar, IR and microwave camera pan/tilt pairs.
    pub fn decode(frame: &DataFrame, layout: &ProtocolLayout) -> Result<Self> {
        let start = layout.settings_offset;
        frame.require(start + SETTINGS_FIELD_COUNT)?;
        let f = &frame.payload[start..start + SETTINGS_FIELD_COUNT];
        let command = frame.command_byte().unwrap_or_default();

        let resolution = match f[3] {
            0 => CameraResolution::Qvga,
            1 => CameraResolution::Vga,
            value => {
                return Err(ProtocolError::InvalidField {
                    command,
                    field: "resolution",
                    value,
                })
            }
        };
        let multi_alarm_trip = match f[16] {
            0 => MultiAlarmTrip::Any,
            1 => MultiAlarmTrip::SonarAndIr,
            2 => MultiAlarmTrip::SonarAndMicrowave,
            3 => MultiAlarmTrip::IrAndMicrowave,
            4 => MultiAlarmTrip::All,
            value => {
                return Err(ProtocolError::InvalidField {
                    command,
                    field: "multi_alarm_trip",
                    value,
                })
            }
        };

        Ok(Self {
            access_keys: AccessKeys([f[0], f[1], f[2]]),
            resolution,
            alarms: AlarmStates {
                sonar: f[4] != 0,
                ir: f[5] != 0,
                microwave: f[6] != 0,
                gate: f[7] != 0,
            },
            sonar: DistanceThreshold {
                feet: f[8],
                inches: f[9],
                trip_delay: f[10],
            },
            ir: DistanceThreshold {
                feet: f[11],
                inches: f[12],
                trip_delay: f[13],
            },
            microwave: SpeedThreshold {
                cycles_per_sec: f[14],
                trip_delay: f[15],
            },
            multi_alarm_trip,
            trip_camera_angles: trip_camera_angles(&frame.payload[start + SETTINGS_FIELD_COUNT..]),
        })
    }
}

fn trip_camera_angles(rest: &[u8]) -> Option<TripCameraAngles> {
    let a = rest.get(..TRIP_ANGLE_FIELD_COUNT)?;
    let pair = |i: usize| PanTilt {
        pan: a[i],
        tilt: a[i + 1],
    };
    Some(TripCameraAngles {
        sonar: pair(0),
        ir: pair(2),
        microwave: pair(4),
    })
}
