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

use serde::{Deserialize, Serialize};

/// Commands understood by the remote node firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CommandCode {
    /// Calibrate the laser against the servo positions.
    ServoLaserCalibrate = 11,
    /// Tilt the selected servo up.
    ServoTiltUp = 16,
    /// Tilt the selected servo down.
    ServoTiltDown = 17,
    /// Pan the selected servo to the right.
    ServoPanRight = 18,
    /// Pan the selected servo to the left.
    ServoPanLeft = 19,
    /// Reset the universal remote control session.
    IrRemoteSessionReset = 20,
    /// Turn the sensor alarms on and off.
    SensorAlarmToggle = 21,
    /// Take a picture at the configured resolution.
    CamTakePic = 29,
    /// Change the access PIN.
    AccessPinChange = 37,
    /// Toggle between the camera, sonar/IR and microwave servos.
    ServoToggleCamSonarIrMicrowave = 58,
    /// Toggle opening and closing the gate.
    GateToggleOpenClose = 59,
    /// Move the camera armature.
    ServoCamMove = 100,
    /// Move the sonar/PIR armature.
    ServoSonarPirMove = 101,
    /// Move the microwave armature.
    ServoMicrowaveMove = 102,
    /// Retrieve the current sensor readings.
    SensorGetReadings = 103,
    /// Retrieve all settings from the remote node.
    SensorGetSettings = 104,
    /// Push all settings to the remote node.
    SensorSetSettings = 105,
}

impl CommandCode {
    /// Every command in ascending code order.
    pub const ALL: [CommandCode; 17] = [
        CommandCode::ServoLaserCalibrate,
        CommandCode::ServoTiltUp,
        CommandCode::ServoTiltDown,
        CommandCode::ServoPanRight,
        CommandCode::ServoPanLeft,
        CommandCode::IrRemoteSessionReset,
        CommandCode::SensorAlarmToggle,
        CommandCode::CamTakePic,
        CommandCode::AccessPinChange,
        CommandCode::ServoToggleCamSonarIrMicrowave,
        CommandCode::GateToggleOpenClose,
        CommandCode::ServoCamMove,
        CommandCode::ServoSonarPirMove,
        CommandCode::ServoMicrowaveMove,
        CommandCode::SensorGetReadings,
        CommandCode::SensorGetSettings,
        CommandCode::SensorSetSettings,
    ];

    /// Look up a command by its numeric code.
    pub fn lookup(code: i64) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|command| i64::from(command.code()) == code)
    }

    /// Look up a command from the command byte of a radio payload.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::lookup(i64::from(byte))
    }

    /// Code recognized by the remote node.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// True when the node sends data back for this command.
    pub fn can_rx(self) -> bool {
        matches!(
            self,
            CommandCode::ServoLaserCalibrate
                | CommandCode::AccessPinChange
                | CommandCode::GateToggleOpenClose
                | CommandCode::SensorGetReadings
                | CommandCode::SensorGetSettings
        )
    }

    /// True when the gateway may transmit this command to a node.
    pub fn can_tx(self) -> bool {
        !matches!(
            self,
            CommandCode::SensorGetReadings | CommandCode::SensorGetSettings
        )
    }

    /// Number of data bytes that follow the command byte on transmission.
    pub fn data_bytes(self) -> usize {
        match self {
            CommandCode::ServoCamMove
            | CommandCode::ServoSonarPirMove
            | CommandCode::ServoMicrowaveMove => 2,
            CommandCode::SensorSetSettings => 35,
            _ => 0,
        }
    }

    /// Operator-facing description.
    pub fn description(self) -> &'static str {
        match self {
            CommandCode::ServoLaserCalibrate => "Calibrates the laser to the servo positions",
            CommandCode::ServoTiltUp => "Tilts the selected servo up",
            CommandCode::ServoTiltDown => "Tilts the selected servo down",
            CommandCode::ServoPanRight => "Pans the selected servo to the right",
            CommandCode::ServoPanLeft => "Pans the selected servo to the left",
            CommandCode::IrRemoteSessionReset => "Resets the universal remote control session",
            CommandCode::SensorAlarmToggle => "Turns the sensor alarms on and off",
            CommandCode::CamTakePic => "Takes a picture at a predefined resolution",
            CommandCode::AccessPinChange => "Changes the access code",
            CommandCode::ServoToggleCamSonarIrMicrowave => {
                "Toggle between the camera, sonar/IR and microwave servos"
            }
            CommandCode::GateToggleOpenClose => "Toggle opening and closing the gate (if applicable)",
            CommandCode::ServoCamMove => "Moves the camera (followed by a servo movement command)",
            CommandCode::ServoSonarPirMove => {
                "Moves the sonar/IR armature (followed by a servo movement command)"
            }
            CommandCode::ServoMicrowaveMove => {
                "Moves the microwave armature (followed by a servo movement command)"
            }
            CommandCode::SensorGetReadings => "Retrieves the current sensor readings",
            CommandCode::SensorGetSettings => "Gets all of the settings variables from the remote device",
            CommandCode::SensorSetSettings => "Sets all of the settings variables on the remote device",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_every_code() {
        for command in CommandCode::ALL {
            assert_eq!(CommandCode::lookup(i64::from(command.code())), Some(command));
            assert_eq!(CommandCode::from_byte(command.code()), Some(command));
        }
    }

    #[test]
    fn lookup_rejects_unknown_codes() {
        for code in [-1, 0, 12, 30, 99, 106, 255, 4096] {
            assert_eq!(CommandCode::lookup(code), None, "code {code}");
        }
    }

    #[test]
    fn table_constants() {
        assert_eq!(CommandCode::CamTakePic.code(), 29);
        assert_eq!(CommandCode::AccessPinChange.code(), 37);
        assert_eq!(CommandCode::SensorGetReadings.code(), 103);
        assert_eq!(CommandCode::SensorGetSettings.code(), 104);
        assert_eq!(CommandCode::SensorSetSettings.data_bytes(), 35);
        assert_eq!(CommandCode::ServoCamMove.data_bytes(), 2);
        assert!(!CommandCode::SensorGetReadings.can_tx());
        assert!(CommandCode::SensorGetReadings.can_rx());
        assert!(CommandCode::CamTakePic.can_tx());
    }

    #[test]
    fn codes_are_ascending() {
        let codes: Vec<u8> = CommandCode::ALL.iter().map(|c| c.code()).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        assert_eq!(codes, sorted);
        assert_eq!(
            CommandCode::CamTakePic.to_string(),
            "CamTakePic (29)"
        );
    }
}
