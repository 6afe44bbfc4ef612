use serde::{Deserialize, Serialize};

/// A 4-axis stick input in `[-1.0, 1.0]` per component.
///
/// Wire order is `(X, Y, Z, R)`; the drone supervisor swaps X/Y before
/// handing the vector to the driver (see `DroneCommand::Vector` usage).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r: f64,
}

impl MotionVector {
    pub const ZERO: MotionVector = MotionVector { x: 0.0, y: 0.0, z: 0.0, r: 0.0 };

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0 && self.r == 0.0
    }
}

/// Commands queued onto the coordinator's `Commands` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum DroneCommand {
    Takeoff,
    Land,
    Vector(MotionVector),
}

/// Payload of a data-channel message from the primary browser peer:
/// `{"command": {"x":..,"y":..,"z":..,"r":..}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct DataChannelCommand {
    pub command: MotionVector,
}

/// A message the supervisor/RTC handler pushes out on the primary data channel,
/// wrapped on the wire as `{"messageType": "<text>"}`.
#[derive(Debug, Clone, Serialize)]
pub struct DataChannelNotice {
    #[serde(rename = "messageType")]
    pub message_type: String,
}

impl DataChannelNotice {
    pub fn new(text: impl Into<String>) -> Self {
        Self { message_type: text.into() }
    }
}

/// Step table mapping `ReceiverEstimatedMaximumBitrate` to an encoder rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderRate {
    #[serde(rename = "1M")]
    R1_0,
    #[serde(rename = "1.5M")]
    R1_5,
    #[serde(rename = "2M")]
    R2_0,
    #[serde(rename = "3M")]
    R3_0,
    #[serde(rename = "4M")]
    R4_0,
}

impl EncoderRate {
    /// Map a REMB estimate in Mb/s to the nearest rate at or below it,
    /// falling back to the lowest rate. Monotone non-decreasing in `mbps`.
    pub fn from_remb_mbps(mbps: f64) -> Self {
        if mbps >= 4.0 {
            EncoderRate::R4_0
        } else if mbps >= 3.0 {
            EncoderRate::R3_0
        } else if mbps >= 2.0 {
            EncoderRate::R2_0
        } else if mbps >= 1.5 {
            EncoderRate::R1_5
        } else {
            EncoderRate::R1_0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_vector_zero_predicate() {
        assert!(MotionVector::ZERO.is_zero());
        assert!(MotionVector { x: 0.0, y: 0.0, z: 0.0, r: 0.0 }.is_zero());
        assert!(!MotionVector { x: 0.1, y: 0.0, z: 0.0, r: 0.0 }.is_zero());
    }

    #[test]
    fn drone_command_vector_roundtrip() {
        let cmd = DroneCommand::Vector(MotionVector { x: 0.5, y: -0.5, z: 0.0, r: 0.0 });
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: DroneCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, parsed);
    }

    #[test]
    fn data_channel_command_parses_browser_shape() {
        let json = r#"{"command":{"x":0.2,"y":-0.3,"z":0.0,"r":1.0}}"#;
        let parsed: DataChannelCommand = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.command.x, 0.2);
        assert_eq!(parsed.command.r, 1.0);
    }

    #[test]
    fn data_channel_notice_wraps_text() {
        let notice = DataChannelNotice::new("takeoff");
        let json = serde_json::to_string(&notice).unwrap();
        assert_eq!(json, r#"{"messageType":"takeoff"}"#);
    }

    #[test]
    fn bitrate_mapping_monotone_and_exact() {
        assert_eq!(EncoderRate::from_remb_mbps(5.0), EncoderRate::R4_0);
        assert_eq!(EncoderRate::from_remb_mbps(3.5), EncoderRate::R3_0);
        assert_eq!(EncoderRate::from_remb_mbps(1.2), EncoderRate::R1_0);
        assert_eq!(EncoderRate::from_remb_mbps(2.0), EncoderRate::R2_0);
        assert_eq!(EncoderRate::from_remb_mbps(1.5), EncoderRate::R1_5);

        let samples = [0.0, 0.9, 1.0, 1.5, 1.9, 2.0, 2.9, 3.0, 3.9, 4.0, 10.0];
        let rank = |r: EncoderRate| match r {
            EncoderRate::R1_0 => 0,
            EncoderRate::R1_5 => 1,
            EncoderRate::R2_0 => 2,
            EncoderRate::R3_0 => 3,
            EncoderRate::R4_0 => 4,
        };
        let mut prev = 0;
        for &mbps in &samples {
            let r = rank(EncoderRate::from_remb_mbps(mbps));
            assert!(r >= prev, "rate regressed at {mbps} Mb/s");
            prev = r;
        }
    }
}
