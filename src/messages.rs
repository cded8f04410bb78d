// Message types carried on the bus
//
// Every message travels as one `Message` variant so the transport bridge can
// relay any topic as JSON without knowing its type up front.

use serde::{Deserialize, Serialize};

/// Differential wheel setpoints [rad/s], published on `speed2`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Speed2 {
    pub value: [f32; 2],
}

/// Omni wheel setpoints [rad/s], published on `speed3`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Speed3 {
    pub value: [i16; 3],
}

/// Body velocity (x, y [m/s], w [rad/s]); used for `velocity` and `odometry`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity3 {
    pub x: f32,
    pub y: f32,
    pub w: f32,
}

/// PID tuning for one control loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub k: f32,
    pub ti: f32,
    pub td: f32,
}

/// Single wheel encoder delta [rad/tick]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Encoder {
    pub delta: f32,
}

/// Two wheel encoder deltas [rad/tick]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Encoder2 {
    pub delta: [f32; 2],
}

/// Fused orientation [deg]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Imu {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// Raw 9-axis IMU counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuRaw {
    pub acc_x: i16,
    pub acc_y: i16,
    pub acc_z: i16,
    pub gyro_x: i16,
    pub gyro_y: i16,
    pub gyro_z: i16,
    pub mag_x: i16,
    pub mag_y: i16,
    pub mag_z: i16,
}

/// Eight proximity sensor readings
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Proximity {
    pub value: [u16; 8],
}

/// GPS fix
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Gps {
    pub valid: bool,
    pub satellites: u8,
    pub latitude: f32,
    pub longitude: f32,
}

/// Eight RC servo pulse widths [us]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Servo {
    pub pulse: [u16; 8],
}

/// Free-form text line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub data: String,
}

/// Any message the bus can carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Speed2(Speed2),
    Speed3(Speed3),
    Velocity3(Velocity3),
    PidConfig(PidConfig),
    Encoder(Encoder),
    Encoder2(Encoder2),
    Imu(Imu),
    ImuRaw(ImuRaw),
    Proximity(Proximity),
    Gps(Gps),
    Servo(Servo),
    Text(Text),
}

impl Message {
    /// Short type name, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Speed2(_) => "speed2",
            Message::Speed3(_) => "speed3",
            Message::Velocity3(_) => "velocity3",
            Message::PidConfig(_) => "pid_config",
            Message::Encoder(_) => "encoder",
            Message::Encoder2(_) => "encoder2",
            Message::Imu(_) => "imu",
            Message::ImuRaw(_) => "imu_raw",
            Message::Proximity(_) => "proximity",
            Message::Gps(_) => "gps",
            Message::Servo(_) => "servo",
            Message::Text(_) => "text",
        }
    }
}

// Host-side (ROS style) payloads accepted by the bridge

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Vector3 {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

/// geometry_msgs/Twist
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Twist {
    #[serde(default)]
    pub linear: Vector3,
    #[serde(default)]
    pub angular: Vector3,
}

// A twist maps onto the body velocity pass-through
impl From<&Twist> for Velocity3 {
    fn from(twist: &Twist) -> Self {
        Self {
            x: twist.linear.x as f32,
            y: twist.linear.y as f32,
            w: twist.angular.z as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_is_tagged() {
        let msg = Message::PidConfig(PidConfig {
            k: 1.5,
            ti: 0.2,
            td: 0.01,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"pid_config\""), "{}", json);

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_twist_with_missing_fields() {
        let twist: Twist = serde_json::from_str(r#"{"linear":{"x":0.5},"angular":{"z":-1.0}}"#).unwrap();
        let vel = Velocity3::from(&twist);
        assert_eq!(vel, Velocity3 { x: 0.5, y: 0.0, w: -1.0 });
    }
}
