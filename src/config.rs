// Timeouts, topics, robot geometry and command-line overrides
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::kinematics::{DriveParams, Topology};

// Name this module announces itself with on the bus
pub const MODULE_NAME: &str = "uDC";

// Telemetry consumer timing
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1000);
pub const IDLE_BACKOFF: Duration = Duration::from_millis(1);

// Subscriber queue depth and message pool size per topic
pub const QUEUE_DEPTH: usize = 5;
pub const POOL_SIZE: usize = 16;

// Encoder sample rate (deltas are published once per tick)
pub const ENCODER_RATE_HZ: f32 = 50.0;

// Bridge republish period for the latest host-bound samples
pub const BRIDGE_PERIOD: Duration = Duration::from_millis(50);

// Differential drive geometry
pub const DIFF_WHEEL_DISTANCE: f32 = 0.400; // m
pub const DIFF_WHEEL_RADIUS: f32 = 0.05; // m

// Omnidirectional (three wheel) geometry
pub const OMNI_WHEEL_DISTANCE: f32 = 0.160; // m
pub const OMNI_WHEEL_RADIUS: f32 = 0.035; // m
pub const OMNI_MAX_DTH: f32 = 52.0; // rad/s

// Bus topics: setpoints and configuration (outbound)
pub const TOPIC_SPEED2: &str = "speed2";
pub const TOPIC_SPEED3: &str = "speed3";
pub const TOPIC_VELOCITY: &str = "velocity";
pub const TOPIC_PIDCFG: &str = "pidcfg";
pub const TOPIC_BALCFG: &str = "balcfg";
pub const TOPIC_VELCFG: &str = "velcfg";

// Bus topics: telemetry (inbound)
pub const TOPIC_ENCODER1: &str = "encoder1";
pub const TOPIC_ENCODER2: &str = "encoder2";
pub const TOPIC_IMU: &str = "imu";
pub const TOPIC_IMU_RAW: &str = "imu_raw";
pub const TOPIC_PROXIMITY: &str = "proximity";
pub const TOPIC_GPS: &str = "gps";
pub const TOPIC_SERVO: &str = "rcin";
pub const TOPIC_TEXT: &str = "test";
pub const TOPIC_ODOMETRY: &str = "odometry";

pub const EXPORTED_TOPICS: [&str; 6] = [
    TOPIC_SPEED2,
    TOPIC_SPEED3,
    TOPIC_VELOCITY,
    TOPIC_PIDCFG,
    TOPIC_BALCFG,
    TOPIC_VELCFG,
];

pub const IMPORTED_TOPICS: [&str; 9] = [
    TOPIC_ENCODER1,
    TOPIC_ENCODER2,
    TOPIC_IMU,
    TOPIC_IMU_RAW,
    TOPIC_PROXIMITY,
    TOPIC_GPS,
    TOPIC_SERVO,
    TOPIC_TEXT,
    TOPIC_ODOMETRY,
];

// Latest values the bridge streams to the host at a fixed rate
pub const REPUBLISHED_TOPICS: [&str; 3] = [TOPIC_IMU, TOPIC_IMU_RAW, TOPIC_ODOMETRY];

// Zenoh key prefix
pub const DEFAULT_KEY_PREFIX: &str = "robot";

// Serial shell
pub const DEFAULT_SERIAL_BAUDRATE: u32 = 115_200;
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);
pub const SHELL_MAX_LINE: usize = 128;

/// Drivetrain selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriveKind {
    Differential,
    Omni,
}

impl From<DriveKind> for Topology {
    fn from(kind: DriveKind) -> Self {
        match kind {
            DriveKind::Differential => Topology::Differential,
            DriveKind::Omni => Topology::Omni,
        }
    }
}

/// Motion console: drive commands in, telemetry out
#[derive(Debug, Clone, Parser)]
#[command(name = "motion-console", version, about)]
pub struct Args {
    /// Drivetrain the stop command targets
    #[arg(long, value_enum, default_value_t = DriveKind::Differential)]
    pub topology: DriveKind,

    /// Differential wheel distance [m]
    #[arg(long, default_value_t = DIFF_WHEEL_DISTANCE)]
    pub diff_wheel_distance: f32,

    /// Differential wheel radius [m]
    #[arg(long, default_value_t = DIFF_WHEEL_RADIUS)]
    pub diff_wheel_radius: f32,

    /// Omni wheel distance from the center [m]
    #[arg(long, default_value_t = OMNI_WHEEL_DISTANCE)]
    pub omni_wheel_distance: f32,

    /// Omni wheel radius [m]
    #[arg(long, default_value_t = OMNI_WHEEL_RADIUS)]
    pub omni_wheel_radius: f32,

    /// Omni wheel angular speed limit [rad/s]
    #[arg(long, default_value_t = OMNI_MAX_DTH, value_parser = parse_speed_limit)]
    pub max_wheel_speed: f32,

    /// Message slots per topic
    #[arg(long, default_value_t = POOL_SIZE)]
    pub pool_size: usize,

    /// Subscriber queue depth
    #[arg(long, default_value_t = QUEUE_DEPTH)]
    pub queue_depth: usize,

    /// Telemetry poll timeout [ms]
    #[arg(long, default_value_t = POLL_TIMEOUT.as_millis() as u64)]
    pub poll_timeout_ms: u64,

    /// Sleep after an empty poll [ms]
    #[arg(long, default_value_t = IDLE_BACKOFF.as_millis() as u64)]
    pub backoff_ms: u64,

    /// Do not open the zenoh bridge
    #[arg(long)]
    pub no_bridge: bool,

    /// Zenoh key prefix
    #[arg(long, default_value = DEFAULT_KEY_PREFIX)]
    pub key_prefix: String,

    /// Serial port for a second command shell
    #[arg(long)]
    pub serial: Option<String>,

    /// Serial shell baudrate
    #[arg(long, default_value_t = DEFAULT_SERIAL_BAUDRATE)]
    pub baudrate: u32,

    /// Run the in-process robot simulator
    #[arg(long)]
    pub simulate: bool,
}

/// Speed limits must be finite and non-negative
fn parse_speed_limit(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|e| format!("{}", e))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("'{}' is not a finite, non-negative speed", s));
    }
    Ok(value)
}

impl Args {
    pub fn differential(&self) -> DriveParams {
        DriveParams::new(self.diff_wheel_distance, self.diff_wheel_radius)
    }

    pub fn omni(&self) -> DriveParams {
        DriveParams::new(self.omni_wheel_distance, self.omni_wheel_radius)
            .with_max_wheel_speed(self.max_wheel_speed)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}
