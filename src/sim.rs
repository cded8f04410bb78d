// In-process simulator
//
// Reads the latest wheel setpoints and answers with the telemetry a real base
// would produce: encoder deltas, orientation, odometry and slow-moving
// proximity/GPS/servo readings.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use crate::binding::TopicBinding;
use crate::bus::{BusError, Middleware, Subscription, SubscriptionMode};
use crate::config::{
    TOPIC_ENCODER1, TOPIC_ENCODER2, TOPIC_GPS, TOPIC_IMU, TOPIC_IMU_RAW, TOPIC_ODOMETRY, TOPIC_PROXIMITY,
    TOPIC_SERVO, TOPIC_SPEED2, TOPIC_SPEED3,
};
use crate::kinematics::{DriveParams, Topology, WheelSetpoint};
use crate::messages::{Encoder, Encoder2, Gps, Imu, ImuRaw, Message, Proximity, Servo, Speed2, Speed3, Velocity3};

// Ticks between the slow sensor readings
const PROXIMITY_EVERY: u64 = 5;
const SERVO_EVERY: u64 = 5;
const GPS_EVERY: u64 = 50;

// Gyro LSB per rad/s
const GYRO_SCALE: f32 = 938.7;

/// Kinematic model of the base, advanced one tick at a time
#[derive(Debug, Clone)]
pub struct Plant {
    differential: DriveParams,
    omni: DriveParams,
    dt: f32,
    wheels: WheelSetpoint,
    yaw: f32,
    tick: u64,
}

impl Plant {
    pub fn new(differential: DriveParams, omni: DriveParams, rate_hz: f32) -> Self {
        Self {
            differential,
            omni,
            dt: 1.0 / rate_hz,
            wheels: WheelSetpoint::zero(Topology::Differential),
            yaw: 0.0,
            tick: 0,
        }
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    /// Wheels follow the setpoint instantly
    pub fn apply(&mut self, setpoint: WheelSetpoint) {
        self.wheels = setpoint;
    }

    /// Body velocity implied by the current wheel speeds
    pub fn body_velocity(&self) -> Velocity3 {
        match self.wheels {
            WheelSetpoint::Differential([left, right]) => {
                let r = self.differential.wheel_radius;
                Velocity3 {
                    x: r * (left - right) / 2.0,
                    y: 0.0,
                    w: r * (left + right) / self.differential.wheel_distance,
                }
            }
            WheelSetpoint::Omni(wheels) => {
                let r = self.omni.wheel_radius;
                let [w1, w2, w3] = wheels.map(f32::from);
                Velocity3 {
                    x: r * (w1 + w2 - 2.0 * w3) / 3.0,
                    y: r * (w2 - w1) / 3.0_f32.sqrt(),
                    w: -(r / self.omni.wheel_distance) * (w1 + w2 + w3) / 3.0,
                }
            }
        }
    }

    fn wheel_deltas(&self) -> [f32; 2] {
        match self.wheels {
            WheelSetpoint::Differential(speeds) => speeds.map(|dth| dth * self.dt),
            WheelSetpoint::Omni([w1, w2, _]) => [f32::from(w1) * self.dt, f32::from(w2) * self.dt],
        }
    }

    /// Advance one tick and return what the sensors report
    pub fn advance(&mut self) -> Vec<(&'static str, Message)> {
        let velocity = self.body_velocity();
        self.yaw = wrap_angle(self.yaw + velocity.w * self.dt);
        self.tick += 1;

        let [left, right] = self.wheel_deltas();
        let mut out = vec![
            (TOPIC_ENCODER1, Message::Encoder(Encoder { delta: left })),
            (TOPIC_ENCODER2, Message::Encoder2(Encoder2 { delta: [left, right] })),
            (
                TOPIC_IMU,
                Message::Imu(Imu {
                    roll: 0.0,
                    pitch: 0.0,
                    yaw: self.yaw,
                }),
            ),
            (
                TOPIC_IMU_RAW,
                Message::ImuRaw(ImuRaw {
                    acc_z: 16384,
                    gyro_z: (velocity.w * GYRO_SCALE) as i16,
                    ..ImuRaw::default()
                }),
            ),
            (TOPIC_ODOMETRY, Message::Velocity3(velocity)),
        ];

        if self.tick % PROXIMITY_EVERY == 0 {
            out.push((TOPIC_PROXIMITY, Message::Proximity(Proximity { value: [1000; 8] })));
        }
        if self.tick % SERVO_EVERY == 0 {
            out.push((TOPIC_SERVO, Message::Servo(Servo { pulse: [1500; 8] })));
        }
        if self.tick % GPS_EVERY == 0 {
            out.push((
                TOPIC_GPS,
                Message::Gps(Gps {
                    valid: true,
                    satellites: 7,
                    latitude: 45.4781,
                    longitude: 9.2273,
                }),
            ));
        }
        out
    }
}

fn wrap_angle(angle: f32) -> f32 {
    use std::f32::consts::PI;
    (angle + PI).rem_euclid(2.0 * PI) - PI
}

/// Drives a `Plant` from the bus at a fixed rate
pub struct Simulator {
    bus: Middleware,
    plant: Plant,
    period: Duration,
    speed2: Subscription,
    speed3: Subscription,
    outputs: HashMap<&'static str, TopicBinding>,
}

impl Simulator {
    pub fn new(bus: &Middleware, plant: Plant, period: Duration) -> Result<Self, BusError> {
        Ok(Self {
            speed2: bus.subscribe(TOPIC_SPEED2, 1, SubscriptionMode::Latest)?,
            speed3: bus.subscribe(TOPIC_SPEED3, 1, SubscriptionMode::Latest)?,
            bus: bus.clone(),
            plant,
            period,
            outputs: HashMap::new(),
        })
    }

    /// Pick up new setpoints, advance the plant and publish its readings
    pub fn tick(&mut self) {
        for subscription in [&mut self.speed2, &mut self.speed3] {
            if let Some(sample) = subscription.try_fetch() {
                match *sample.message() {
                    Message::Speed2(Speed2 { value }) => self.plant.apply(WheelSetpoint::Differential(value)),
                    Message::Speed3(Speed3 { value }) => self.plant.apply(WheelSetpoint::Omni(value)),
                    ref other => warn!("Simulator ignored {} on {}", other.kind(), sample.topic()),
                }
                sample.release();
            }
        }

        for (topic, message) in self.plant.advance() {
            let binding = self
                .outputs
                .entry(topic)
                .or_insert_with(|| TopicBinding::new(self.bus.clone(), topic));
            if let Err(e) = binding.send(message) {
                warn!("Simulator publish on {} failed: {}", topic, e);
            }
        }
    }

    pub async fn run(mut self) {
        info!("Simulator running every {}ms", self.period.as_millis());
        let mut tick = interval(self.period);
        loop {
            tick.tick().await;
            self.tick();
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
