// Telemetry consumers: one task per sensor stream
//
// Each consumer waits a bounded time for a sample, renders it if its stream is
// switched on, and always hands the sample back to the pool. An empty poll is
// followed by a short sleep so a closed or idle subscription cannot busy-spin.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{BusError, Middleware, Sample, Subscription, SubscriptionMode};
use crate::config::{
    ENCODER_RATE_HZ, TOPIC_ENCODER1, TOPIC_ENCODER2, TOPIC_GPS, TOPIC_IMU, TOPIC_IMU_RAW,
    TOPIC_PROXIMITY, TOPIC_SERVO, TOPIC_TEXT,
};
use crate::messages::{Encoder, Encoder2, Gps, Imu, ImuRaw, Message, Proximity, Servo, Text};
use crate::session::{Session, Stream};

/// A message type a consumer can render
pub trait Telemetry: Send + Sync + 'static {
    /// Bus topic the stream arrives on
    const TOPIC: &'static str;
    /// Render flag gating this stream
    const STREAM: Stream;

    fn extract(msg: &Message) -> Option<&Self>;
    fn render(&self) -> String;
}

impl Telemetry for Encoder {
    const TOPIC: &'static str = TOPIC_ENCODER1;
    const STREAM: Stream = Stream::Encoder;

    fn extract(msg: &Message) -> Option<&Self> {
        match msg {
            Message::Encoder(m) => Some(m),
            _ => None,
        }
    }

    // rad/tick -> rad/s
    fn render(&self) -> String {
        format!("{:.6}", self.delta * ENCODER_RATE_HZ)
    }
}

impl Telemetry for Encoder2 {
    const TOPIC: &'static str = TOPIC_ENCODER2;
    const STREAM: Stream = Stream::Encoder;

    fn extract(msg: &Message) -> Option<&Self> {
        match msg {
            Message::Encoder2(m) => Some(m),
            _ => None,
        }
    }

    fn render(&self) -> String {
        format!("{:.6} {:.6}", self.delta[0], self.delta[1])
    }
}

impl Telemetry for Imu {
    const TOPIC: &'static str = TOPIC_IMU;
    const STREAM: Stream = Stream::Imu;

    fn extract(msg: &Message) -> Option<&Self> {
        match msg {
            Message::Imu(m) => Some(m),
            _ => None,
        }
    }

    fn render(&self) -> String {
        format!("{:.6} {:.6} {:.6}", self.roll, self.pitch, self.yaw)
    }
}

impl Telemetry for ImuRaw {
    const TOPIC: &'static str = TOPIC_IMU_RAW;
    const STREAM: Stream = Stream::ImuRaw;

    fn extract(msg: &Message) -> Option<&Self> {
        match msg {
            Message::ImuRaw(m) => Some(m),
            _ => None,
        }
    }

    fn render(&self) -> String {
        [
            self.acc_x,
            self.acc_y,
            self.acc_z,
            self.gyro_x,
            self.gyro_y,
            self.gyro_z,
            self.mag_x,
            self.mag_y,
            self.mag_z,
        ]
        .iter()
        .map(|v| format!("{:5}", v))
        .collect::<Vec<_>>()
        .join(" ")
    }
}

impl Telemetry for Proximity {
    const TOPIC: &'static str = TOPIC_PROXIMITY;
    const STREAM: Stream = Stream::Proximity;

    fn extract(msg: &Message) -> Option<&Self> {
        match msg {
            Message::Proximity(m) => Some(m),
            _ => None,
        }
    }

    fn render(&self) -> String {
        self.value.iter().map(|v| format!("{:5} ", v)).collect()
    }
}

impl Telemetry for Gps {
    const TOPIC: &'static str = TOPIC_GPS;
    const STREAM: Stream = Stream::Gps;

    fn extract(msg: &Message) -> Option<&Self> {
        match msg {
            Message::Gps(m) => Some(m),
            _ => None,
        }
    }

    fn render(&self) -> String {
        format!(
            "{} {} {:.6} {:.6}",
            self.valid as u8, self.satellites, self.latitude, self.longitude
        )
    }
}

impl Telemetry for Servo {
    const TOPIC: &'static str = TOPIC_SERVO;
    const STREAM: Stream = Stream::Servo;

    fn extract(msg: &Message) -> Option<&Self> {
        match msg {
            Message::Servo(m) => Some(m),
            _ => None,
        }
    }

    fn render(&self) -> String {
        self.pulse.iter().map(|v| format!("{:4} ", v)).collect()
    }
}

impl Telemetry for Text {
    const TOPIC: &'static str = TOPIC_TEXT;
    const STREAM: Stream = Stream::Text;

    fn extract(msg: &Message) -> Option<&Self> {
        match msg {
            Message::Text(m) => Some(m),
            _ => None,
        }
    }

    fn render(&self) -> String {
        self.data.clone()
    }
}

/// Consumer timing and queueing
#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    pub poll_timeout: Duration,
    pub backoff: Duration,
    pub depth: usize,
    pub mode: SubscriptionMode,
}

impl ConsumerConfig {
    pub fn with_mode(mut self, mode: SubscriptionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Where a consumer is in its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Waiting,
    Rendering,
    IdleBackoff,
}

enum State {
    Waiting,
    Rendering(Sample),
    IdleBackoff,
}

/// Bounded-wait consumer for one telemetry type
pub struct TelemetryConsumer<T> {
    subscription: Subscription,
    session: Arc<Session>,
    config: ConsumerConfig,
    state: State,
    _stream: std::marker::PhantomData<fn() -> T>,
}

impl<T: Telemetry> TelemetryConsumer<T> {
    pub fn new(bus: &Middleware, session: Arc<Session>, config: ConsumerConfig) -> Result<Self, BusError> {
        let subscription = bus.subscribe(T::TOPIC, config.depth, config.mode)?;
        Ok(Self {
            subscription,
            session,
            config,
            state: State::Waiting,
            _stream: std::marker::PhantomData,
        })
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Waiting => Phase::Waiting,
            State::Rendering(_) => Phase::Rendering,
            State::IdleBackoff => Phase::IdleBackoff,
        }
    }

    /// Advance one transition and return the phase entered
    pub async fn step(&mut self) -> Phase {
        self.state = match std::mem::replace(&mut self.state, State::Waiting) {
            State::Waiting => match self.subscription.poll(self.config.poll_timeout).await {
                Some(sample) => State::Rendering(sample),
                None => State::IdleBackoff,
            },
            State::Rendering(sample) => {
                self.render(&sample);
                sample.release();
                State::Waiting
            }
            State::IdleBackoff => {
                tokio::time::sleep(self.config.backoff).await;
                State::Waiting
            }
        };
        self.phase()
    }

    fn render(&self, sample: &Sample) {
        if !self.session.is_enabled(T::STREAM) {
            return;
        }
        match T::extract(sample.message()) {
            Some(msg) => self.session.emit(&msg.render()),
            None => warn!(
                "Unexpected {} message on {}",
                sample.message().kind(),
                sample.topic()
            ),
        }
    }

    /// Loop until the process exits
    pub async fn run(mut self) {
        debug!("Telemetry consumer on {} started ({:?})", T::TOPIC, self.subscription.mode());
        loop {
            self.step().await;
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Start consumers for every telemetry stream, named after their topic
///
/// Orientation uses the latest-value mode, the rest are queued.
pub fn spawn_all(
    bus: &Middleware,
    session: &Arc<Session>,
    config: ConsumerConfig,
) -> Result<Vec<(String, JoinHandle<()>)>, BusError> {
    fn start<T: Telemetry>(
        bus: &Middleware,
        session: &Arc<Session>,
        config: ConsumerConfig,
    ) -> Result<(String, JoinHandle<()>), BusError> {
        let consumer = TelemetryConsumer::<T>::new(bus, session.clone(), config)?;
        Ok((format!("telemetry/{}", T::TOPIC), consumer.spawn()))
    }

    let latest = config.with_mode(SubscriptionMode::Latest);
    Ok(vec![
        start::<Encoder>(bus, session, config)?,
        start::<Encoder2>(bus, session, config)?,
        start::<Imu>(bus, session, latest)?,
        start::<ImuRaw>(bus, session, config)?,
        start::<Proximity>(bus, session, config)?,
        start::<Gps>(bus, session, config)?,
        start::<Servo>(bus, session, config)?,
        start::<Text>(bus, session, config)?,
    ])
}
