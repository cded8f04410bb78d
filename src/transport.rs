// Zenoh bridge
//
// Relays local command topics out to `<prefix>/<topic>`, brings telemetry in
// from the same keys, takes host inputs (cmd_vel, PID gains) from
// `<prefix>/ros/...`, streams the latest pose samples back to the host and
// serves a remote shell on `<prefix>/shell/{in,out}`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::binding::{BindingError, PublishOutcome, TopicBinding};
use crate::bus::{BusError, Middleware, Origin, Sample, SubscriptionMode};
use crate::config::{EXPORTED_TOPICS, IMPORTED_TOPICS, REPUBLISHED_TOPICS};
use crate::dispatcher::ControlLoop;
use crate::messages::{Message, PidConfig, Twist, Velocity3};
use crate::session::Sink;
use crate::shell::{self, SharedDispatcher};

/// Error types for the bridge
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Zenoh error: {0}")]
    Zenoh(zenoh::Error),

    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Binding(#[from] BindingError),
}

impl From<zenoh::Error> for TransportError {
    fn from(e: zenoh::Error) -> Self {
        TransportError::Zenoh(e)
    }
}

/// Where and how fast the bridge relays
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub prefix: String,
    pub depth: usize,
    pub poll_timeout: Duration,
    pub period: Duration,
}

impl BridgeConfig {
    /// Key a bus topic is relayed on
    pub fn topic_key(&self, topic: &str) -> String {
        format!("{}/{}", self.prefix, topic)
    }

    /// Key of a host-side (ROS style) topic
    pub fn host_key(&self, topic: &str) -> String {
        format!("{}/ros/{}", self.prefix, topic)
    }

    pub fn shell_in_key(&self) -> String {
        format!("{}/shell/in", self.prefix)
    }

    pub fn shell_out_key(&self) -> String {
        format!("{}/shell/out", self.prefix)
    }
}

/// Host inputs and what they drive locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostInput {
    CmdVel,
    BalanceConfig,
    VelocityConfig,
}

impl HostInput {
    pub const ALL: [HostInput; 3] = [HostInput::CmdVel, HostInput::BalanceConfig, HostInput::VelocityConfig];

    pub fn topic(self) -> &'static str {
        match self {
            HostInput::CmdVel => "cmd_vel",
            HostInput::BalanceConfig => "balcfg",
            HostInput::VelocityConfig => "velcfg",
        }
    }
}

/// Decode a host payload and hand it to the dispatcher
pub fn apply_host_input(
    dispatcher: &SharedDispatcher,
    input: HostInput,
    payload: &[u8],
) -> Result<PublishOutcome, TransportError> {
    let mut dispatcher = dispatcher.lock().unwrap_or_else(|e| e.into_inner());
    let outcome = match input {
        HostInput::CmdVel => {
            let twist: Twist = serde_json::from_slice(payload)?;
            dispatcher.forward_velocity(Velocity3::from(&twist))?
        }
        HostInput::BalanceConfig => {
            let cfg: PidConfig = serde_json::from_slice(payload)?;
            dispatcher.configure(ControlLoop::Balance, cfg)?
        }
        HostInput::VelocityConfig => {
            let cfg: PidConfig = serde_json::from_slice(payload)?;
            dispatcher.configure(ControlLoop::Velocity, cfg)?
        }
    };
    Ok(outcome)
}

/// JSON for a locally produced sample; relayed samples are not sent back
pub fn export_payload(sample: &Sample) -> Result<Option<String>, TransportError> {
    if sample.origin() == Origin::Remote {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(sample.message())?))
}

/// Publish a relayed payload on the local bus, flagged as remote
pub fn import_payload(binding: &mut TopicBinding, payload: &[u8]) -> Result<PublishOutcome, TransportError> {
    let message: Message = serde_json::from_slice(payload)?;
    Ok(binding.gated_publish(message, |slot| slot.mark_remote())?)
}

/// Shell replies queued for the bridge
pub struct BridgeSink {
    tx: mpsc::UnboundedSender<String>,
}

impl BridgeSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Sink for BridgeSink {
    fn write_line(&self, line: &str) {
        // Receiver is gone only during shutdown
        let _ = self.tx.send(line.to_string());
    }
}

/// Running bridge; dropping it leaves the tasks running, call `close`
pub struct Bridge {
    session: zenoh::Session,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Bridge {
    pub async fn start(
        bus: Middleware,
        dispatcher: SharedDispatcher,
        config: BridgeConfig,
    ) -> Result<Self, TransportError> {
        info!("Opening Zenoh session...");
        let session = zenoh::open(zenoh::Config::default()).await?;
        let mut tasks = Vec::new();

        for topic in EXPORTED_TOPICS {
            let task = spawn_export(&session, &bus, &config, topic)?;
            tasks.push((format!("bridge/export/{}", topic), task));
        }
        for topic in IMPORTED_TOPICS {
            let task = spawn_import(&session, &bus, &config, topic).await?;
            tasks.push((format!("bridge/import/{}", topic), task));
        }
        for input in HostInput::ALL {
            let task = spawn_host_input(&session, &dispatcher, &config, input).await?;
            tasks.push((format!("bridge/ros/{}", input.topic()), task));
        }
        let republisher = spawn_republisher(&session, &bus, &config)?;
        tasks.push(("bridge/republish".to_string(), republisher));
        let [reader, writer] = spawn_remote_shell(&session, &dispatcher, &config).await?;
        tasks.push(("bridge/shell/in".to_string(), reader));
        tasks.push(("bridge/shell/out".to_string(), writer));

        info!(
            "Bridge started on '{}': {} exported, {} imported, republishing every {}ms",
            config.prefix,
            EXPORTED_TOPICS.len(),
            IMPORTED_TOPICS.len(),
            config.period.as_millis()
        );
        Ok(Self { session, tasks })
    }

    /// Bridge links by name, for the task listing
    pub fn tasks(&self) -> impl Iterator<Item = (&str, &JoinHandle<()>)> {
        self.tasks.iter().map(|(name, task)| (name.as_str(), task))
    }

    pub async fn close(self) -> Result<(), TransportError> {
        for (_, task) in &self.tasks {
            task.abort();
        }
        self.session.close().await?;
        info!("Bridge closed");
        Ok(())
    }
}

fn spawn_export(
    session: &zenoh::Session,
    bus: &Middleware,
    config: &BridgeConfig,
    topic: &str,
) -> Result<JoinHandle<()>, TransportError> {
    let mut subscription = bus.subscribe(topic, config.depth, SubscriptionMode::Queued)?;
    let session = session.clone();
    let key = config.topic_key(topic);
    let poll_timeout = config.poll_timeout;

    Ok(tokio::spawn(async move {
        loop {
            let Some(sample) = subscription.poll(poll_timeout).await else {
                continue;
            };
            let payload = export_payload(&sample);
            sample.release();
            match payload {
                Ok(Some(json)) => {
                    if let Err(e) = session.put(key.as_str(), json).await {
                        warn!("Export to {} failed: {}", key, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Export to {} failed: {}", key, e),
            }
        }
    }))
}

async fn spawn_import(
    session: &zenoh::Session,
    bus: &Middleware,
    config: &BridgeConfig,
    topic: &str,
) -> Result<JoinHandle<()>, TransportError> {
    let key = config.topic_key(topic);
    let subscriber = session.declare_subscriber(key.as_str()).await?;
    let mut binding = TopicBinding::new(bus.clone(), topic);

    Ok(tokio::spawn(async move {
        while let Ok(sample) = subscriber.recv_async().await {
            let payload = sample.payload().to_bytes();
            match import_payload(&mut binding, &payload) {
                Ok(PublishOutcome::Skipped) => debug!("{}: pool exhausted, dropped", key),
                Ok(PublishOutcome::Published(_)) => {}
                Err(e) => warn!("Import from {} failed: {}", key, e),
            }
        }
    }))
}

async fn spawn_host_input(
    session: &zenoh::Session,
    dispatcher: &SharedDispatcher,
    config: &BridgeConfig,
    input: HostInput,
) -> Result<JoinHandle<()>, TransportError> {
    let key = config.host_key(input.topic());
    let subscriber = session.declare_subscriber(key.as_str()).await?;
    let dispatcher = dispatcher.clone();

    Ok(tokio::spawn(async move {
        while let Ok(sample) = subscriber.recv_async().await {
            let payload = sample.payload().to_bytes();
            if let Err(e) = apply_host_input(&dispatcher, input, &payload) {
                warn!("Failed to apply {}: {}", key, e);
            }
        }
    }))
}

fn spawn_republisher(
    session: &zenoh::Session,
    bus: &Middleware,
    config: &BridgeConfig,
) -> Result<JoinHandle<()>, TransportError> {
    let mut links = Vec::with_capacity(REPUBLISHED_TOPICS.len());
    for topic in REPUBLISHED_TOPICS {
        let subscription = bus.subscribe(topic, config.depth, SubscriptionMode::Latest)?;
        links.push((subscription, config.host_key(topic), None::<String>));
    }
    let session = session.clone();
    let period = config.period;

    Ok(tokio::spawn(async move {
        let mut tick = interval(period);
        loop {
            tick.tick().await;

            for (subscription, key, latest) in links.iter_mut() {
                if let Some(sample) = subscription.try_fetch() {
                    match serde_json::to_string(sample.message()) {
                        Ok(json) => *latest = Some(json),
                        Err(e) => warn!("Cannot encode {}: {}", key, e),
                    }
                    sample.release();
                }
                // The host sees the last known value every period
                if let Some(json) = latest.as_ref() {
                    if let Err(e) = session.put(key.as_str(), json.clone()).await {
                        warn!("Republish to {} failed: {}", key, e);
                    }
                }
            }
        }
    }))
}

async fn spawn_remote_shell(
    session: &zenoh::Session,
    dispatcher: &SharedDispatcher,
    config: &BridgeConfig,
) -> Result<[JoinHandle<()>; 2], TransportError> {
    let in_key = config.shell_in_key();
    let out_key = config.shell_out_key();
    let subscriber = session.declare_subscriber(in_key.as_str()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let out: Arc<dyn Sink> = Arc::new(BridgeSink::new(tx));

    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer_session.put(out_key.as_str(), line).await {
                warn!("Shell reply to {} failed: {}", out_key, e);
            }
        }
    });

    let dispatcher = dispatcher.clone();
    let reader = tokio::spawn(async move {
        while let Ok(sample) = subscriber.recv_async().await {
            let payload = sample.payload().to_bytes();
            let text = String::from_utf8_lossy(&payload);
            for line in text.lines() {
                debug!("Remote command: {}", line);
                shell::execute(&dispatcher, line, &out);
            }
        }
    });

    Ok([reader, writer])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Middleware;
    use crate::config::{TOPIC_BALCFG, TOPIC_IMU, TOPIC_SPEED2, TOPIC_VELOCITY};
    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::kinematics::{DriveParams, Topology};
    use crate::messages::{Imu, Speed2};
    use crate::session::{BufferSink, Session};
    use std::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_millis(20);

    fn bridge_config() -> BridgeConfig {
        BridgeConfig {
            prefix: "robot".into(),
            depth: 5,
            poll_timeout: TIMEOUT,
            period: Duration::from_millis(50),
        }
    }

    fn shared(mw: &Middleware) -> SharedDispatcher {
        let session = Arc::new(Session::new(BufferSink::new()));
        let config = DispatcherConfig {
            differential: DriveParams::new(0.4, 0.05),
            omni: DriveParams::new(0.16, 0.035).with_max_wheel_speed(52.0),
            topology: Topology::Differential,
        };
        Arc::new(Mutex::new(Dispatcher::new(mw.clone(), session, config)))
    }

    #[test]
    fn test_keys() {
        let config = bridge_config();
        assert_eq!(config.topic_key("speed2"), "robot/speed2");
        assert_eq!(config.host_key("cmd_vel"), "robot/ros/cmd_vel");
        assert_eq!(config.shell_in_key(), "robot/shell/in");
        assert_eq!(config.shell_out_key(), "robot/shell/out");
    }

    #[tokio::test]
    async fn test_cmd_vel_reaches_velocity_topic() {
        let mw = Middleware::new("test", 4);
        let mut sub = mw.subscribe(TOPIC_VELOCITY, 5, SubscriptionMode::Queued).unwrap();
        let dispatcher = shared(&mw);

        let payload = br#"{"linear":{"x":0.3,"y":0.0,"z":0.0},"angular":{"x":0.0,"y":0.0,"z":1.5}}"#;
        let outcome = apply_host_input(&dispatcher, HostInput::CmdVel, payload).unwrap();
        assert_eq!(outcome, PublishOutcome::Published(1));

        let sample = sub.poll(TIMEOUT).await.unwrap();
        assert_eq!(
            sample.message(),
            &Message::Velocity3(Velocity3 { x: 0.3, y: 0.0, w: 1.5 })
        );
        assert!(!mw.is_live(TOPIC_VELOCITY));
    }

    #[test]
    fn test_host_pid_goes_to_its_loop() {
        let mw = Middleware::new("test", 4);
        let dispatcher = shared(&mw);

        apply_host_input(&dispatcher, HostInput::BalanceConfig, br#"{"k":2.0,"ti":0.5,"td":0.0}"#).unwrap();
        assert_eq!(mw.advertisements(TOPIC_BALCFG), 1);
        assert_eq!(mw.advertisements("velcfg"), 0);
    }

    #[test]
    fn test_malformed_host_input() {
        let mw = Middleware::new("test", 4);
        let dispatcher = shared(&mw);

        let result = apply_host_input(&dispatcher, HostInput::VelocityConfig, b"not json");
        assert!(matches!(result, Err(TransportError::Json(_))));
        assert!(mw.status().is_empty());
    }

    #[tokio::test]
    async fn test_imported_samples_are_not_exported_back() {
        let mw = Middleware::new("test", 4);
        let mut exporter = mw.subscribe(TOPIC_IMU, 5, SubscriptionMode::Queued).unwrap();
        let mut binding = TopicBinding::new(mw.clone(), TOPIC_IMU);

        let imu = Message::Imu(Imu { roll: 0.1, pitch: 0.2, yaw: 0.3 });
        let json = serde_json::to_vec(&imu).unwrap();
        import_payload(&mut binding, &json).unwrap();

        let sample = exporter.poll(TIMEOUT).await.unwrap();
        assert_eq!(sample.message(), &imu);
        assert!(export_payload(&sample).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_samples_are_exported() {
        let mw = Middleware::new("test", 4);
        let mut exporter = mw.subscribe(TOPIC_SPEED2, 5, SubscriptionMode::Queued).unwrap();
        let mut binding = TopicBinding::new(mw.clone(), TOPIC_SPEED2);

        let msg = Message::Speed2(Speed2 { value: [1.0, -1.0] });
        binding.send(msg.clone()).unwrap();

        let sample = exporter.poll(TIMEOUT).await.unwrap();
        let json = export_payload(&sample).unwrap().unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn test_bridge_sink_queues_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = BridgeSink::new(tx);
        sink.write_line("fly ?");
        assert_eq!(rx.recv().await.as_deref(), Some("fly ?"));
    }
}
