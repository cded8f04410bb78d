// Command dispatcher
//
// Each command has a fixed arity. Motion and configuration commands go out
// through a gated binding; toggles flip a stream and make the calling sink the
// telemetry destination.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::binding::{BindingError, PublishOutcome, TopicBinding};
use crate::bus::Middleware;
use crate::config::{
    TOPIC_BALCFG, TOPIC_PIDCFG, TOPIC_SPEED2, TOPIC_SPEED3, TOPIC_VELCFG, TOPIC_VELOCITY,
};
use crate::kinematics::{self, DriveParams, Topology, VelocityCommand, WheelSetpoint};
use crate::messages::{Message, PidConfig, Speed2, Speed3, Velocity3};
use crate::session::{Session, Sink, Stream};
use crate::tasks::TaskRegistry;

/// Control loops whose PID gains can be tuned at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLoop {
    /// Wheel speed loop
    Speed,
    /// Balance loop
    Balance,
    /// Body velocity loop
    Velocity,
}

impl ControlLoop {
    const ALL: [ControlLoop; 3] = [ControlLoop::Speed, ControlLoop::Balance, ControlLoop::Velocity];

    pub fn topic(self) -> &'static str {
        match self {
            ControlLoop::Speed => TOPIC_PIDCFG,
            ControlLoop::Balance => TOPIC_BALCFG,
            ControlLoop::Velocity => TOPIC_VELCFG,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Drive(Topology),
    Stop,
    Configure(ControlLoop),
    Toggle(Stream),
    Mem,
    Threads,
    Help,
}

struct CommandSpec {
    name: &'static str,
    params: &'static [&'static str],
    action: Action,
}

const PID_PARAMS: &[&str] = &["<k>", "<ti>", "<td>"];

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "r",
        params: &["<forward>", "<angular>"],
        action: Action::Drive(Topology::Differential),
    },
    CommandSpec {
        name: "run",
        params: &["<forward>", "<strafe>", "<angular>"],
        action: Action::Drive(Topology::Omni),
    },
    CommandSpec { name: "s", params: &[], action: Action::Stop },
    CommandSpec { name: "stop", params: &[], action: Action::Stop },
    CommandSpec {
        name: "pidcfg",
        params: PID_PARAMS,
        action: Action::Configure(ControlLoop::Speed),
    },
    CommandSpec {
        name: "bcfg",
        params: PID_PARAMS,
        action: Action::Configure(ControlLoop::Balance),
    },
    CommandSpec {
        name: "vcfg",
        params: PID_PARAMS,
        action: Action::Configure(ControlLoop::Velocity),
    },
    CommandSpec { name: "e", params: &[], action: Action::Toggle(Stream::Encoder) },
    CommandSpec { name: "i", params: &[], action: Action::Toggle(Stream::Imu) },
    CommandSpec { name: "p", params: &[], action: Action::Toggle(Stream::Proximity) },
    CommandSpec { name: "imuraw", params: &[], action: Action::Toggle(Stream::ImuRaw) },
    CommandSpec { name: "gps", params: &[], action: Action::Toggle(Stream::Gps) },
    CommandSpec { name: "servo", params: &[], action: Action::Toggle(Stream::Servo) },
    CommandSpec { name: "mem", params: &[], action: Action::Mem },
    CommandSpec { name: "threads", params: &[], action: Action::Threads },
    CommandSpec { name: "help", params: &[], action: Action::Help },
];

impl CommandSpec {
    fn usage(&self) -> String {
        let mut usage = format!("Usage: {}", self.name);
        for param in self.params {
            usage.push(' ');
            usage.push_str(param);
        }
        usage
    }
}

/// What a command did, for callers that care
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandOutcome {
    Unknown,
    Usage,
    Setpoint {
        setpoint: WheelSetpoint,
        publish: PublishOutcome,
    },
    Configured {
        control_loop: ControlLoop,
        publish: PublishOutcome,
    },
    Toggled {
        stream: Stream,
        enabled: bool,
    },
    Listed,
    Failed,
}

/// Parse a number the way C's `atof` does: longest numeric prefix, else zero
pub fn parse_scalar(token: &str) -> f32 {
    let s = token.trim_start();
    (1..=s.len())
        .rev()
        .filter(|&end| s.is_char_boundary(end))
        .find_map(|end| s[..end].parse::<f32>().ok())
        .unwrap_or(0.0)
}

/// Robot geometry and the drivetrain the stop command targets
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub differential: DriveParams,
    pub omni: DriveParams,
    pub topology: Topology,
}

pub struct Dispatcher {
    bus: Middleware,
    session: Arc<Session>,
    config: DispatcherConfig,
    speed2: TopicBinding,
    speed3: TopicBinding,
    velocity: TopicBinding,
    pid: [TopicBinding; 3],
    tasks: Arc<TaskRegistry>,
}

impl Dispatcher {
    pub fn new(bus: Middleware, session: Arc<Session>, config: DispatcherConfig) -> Self {
        Self {
            speed2: TopicBinding::new(bus.clone(), TOPIC_SPEED2),
            speed3: TopicBinding::new(bus.clone(), TOPIC_SPEED3),
            velocity: TopicBinding::new(bus.clone(), TOPIC_VELOCITY),
            pid: ControlLoop::ALL.map(|control_loop| TopicBinding::new(bus.clone(), control_loop.topic())),
            bus,
            session,
            config,
            tasks: TaskRegistry::new(),
        }
    }

    /// List the workers in `tasks` under the `threads` command
    pub fn with_tasks(mut self, tasks: Arc<TaskRegistry>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Split a command line on whitespace and dispatch it; blank lines do nothing
    pub fn dispatch_line(&mut self, line: &str, out: &Arc<dyn Sink>) -> Option<CommandOutcome> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next()?;
        let args: Vec<&str> = tokens.collect();
        Some(self.dispatch(name, &args, out))
    }

    pub fn dispatch(&mut self, name: &str, args: &[&str], out: &Arc<dyn Sink>) -> CommandOutcome {
        let Some(command) = COMMANDS.iter().find(|command| command.name == name) else {
            out.write_line(&format!("{} ?", name));
            return CommandOutcome::Unknown;
        };

        if args.len() != command.params.len() {
            out.write_line(&command.usage());
            return CommandOutcome::Usage;
        }

        let values: Vec<f32> = args.iter().map(|arg| parse_scalar(arg)).collect();
        debug!("Command {} {:?}", name, values);

        match command.action {
            Action::Drive(topology) => {
                let cmd = match values[..] {
                    [forward, angular] => VelocityCommand::planar(forward, angular),
                    [forward, strafe, angular] => VelocityCommand::holonomic(forward, strafe, angular),
                    _ => VelocityCommand::zero(),
                };
                if topology == Topology::Differential {
                    // Telemetry follows the shell that is driving
                    self.session.set_sink(out.clone());
                }
                if topology == Topology::Omni {
                    let [w1, w2, w3] = kinematics::omni_wheel_speeds(&self.config.omni, &cmd);
                    out.write_line(&format!("SETPOINT: {:.6} {:.6} {:.6}", w1, w2, w3));
                }
                setpoint_outcome(self.drive(topology, &cmd))
            }
            Action::Stop => {
                let topology = self.config.topology;
                setpoint_outcome(self.drive(topology, &VelocityCommand::zero()))
            }
            Action::Configure(control_loop) => {
                let cfg = PidConfig {
                    k: values[0],
                    ti: values[1],
                    td: values[2],
                };
                match self.configure(control_loop, cfg) {
                    Ok(publish) => CommandOutcome::Configured {
                        control_loop,
                        publish,
                    },
                    Err(e) => {
                        warn!("{} not published: {}", control_loop.topic(), e);
                        CommandOutcome::Failed
                    }
                }
            }
            Action::Toggle(stream) => {
                self.session.set_sink(out.clone());
                let enabled = self.session.toggle(stream);
                info!("Stream {} {}", stream.name(), if enabled { "on" } else { "off" });
                CommandOutcome::Toggled { stream, enabled }
            }
            Action::Mem => {
                for topic in self.bus.status() {
                    out.write_line(&format!(
                        "{:<10} {:>3}/{:<3} {} pub {} sub {}",
                        topic.name,
                        topic.free,
                        topic.capacity,
                        if topic.live { "live" } else { "idle" },
                        topic.publishers,
                        topic.subscribers
                    ));
                }
                CommandOutcome::Listed
            }
            Action::Threads => {
                out.write_line(&format!("{:<28} {:<6} state", "name", "kind"));
                for worker in self.tasks.status() {
                    out.write_line(&format!(
                        "{:<28} {:<6} {}",
                        worker.name,
                        worker.kind,
                        if worker.running { "running" } else { "finished" }
                    ));
                }
                CommandOutcome::Listed
            }
            Action::Help => {
                let names: Vec<&str> = COMMANDS.iter().map(|command| command.name).collect();
                out.write_line(&format!("Commands: {}", names.join(" ")));
                CommandOutcome::Listed
            }
        }
    }

    /// Translate `cmd` for `topology` and publish it through the gated path
    pub fn drive(
        &mut self,
        topology: Topology,
        cmd: &VelocityCommand,
    ) -> Result<(WheelSetpoint, PublishOutcome), BindingError> {
        let (binding, params) = match topology {
            Topology::Differential => (&mut self.speed2, &self.config.differential),
            Topology::Omni => (&mut self.speed3, &self.config.omni),
        };

        let setpoint = kinematics::translate(topology, params, cmd);
        let message = match setpoint {
            WheelSetpoint::Differential(value) => Message::Speed2(Speed2 { value }),
            WheelSetpoint::Omni(value) => Message::Speed3(Speed3 { value }),
        };

        let publish = binding.send(message)?;
        Ok((setpoint, publish))
    }

    /// Publish PID gains for one loop; the topic is registered on first use
    pub fn configure(
        &mut self,
        control_loop: ControlLoop,
        cfg: PidConfig,
    ) -> Result<PublishOutcome, BindingError> {
        self.pid[control_loop.index()].send(Message::PidConfig(cfg))
    }

    /// Pass a body velocity straight through to the velocity loop
    pub fn forward_velocity(&mut self, velocity: Velocity3) -> Result<PublishOutcome, BindingError> {
        self.velocity.send(Message::Velocity3(velocity))
    }
}

fn setpoint_outcome(result: Result<(WheelSetpoint, PublishOutcome), BindingError>) -> CommandOutcome {
    match result {
        Ok((setpoint, publish)) => CommandOutcome::Setpoint { setpoint, publish },
        Err(e) => {
            warn!("Setpoint not published: {}", e);
            CommandOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SubscriptionMode;
    use crate::session::BufferSink;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(20);

    fn setup(pool_size: usize) -> (Dispatcher, Middleware, Arc<BufferSink>, Arc<dyn Sink>) {
        let mw = Middleware::new("test", pool_size);
        let console = BufferSink::new();
        let session = Arc::new(Session::new(console.clone()));
        let config = DispatcherConfig {
            differential: DriveParams::new(0.4, 0.05),
            omni: DriveParams::new(0.16, 0.035).with_max_wheel_speed(52.0),
            topology: Topology::Differential,
        };
        let out: Arc<dyn Sink> = console.clone();
        (Dispatcher::new(mw.clone(), session, config), mw, console, out)
    }

    #[test]
    fn test_parse_scalar_like_atof() {
        assert_eq!(parse_scalar("1.5"), 1.5);
        assert_eq!(parse_scalar("  -2"), -2.0);
        assert_eq!(parse_scalar("0.25m/s"), 0.25);
        assert_eq!(parse_scalar("1e2"), 100.0);
        assert_eq!(parse_scalar("abc"), 0.0);
        assert_eq!(parse_scalar(""), 0.0);
        assert_eq!(parse_scalar("é1"), 0.0);
    }

    #[tokio::test]
    async fn test_differential_run_scenario() {
        let (mut dispatcher, mw, _console, out) = setup(4);
        let mut sub = mw.subscribe(TOPIC_SPEED2, 5, SubscriptionMode::Queued).unwrap();

        let outcome = dispatcher.dispatch_line("r 1.0 0.0", &out).unwrap();
        let CommandOutcome::Setpoint { setpoint, publish } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(publish, PublishOutcome::Published(1));

        let sample = sub.poll(TIMEOUT).await.unwrap();
        let Message::Speed2(Speed2 { value: [left, right] }) = *sample.message() else {
            panic!("unexpected message {:?}", sample.message());
        };
        assert!((left - 20.0).abs() < 1e-4);
        assert!((right + 20.0).abs() < 1e-4);
        assert_eq!(setpoint, WheelSetpoint::Differential([left, right]));
        assert!(!mw.is_live(TOPIC_SPEED2));
    }

    #[tokio::test]
    async fn test_omni_zero_run_echoes_zeros() {
        let (mut dispatcher, mw, console, out) = setup(4);
        let mut sub = mw.subscribe(TOPIC_SPEED3, 5, SubscriptionMode::Queued).unwrap();

        dispatcher.dispatch_line("run 0 0 0", &out);
        assert_eq!(console.take(), vec!["SETPOINT: 0.000000 0.000000 0.000000"]);
        assert_eq!(
            sub.poll(TIMEOUT).await.unwrap().message(),
            &Message::Speed3(Speed3 { value: [0, 0, 0] })
        );
    }

    #[tokio::test]
    async fn test_omni_run_saturates() {
        let (mut dispatcher, mw, _console, out) = setup(4);
        let mut sub = mw.subscribe(TOPIC_SPEED3, 5, SubscriptionMode::Queued).unwrap();

        dispatcher.dispatch_line("run 10 0 0", &out);
        assert_eq!(
            sub.poll(TIMEOUT).await.unwrap().message(),
            &Message::Speed3(Speed3 { value: [52, 52, -52] })
        );
    }

    #[tokio::test]
    async fn test_pidcfg_twice_registers_once() {
        let (mut dispatcher, mw, _console, out) = setup(4);
        let mut sub = mw.subscribe(TOPIC_PIDCFG, 5, SubscriptionMode::Queued).unwrap();

        for _ in 0..2 {
            let outcome = dispatcher.dispatch_line("pidcfg 1.5 0.2 0.01", &out).unwrap();
            assert_eq!(
                outcome,
                CommandOutcome::Configured {
                    control_loop: ControlLoop::Speed,
                    publish: PublishOutcome::Published(1),
                }
            );
        }
        assert_eq!(mw.advertisements(TOPIC_PIDCFG), 1);

        let expected = Message::PidConfig(PidConfig {
            k: 1.5,
            ti: 0.2,
            td: 0.01,
        });
        assert_eq!(sub.poll(TIMEOUT).await.unwrap().message(), &expected);
        assert_eq!(sub.poll(TIMEOUT).await.unwrap().message(), &expected);
        assert!(sub.poll(TIMEOUT).await.is_none());
    }

    #[test]
    fn test_untouched_config_topics_never_appear() {
        let (mut dispatcher, mw, _console, out) = setup(4);
        dispatcher.dispatch_line("bcfg 1 2 3", &out);

        assert_eq!(mw.advertisements(TOPIC_BALCFG), 1);
        assert_eq!(mw.advertisements(TOPIC_PIDCFG), 0);
        assert_eq!(mw.advertisements(TOPIC_VELCFG), 0);
    }

    #[test]
    fn test_wrong_arity_prints_usage_without_side_effects() {
        let (mut dispatcher, mw, console, out) = setup(4);

        assert_eq!(dispatcher.dispatch_line("r 1.0", &out), Some(CommandOutcome::Usage));
        assert_eq!(dispatcher.dispatch_line("pidcfg 1 2", &out), Some(CommandOutcome::Usage));
        assert_eq!(dispatcher.dispatch_line("s now", &out), Some(CommandOutcome::Usage));
        assert_eq!(dispatcher.dispatch_line("e 1", &out), Some(CommandOutcome::Usage));
        assert_eq!(
            console.take(),
            vec![
                "Usage: r <forward> <angular>",
                "Usage: pidcfg <k> <ti> <td>",
                "Usage: s",
                "Usage: e",
            ]
        );

        assert!(mw.status().is_empty());
        assert!(!dispatcher.session().is_enabled(Stream::Encoder));
    }

    #[test]
    fn test_malformed_numbers_degrade_to_zero() {
        let (mut dispatcher, _mw, _console, out) = setup(4);
        let outcome = dispatcher.dispatch_line("r fast 0", &out).unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::Setpoint {
                setpoint: WheelSetpoint::Differential([0.0, 0.0]),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stop_uses_gated_path() {
        let (mut dispatcher, mw, _console, out) = setup(4);
        let mut sub = mw.subscribe(TOPIC_SPEED2, 5, SubscriptionMode::Queued).unwrap();

        for name in ["s", "stop"] {
            let outcome = dispatcher.dispatch_line(name, &out).unwrap();
            assert_eq!(
                outcome,
                CommandOutcome::Setpoint {
                    setpoint: WheelSetpoint::Differential([0.0, 0.0]),
                    publish: PublishOutcome::Published(1),
                }
            );
        }
        assert_eq!(mw.advertisements(TOPIC_SPEED2), 1);
        assert!(!mw.is_live(TOPIC_SPEED2));
        assert!(sub.poll(TIMEOUT).await.is_some());
    }

    #[test]
    fn test_pool_exhaustion_skips_silently() {
        let (mut dispatcher, mw, console, out) = setup(1);
        // Keep the only slot queued
        let _sub = mw.subscribe(TOPIC_SPEED2, 5, SubscriptionMode::Queued).unwrap();

        dispatcher.dispatch_line("r 0.1 0", &out);
        let outcome = dispatcher.dispatch_line("r 0.2 0", &out).unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::Setpoint {
                publish: PublishOutcome::Skipped,
                ..
            }
        ));
        assert!(console.take().is_empty());
    }

    #[test]
    fn test_toggle_twice_and_sink_capture() {
        let (mut dispatcher, _mw, console, _out) = setup(4);
        let remote = BufferSink::new();
        let remote_out: Arc<dyn Sink> = remote.clone();

        assert_eq!(
            dispatcher.dispatch_line("e", &remote_out),
            Some(CommandOutcome::Toggled {
                stream: Stream::Encoder,
                enabled: true
            })
        );
        assert_eq!(
            dispatcher.dispatch_line("e", &remote_out),
            Some(CommandOutcome::Toggled {
                stream: Stream::Encoder,
                enabled: false
            })
        );

        // Telemetry now goes to whoever toggled last
        dispatcher.session().emit("tick");
        assert_eq!(remote.take(), vec!["tick"]);
        assert!(console.take().is_empty());
    }

    #[test]
    fn test_differential_run_captures_sink() {
        let (mut dispatcher, _mw, console, _out) = setup(4);
        let remote = BufferSink::new();
        let remote_out: Arc<dyn Sink> = remote.clone();

        dispatcher.dispatch_line("r 0.1 0", &remote_out);
        dispatcher.session().emit("tick");

        assert_eq!(remote.take(), vec!["tick"]);
        assert!(console.take().is_empty());
    }

    #[test]
    fn test_omni_run_keeps_sink() {
        let (mut dispatcher, _mw, console, _out) = setup(4);
        let remote = BufferSink::new();
        let remote_out: Arc<dyn Sink> = remote.clone();

        dispatcher.dispatch_line("run 0 0 0", &remote_out);
        assert_eq!(remote.take(), vec!["SETPOINT: 0.000000 0.000000 0.000000"]);

        dispatcher.session().emit("tick");
        assert_eq!(console.take(), vec!["tick"]);
    }

    #[test]
    fn test_negative_speed_limit_does_not_abort() {
        let mw = Middleware::new("test", 4);
        let console = BufferSink::new();
        let config = DispatcherConfig {
            differential: DriveParams::new(0.4, 0.05),
            omni: DriveParams::new(0.16, 0.035).with_max_wheel_speed(-1.0),
            topology: Topology::Omni,
        };
        let mut dispatcher = Dispatcher::new(mw, Arc::new(Session::new(console.clone())), config);
        let out: Arc<dyn Sink> = console.clone();

        for line in ["run 0 0 0", "run 10 0 0", "s"] {
            assert!(matches!(
                dispatcher.dispatch_line(line, &out),
                Some(CommandOutcome::Setpoint { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_threads_lists_registered_workers() {
        let registry = TaskRegistry::new();
        let consumer = tokio::spawn(std::future::pending::<()>());
        registry.add_task("telemetry/encoder2", &consumer);

        let (dispatcher, _mw, console, out) = setup(4);
        let mut dispatcher = dispatcher.with_tasks(registry);
        assert_eq!(dispatcher.dispatch_line("threads", &out), Some(CommandOutcome::Listed));

        let lines = console.take();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("name"), "{}", lines[0]);
        assert!(lines[1].starts_with("telemetry/encoder2"), "{}", lines[1]);
        assert!(lines[1].ends_with("task   running"), "{}", lines[1]);
        consumer.abort();
    }

    #[test]
    fn test_unknown_and_blank() {
        let (mut dispatcher, _mw, console, out) = setup(4);
        assert_eq!(dispatcher.dispatch_line("fly 1", &out), Some(CommandOutcome::Unknown));
        assert_eq!(dispatcher.dispatch_line("   ", &out), None);
        assert_eq!(console.take(), vec!["fly ?"]);
    }

    #[test]
    fn test_mem_lists_topics() {
        let (mut dispatcher, _mw, console, out) = setup(4);
        dispatcher.dispatch_line("vcfg 1 0 0", &out);
        dispatcher.dispatch_line("mem", &out);

        let lines = console.take();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("velcfg"), "{}", lines[0]);
        assert!(lines[0].contains("  4/4"), "{}", lines[0]);
        assert!(lines[0].contains("idle"), "{}", lines[0]);
    }

    #[tokio::test]
    async fn test_forward_velocity() {
        let (mut dispatcher, mw, _console, _out) = setup(4);
        let mut sub = mw.subscribe(TOPIC_VELOCITY, 5, SubscriptionMode::Queued).unwrap();
        let velocity = Velocity3 { x: 0.1, y: 0.0, w: 0.5 };

        assert_eq!(
            dispatcher.forward_velocity(velocity).unwrap(),
            PublishOutcome::Published(1)
        );
        assert_eq!(sub.poll(TIMEOUT).await.unwrap().message(), &Message::Velocity3(velocity));
    }
}
