// Wires the bus, telemetry consumers, dispatcher and command sources together
// and runs until stdin closes (or Ctrl-C when remote shells are serving).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::{Middleware, SubscriptionMode};
use crate::config::{Args, BRIDGE_PERIOD, ENCODER_RATE_HZ, MODULE_NAME};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::kinematics::{Topology, VelocityCommand};
use crate::session::{ConsoleSink, Session};
use crate::shell::{self, SharedDispatcher};
use crate::sim::{Plant, Simulator};
use crate::tasks::TaskRegistry;
use crate::telemetry::{self, ConsumerConfig};
use crate::transport::{Bridge, BridgeConfig};

pub async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bus = Middleware::new(MODULE_NAME, args.pool_size);
    let session = Arc::new(Session::new(Arc::new(ConsoleSink)));
    let topology = Topology::from(args.topology);

    let consumer_config = ConsumerConfig {
        poll_timeout: args.poll_timeout(),
        backoff: args.backoff(),
        depth: args.queue_depth,
        mode: SubscriptionMode::Queued,
    };
    let tasks = TaskRegistry::new();
    for (name, task) in telemetry::spawn_all(&bus, &session, consumer_config)? {
        tasks.add_task(name, &task);
    }
    info!(
        "Telemetry consumers started: queue depth {}, poll timeout {}ms",
        args.queue_depth,
        args.poll_timeout().as_millis()
    );

    let dispatcher = Dispatcher::new(
        bus.clone(),
        session.clone(),
        DispatcherConfig {
            differential: args.differential(),
            omni: args.omni(),
            topology,
        },
    )
    .with_tasks(tasks.clone());
    let dispatcher: SharedDispatcher = Arc::new(Mutex::new(dispatcher));

    if args.simulate {
        let plant = Plant::new(args.differential(), args.omni(), ENCODER_RATE_HZ);
        let period = Duration::from_secs_f32(1.0 / ENCODER_RATE_HZ);
        let sim = Simulator::new(&bus, plant, period)?.spawn();
        tasks.add_task("sim", &sim);
    }

    let bridge = if args.no_bridge {
        None
    } else {
        let config = BridgeConfig {
            prefix: args.key_prefix.clone(),
            depth: args.queue_depth,
            poll_timeout: args.poll_timeout(),
            period: BRIDGE_PERIOD,
        };
        let bridge = Bridge::start(bus.clone(), dispatcher.clone(), config).await?;
        for (name, task) in bridge.tasks() {
            tasks.add_task(name, task);
        }
        Some(bridge)
    };

    if let Some(path) = &args.serial {
        // The port read times out regularly but never ends on its own
        let serial = shell::spawn_serial(path, args.baudrate, dispatcher.clone())?;
        tasks.add_thread(format!("shell/{}", path), serial);
    }

    info!("{} ready ({:?} drive, pool {} per topic)", bus.name(), topology, args.pool_size);

    tokio::select! {
        result = shell::run_stdin(dispatcher.clone()) => {
            result?;
            if bridge.is_some() || args.serial.is_some() {
                info!("Still serving remote shells, Ctrl-C to quit");
                tokio::signal::ctrl_c().await?;
            }
        }
        result = tokio::signal::ctrl_c() => result?,
    }

    info!("Shutting down, stopping the base");
    let stopped = dispatcher
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drive(topology, &VelocityCommand::zero());
    if let Err(e) = stopped {
        warn!("Final stop not published: {}", e);
    }

    if let Some(bridge) = bridge {
        // Give the exporter a moment to relay the stop
        tokio::time::sleep(BRIDGE_PERIOD).await;
        bridge.close().await?;
    }
    tasks.abort_all();
    Ok(())
}
