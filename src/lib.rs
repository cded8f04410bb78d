pub mod binding;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod kinematics;
pub mod messages;
pub mod runtime;
pub mod session;
pub mod shell;
pub mod sim;
pub mod tasks;
pub mod telemetry;
pub mod transport;
