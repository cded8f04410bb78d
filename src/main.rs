use clap::Parser;
use tracing_subscriber::EnvFilter;

use motion_console::config::Args;

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    if let Err(e) = motion_console::runtime::run(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
