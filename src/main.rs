//! service-server: a framed request/response server
//!
//! Features:
//! - `PROTO1` header framing with string and file payloads
//! - String payloads are echoed back
//! - File payloads are stored under a root directory and served on request
//! - Configuration via CLI arguments or TOML file

use service_server::config::Config;
use service_server::protocol::HandlerRegistry;
use service_server::runtime::Listener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        default_payload = ?config.default_payload,
        max_header_bytes = config.max_header_bytes,
        max_body_bytes = config.max_body_bytes,
        file_root = %config.file_root.display(),
        "Starting service-server"
    );

    let handlers = HandlerRegistry::with_defaults(&config.file_root);
    let mut listener = Listener::open(&config, handlers)?;

    wait_for_signal()?;
    info!("Received interrupt, shutting down");

    listener.shutdown();
    Ok(())
}

/// Block until Ctrl-C.
fn wait_for_signal() -> std::io::Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())
}
