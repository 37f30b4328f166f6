//! Standalone signaling server binary
//!
//! Run with:
//!   cargo run --bin signaling-server -- --port 8080

use std::net::SocketAddr;

use clap::Parser;
use tracing::{info, Level};

use meshplay::network::SignalingServer;

/// Signaling server for meshplay sessions
#[derive(Parser, Debug)]
#[command(name = "signaling-server")]
#[command(about = "Relays address candidates between meshplay peers")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!("Signaling server starting on {}", addr);
    info!("Protocol: ws:// (WebSocket)");

    let server = SignalingServer::new();
    server.run(&addr.to_string()).await?;
    Ok(())
}
