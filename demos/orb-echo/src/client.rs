//! ORB Echo Client
//!
//! Run with: cargo run --bin orb-echo-client -- --addr 127.0.0.1:1049 "hello"

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Parser;
use orb_transport::{GiopVersion, OrbConfig, ReplyStatus, TransportManager};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use orb_echo::{OP_ECHO, OP_REVERSE, OP_UPPER};

#[derive(Parser)]
#[command(name = "orb-echo-client")]
#[command(about = "Echo client on the ORB transport")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:1049")]
    addr: SocketAddr,

    /// Message to send
    #[arg(default_value = "Hello, ORB!")]
    message: String,

    /// Number of echo round trips
    #[arg(short = 'n', long, default_value_t = 3)]
    count: usize,

    /// GIOP version to offer the server
    #[arg(short, long, default_value = "1.2")]
    giop: GiopVersion,

    /// Per-request timeout in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);
    let manager = TransportManager::new(OrbConfig::default())?;
    let conn = manager.get_outbound_connection(args.addr, args.giop, None)?;
    info!("Connected to {} using GIOP {}", args.addr, conn.giop_version());

    for i in 0..args.count {
        let start = Instant::now();
        let reply = conn
            .send_request(OP_ECHO, Bytes::from(args.message.clone()), true, timeout)?
            .ok_or("no reply")?;
        info!(
            "#{} {} -> {:?} in {:?}",
            i + 1,
            OP_ECHO,
            String::from_utf8_lossy(&reply.body),
            start.elapsed()
        );
    }

    for operation in [OP_REVERSE, OP_UPPER] {
        match conn.send_request(operation, Bytes::from(args.message.clone()), true, timeout)? {
            Some(reply) if reply.status == ReplyStatus::NoException => {
                info!("{} -> {:?}", operation, String::from_utf8_lossy(&reply.body));
            }
            Some(reply) => warn!("{} failed: {}", operation, String::from_utf8_lossy(&reply.body)),
            None => warn!("{} returned no reply", operation),
        }
    }

    manager.close();
    info!("Done");
    Ok(())
}
