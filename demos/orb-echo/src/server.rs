//! ORB Echo Server
//!
//! Run with: cargo run --bin orb-echo-server -- --port 1049

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use orb_transport::{AcceptorConfig, OrbConfig, ReaderMode, TransportManager};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use orb_echo::{create_echo_operations, DEFAULT_PORT};

#[derive(Clone, Copy, ValueEnum)]
enum Readers {
    Auto,
    Dedicated,
    Pooled,
}

impl From<Readers> for ReaderMode {
    fn from(readers: Readers) -> Self {
        match readers {
            Readers::Auto => ReaderMode::Auto,
            Readers::Dedicated => ReaderMode::Dedicated,
            Readers::Pooled => ReaderMode::Pooled,
        }
    }
}

#[derive(Parser)]
#[command(name = "orb-echo-server")]
#[command(about = "Echo server on the ORB transport")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// How inbound connections are read
    #[arg(short, long, value_enum, default_value = "auto")]
    readers: Readers,

    /// Optional properties file with `orb.*` settings
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => OrbConfig::from_properties(&std::fs::read_to_string(path)?)?,
        None => OrbConfig::default(),
    };
    config.host = args.host;
    config.reader_mode = args.readers.into();
    if config.acceptors.is_empty() {
        config = config.with_acceptor(AcceptorConfig::tcp(args.port).named("echo"));
    }

    let manager = TransportManager::builder(config)
        .dispatcher(Arc::new(create_echo_operations()))
        .build()?;
    manager.install_acceptors()?;
    manager.start()?;

    for acceptor in manager.get_acceptors(None, None)? {
        info!("Listening: {}", acceptor.monitoring_name());
    }

    loop {
        thread::sleep(Duration::from_secs(30));
        let stats = manager.stats().snapshot();
        let cache = manager.cache_stats();
        info!(
            accepted = stats.connections_accepted,
            reclaimed = stats.connections_reclaimed,
            inbound = cache.inbound,
            busy = cache.busy,
            "Server statistics"
        );
    }
}
