use arena_transport::config::RudpConfig;
use arena_transport::end_point::EndPoint;
use arena_transport::listener_registry::{Listener, ListenerRegistry};
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    #[clap(default_value = "0.0.0.0:9000")]
    listen_address: String,

    #[clap(long)]
    max_chunk_size: Option<usize>,

    #[clap(long)]
    idle_timeout_secs: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct EchoListener;

#[async_trait]
impl Listener for EchoListener {
    async fn on_message(&self, peer_addr: SocketAddr, body: &str) -> Option<String> {
        info!("echo from {:?}: {} bytes", peer_addr, body.len());
        Some(body.to_string())
    }
}

#[derive(Default)]
struct CountListener {
    counter: AtomicU64,
}

#[async_trait]
impl Listener for CountListener {
    async fn on_message(&self, _peer_addr: SocketAddr, _body: &str) -> Option<String> {
        let count = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        Some(count.to_string())
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = RudpConfig::new(args.listen_address.parse()?);
    if let Some(max_chunk_size) = args.max_chunk_size {
        config.max_chunk_size = max_chunk_size;
    }
    if let Some(idle_timeout_secs) = args.idle_timeout_secs {
        config.session_idle_timeout = Duration::from_secs(idle_timeout_secs);
    }

    let mut listeners = ListenerRegistry::new();
    listeners.register("echo", Arc::new(EchoListener))?;
    listeners.register("count", Arc::new(CountListener::default()))?;

    let end_point = EndPoint::new(Arc::new(listeners), Arc::new(config)).await?;
    info!("echo server listening on {:?}", end_point.self_addr());

    end_point.run().await;
    Ok(())
}
