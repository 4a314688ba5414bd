use anyhow::bail;
use arena_transport::config::RudpConfig;
use arena_transport::control_messages::JoinSettings;
use arena_transport::end_point::EndPoint;
use arena_transport::fragment::MAX_EPOCH;
use arena_transport::message_dispatcher::{LogicalMessage, MessageDispatcher};
use arena_transport::outbound::OutboundChannel;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    server_address: String,

    /// messages to send to the server's echo listener
    #[clap(long)]
    message: Vec<String>,

    /// additionally send a message of this many bytes, to see fragmentation at work
    #[clap(long)]
    big_message_len: Option<usize>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct ReplyDispatcher {
    replies: mpsc::UnboundedSender<LogicalMessage>,
}

#[async_trait]
impl MessageDispatcher for ReplyDispatcher {
    async fn on_message(&self, message: LogicalMessage, _reply_channel: Arc<OutboundChannel>) {
        if self.replies.send(message).is_err() {
            warn!("reply received after shutdown");
        }
    }

    async fn on_join_accepted(&self, peer_addr: SocketAddr, settings: JoinSettings) {
        info!("joined {:?}: max chunk size {}, max pending sends {}", peer_addr, settings.max_chunk_size, settings.max_pending_sends);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let server_addr: SocketAddr = args.server_address.parse()?;

    let mut messages = args.message;
    if let Some(len) = args.big_message_len {
        messages.push("x".repeat(len));
    }
    if messages.is_empty() {
        bail!("nothing to send - pass at least one --message");
    }

    let (replies_sender, mut replies) = mpsc::unbounded_channel();
    let end_point = Arc::new(EndPoint::new(
        Arc::new(ReplyDispatcher { replies: replies_sender }),
        Arc::new(RudpConfig::new("0.0.0.0:0".parse()?)),
    ).await?);

    let background = end_point.clone();
    tokio::spawn(async move { background.run().await });

    end_point.join(server_addr).await?;

    for (idx, message) in messages.iter().enumerate() {
        let epoch = (idx % MAX_EPOCH as usize) as u8 + 1;
        let len = message.len();
        end_point.send_reliable_with_epoch(server_addr, "echo", message, epoch, Some(Box::new(move |sequence: u32| {
            info!("message #{} ({} bytes, starting at fragment {}) was acknowledged", epoch, len, sequence);
        }))).await?;
    }

    for _ in 0..messages.len() {
        match timeout(Duration::from_secs(10), replies.recv()).await {
            Ok(Some(reply)) => info!("reply #{} for {:?}: {} bytes", reply.epoch, reply.event_name, reply.body.len()),
            Ok(None) => bail!("dispatcher was dropped"),
            Err(_) => bail!("timed out waiting for replies"),
        }
    }

    end_point.disconnect(server_addr).await;
    Ok(())
}
