use crate::control_messages::check_application_event_name;
use crate::message_dispatcher::{LogicalMessage, MessageDispatcher};
use crate::outbound::OutboundChannel;
use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Application handler for messages with a given event name. A returned reply is sent back
///  to the sender reliably, with the same event name and the epoch of the request.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn on_message(&self, peer_addr: SocketAddr, body: &str) -> Option<String>;
}

/// A [MessageDispatcher] that routes messages to listeners by event name. Listeners are
///  registered explicitly before the registry is handed to the end point.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: FxHashMap<String, Arc<dyn Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> ListenerRegistry {
        Default::default()
    }

    pub fn register(&mut self, event_name: &str, listener: Arc<dyn Listener>) -> anyhow::Result<()> {
        check_application_event_name(event_name)?;

        match self.listeners.entry(event_name.to_string()) {
            Entry::Occupied(_) => bail!("a listener for {:?} is already registered", event_name),
            Entry::Vacant(e) => {
                debug!("registering listener for {:?}", event_name);
                e.insert(listener);
                Ok(())
            }
        }
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.listeners.keys()
            .map(|s| s.as_str())
    }
}

#[async_trait]
impl MessageDispatcher for ListenerRegistry {
    async fn on_message(&self, message: LogicalMessage, reply_channel: Arc<OutboundChannel>) {
        let Some(listener) = self.listeners.get(&message.event_name) else {
            debug!("no listener for event {:?} from {:?} - dropping message", message.event_name, message.peer_addr);
            return;
        };

        trace!("dispatching {:?} from {:?} to listener", message.event_name, message.peer_addr);
        if let Some(reply) = listener.on_message(message.peer_addr, &message.body).await {
            if let Err(e) = reply_channel.send_reliable_with_epoch(&message.event_name, &reply, message.epoch, None) {
                warn!("could not send reply for {:?} to {:?}: {}", message.event_name, message.peer_addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectiveOutboundConfig;
    use crate::send_socket::testing::CollectingSendSocket;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::sync::Mutex;
    use tokio::time;

    struct EchoListener;
    #[async_trait]
    impl Listener for EchoListener {
        async fn on_message(&self, _peer_addr: SocketAddr, body: &str) -> Option<String> {
            Some(format!("echo:{}", body))
        }
    }

    #[derive(Default)]
    struct SilentListener {
        received: Mutex<Vec<String>>,
    }
    #[async_trait]
    impl Listener for SilentListener {
        async fn on_message(&self, _peer_addr: SocketAddr, body: &str) -> Option<String> {
            self.received.lock().await.push(body.to_string());
            None
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 9))
    }

    fn message(event_name: &str, body: &str, epoch: u8) -> LogicalMessage {
        LogicalMessage {
            peer_addr: peer(),
            event_name: event_name.to_string(),
            body: body.to_string(),
            epoch,
            reliable: true,
        }
    }

    fn reply_channel(send_socket: Arc<CollectingSendSocket>) -> Arc<OutboundChannel> {
        let mut channel = OutboundChannel::new(
            Arc::new(EffectiveOutboundConfig {
                max_chunk_size: 200,
                retransmit_interval: Duration::from_millis(250),
                pump_interval: Duration::from_millis(5),
                max_pending_sends: 10,
                max_datagram_size: 2048,
            }),
            peer(),
            send_socket,
        );
        channel.spawn_pump();
        Arc::new(channel)
    }

    #[test]
    fn test_register() {
        let mut registry = ListenerRegistry::new();
        assert!(registry.register("echo", Arc::new(EchoListener)).is_ok());
        assert!(registry.register("echo", Arc::new(EchoListener)).is_err());
        assert!(registry.register("$join", Arc::new(EchoListener)).is_err());
        assert_eq!(registry.event_names().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn test_dispatch_and_reply() {
        let send_socket = Arc::new(CollectingSendSocket::default());
        let silent = Arc::new(SilentListener::default());

        let mut registry = ListenerRegistry::new();
        registry.register("echo", Arc::new(EchoListener)).unwrap();
        registry.register("silent", silent.clone()).unwrap();

        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let reply_channel = reply_channel(send_socket.clone());

            registry.on_message(message("echo", "hi", 5), reply_channel.clone()).await;
            registry.on_message(message("silent", "psst", 6), reply_channel.clone()).await;
            registry.on_message(message("unknown", "?", 7), reply_channel.clone()).await;
            time::sleep(Duration::from_millis(10)).await;

            let sent = send_socket.fragments();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].event_name, "echo");
            assert_eq!(sent[0].payload, "echo:hi");
            assert_eq!(sent[0].epoch, 5);
            assert!(sent[0].reliable);

            assert_eq!(*silent.received.lock().await, vec!["psst".to_string()]);
        });
    }
}
