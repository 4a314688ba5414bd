use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use crate::control_messages::JoinSettings;
use crate::fragment::Fragment;
use crate::outbound::OutboundChannel;
use tracing::debug;

/// A complete application-level message, delivered only after all of its fragments were
///  received. It is never delivered partially.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalMessage {
    pub peer_addr: SocketAddr,
    pub event_name: String,
    pub body: String,
    /// the epoch of the send, for correlating replies with requests. 0 for unreliable messages.
    pub epoch: u8,
    pub reliable: bool,
}

impl LogicalMessage {
    pub fn from_unreliable(peer_addr: SocketAddr, fragment: Fragment) -> LogicalMessage {
        LogicalMessage {
            peer_addr,
            event_name: fragment.event_name,
            body: fragment.payload,
            epoch: fragment.epoch,
            reliable: false,
        }
    }
}

/// The sink for received messages. Reliable messages of a given peer are passed to
///  `on_message` strictly in the order they were sent, one at a time; there is no ordering
///  across peers, and none for unreliable messages.
///
/// `reply_channel` is the outbound channel to the message's sender.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, message: LogicalMessage, reply_channel: Arc<OutboundChannel>);

    async fn on_session_started(&self, _peer_addr: SocketAddr) {}

    /// called when a session times out or is disconnected explicitly
    async fn on_session_ended(&self, _peer_addr: SocketAddr) {}

    /// called when a peer accepted a join request sent by [crate::end_point::EndPoint::join]
    async fn on_join_accepted(&self, _peer_addr: SocketAddr, _settings: JoinSettings) {}

    /// Raw bytes sent by [crate::end_point::EndPoint::send_bytes]. They are unreliable and
    ///  unordered, like unreliable messages.
    async fn on_bytes(&self, peer_addr: SocketAddr, bytes: Vec<u8>) {
        debug!("no handler for raw bytes - dropping {} bytes from {:?}", bytes.len(), peer_addr);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum DispatcherEvent {
        Message(LogicalMessage),
        SessionStarted(SocketAddr),
        SessionEnded(SocketAddr),
        JoinAccepted(SocketAddr, JoinSettings),
        Bytes(SocketAddr, Vec<u8>),
    }

    #[derive(Default)]
    pub struct CollectingMessageDispatcher {
        pub events: Mutex<Vec<DispatcherEvent>>,
    }
    impl CollectingMessageDispatcher {
        pub fn new() -> CollectingMessageDispatcher {
            Default::default()
        }

        pub async fn messages(&self) -> Vec<LogicalMessage> {
            self.events.lock().await
                .iter()
                .filter_map(|e| match e {
                    DispatcherEvent::Message(m) => Some(m.clone()),
                    _ => None,
                })
                .collect()
        }

        pub async fn assert_bodies(&self, expected_event_name: &str, expected_bodies: Vec<&str>) {
            let messages = self.messages().await;
            assert!(messages.iter().all(|m| m.event_name == expected_event_name), "{:?}", messages);
            assert_eq!(messages.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), expected_bodies);
        }
    }

    #[async_trait]
    impl MessageDispatcher for CollectingMessageDispatcher {
        async fn on_message(&self, message: LogicalMessage, _reply_channel: Arc<OutboundChannel>) {
            self.events.lock().await.push(DispatcherEvent::Message(message));
        }

        async fn on_session_started(&self, peer_addr: SocketAddr) {
            self.events.lock().await.push(DispatcherEvent::SessionStarted(peer_addr));
        }

        async fn on_session_ended(&self, peer_addr: SocketAddr) {
            self.events.lock().await.push(DispatcherEvent::SessionEnded(peer_addr));
        }

        async fn on_join_accepted(&self, peer_addr: SocketAddr, settings: JoinSettings) {
            self.events.lock().await.push(DispatcherEvent::JoinAccepted(peer_addr, settings));
        }

        async fn on_bytes(&self, peer_addr: SocketAddr, bytes: Vec<u8>) {
            self.events.lock().await.push(DispatcherEvent::Bytes(peer_addr, bytes));
        }
    }
}
