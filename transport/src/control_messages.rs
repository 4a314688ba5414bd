use crate::message_dispatcher::{LogicalMessage, MessageDispatcher};
use crate::outbound::OutboundChannel;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Event names starting with this prefix are reserved for control messages. They are handled
///  by the channel itself and never reach the application's dispatcher.
pub const RESERVED_PREFIX: char = '$';

/// Acknowledges a reliable fragment. Sent unreliably, the body is the fragment's sequence
///  number in ascii decimal.
pub const ACK_EVENT: &str = "$ack";

/// Keeps a session alive without carrying data. Sent unreliably.
pub const KEEPALIVE_EVENT: &str = "$alive";

/// Announces the generation of the sender's session, i.e. of its sequence numbering. A peer
///  that still has a session of an older generation tears it down and starts over. Sent
///  unreliably and repeated until confirmed; the body is the generation in ascii decimal.
///
/// Reliable sends of a session are held back until the peer confirmed its generation.
pub const SYNC_EVENT: &str = "$sync";

/// Confirms [SYNC_EVENT], echoing the generation. Sent unreliably.
pub const SYNCED_EVENT: &str = "$synced";

/// Asks a peer to accept this node as a client. Sent reliably with an empty body.
pub const JOIN_EVENT: &str = "$join";

/// Reply to [JOIN_EVENT], sent reliably with the same epoch. The body is serialized
///  [JoinSettings].
pub const WELCOME_EVENT: &str = "$welcome";

pub fn is_reserved(event_name: &str) -> bool {
    event_name.starts_with(RESERVED_PREFIX)
}

pub fn check_application_event_name(event_name: &str) -> anyhow::Result<()> {
    if is_reserved(event_name) {
        bail!("event name {:?} is reserved for control messages", event_name);
    }
    Ok(())
}

pub fn parse_ack(body: &str) -> anyhow::Result<u32> {
    body.parse()
        .map_err(|_| anyhow!("acknowledgment with unparseable sequence number {:?}", body))
}

pub fn parse_generation(body: &str) -> anyhow::Result<u64> {
    match body.parse() {
        Ok(0) | Err(_) => bail!("session sync with invalid generation {:?}", body),
        Ok(generation) => Ok(generation),
    }
}

/// The limits a node announces to peers joining it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinSettings {
    pub max_chunk_size: usize,
    pub max_pending_sends: usize,
}

impl JoinSettings {
    pub fn ser(&self) -> String {
        format!("{},{}", self.max_chunk_size, self.max_pending_sends)
    }

    pub fn deser(body: &str) -> anyhow::Result<JoinSettings> {
        let Some((max_chunk_size, max_pending_sends)) = body.split_once(',') else {
            bail!("join settings without separator: {:?}", body);
        };

        Ok(JoinSettings {
            max_chunk_size: max_chunk_size.trim().parse()?,
            max_pending_sends: max_pending_sends.trim().parse()?,
        })
    }
}

/// Sits between the channels and the application's dispatcher, handling control messages
///  and passing everything else through.
///
/// Acknowledgments are handled directly by the end point because they must bypass the
///  inbound channel.
pub struct ControlMessageHandler {
    join_settings: JoinSettings,
    message_dispatcher: Arc<dyn MessageDispatcher>,
}

impl ControlMessageHandler {
    pub fn new(join_settings: JoinSettings, message_dispatcher: Arc<dyn MessageDispatcher>) -> ControlMessageHandler {
        ControlMessageHandler {
            join_settings,
            message_dispatcher,
        }
    }

    async fn on_control_message(&self, message: LogicalMessage, reply_channel: Arc<OutboundChannel>) {
        match message.event_name.as_str() {
            KEEPALIVE_EVENT => {
                trace!("keep-alive from {:?}", message.peer_addr);
            }
            JOIN_EVENT => {
                debug!("join request from {:?} - replying with {:?}", message.peer_addr, self.join_settings);
                if let Err(e) = reply_channel.enqueue_reliable(WELCOME_EVENT, &self.join_settings.ser(), message.epoch, None) {
                    warn!("could not reply to join request from {:?}: {}", message.peer_addr, e);
                }
            }
            WELCOME_EVENT => {
                match JoinSettings::deser(&message.body) {
                    Ok(settings) => {
                        debug!("join accepted by {:?}: {:?}", message.peer_addr, settings);
                        self.message_dispatcher.on_join_accepted(message.peer_addr, settings).await;
                    }
                    Err(e) => {
                        warn!("received unparseable join reply from {:?}: {}", message.peer_addr, e);
                    }
                }
            }
            other => {
                debug!("unsupported control message {:?} from {:?} - dropping", other, message.peer_addr);
            }
        }
    }
}

#[async_trait]
impl MessageDispatcher for ControlMessageHandler {
    async fn on_message(&self, message: LogicalMessage, reply_channel: Arc<OutboundChannel>) {
        if is_reserved(&message.event_name) {
            self.on_control_message(message, reply_channel).await;
        }
        else {
            self.message_dispatcher.on_message(message, reply_channel).await;
        }
    }

    async fn on_session_started(&self, peer_addr: SocketAddr) {
        self.message_dispatcher.on_session_started(peer_addr).await;
    }

    async fn on_session_ended(&self, peer_addr: SocketAddr) {
        self.message_dispatcher.on_session_ended(peer_addr).await;
    }

    async fn on_bytes(&self, peer_addr: SocketAddr, bytes: Vec<u8>) {
        self.message_dispatcher.on_bytes(peer_addr, bytes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectiveOutboundConfig;
    use crate::message_dispatcher::testing::{CollectingMessageDispatcher, DispatcherEvent};
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_socket::testing::CollectingSendSocket;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time;

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

    #[rstest]
    #[case::ack("$ack", true)]
    #[case::unknown("$whatever", true)]
    #[case::plain("chat", false)]
    #[case::dollar_inside("pay$", false)]
    #[case::empty("", false)]
    fn test_is_reserved(#[case] event_name: &str, #[case] expected: bool) {
        assert_eq!(is_reserved(event_name), expected);
        assert_eq!(check_application_event_name(event_name).is_err(), expected);
    }

    #[rstest]
    #[case::simple("200,10000", Some(JoinSettings { max_chunk_size: 200, max_pending_sends: 10000 }))]
    #[case::whitespace(" 5 , 7", Some(JoinSettings { max_chunk_size: 5, max_pending_sends: 7 }))]
    #[case::no_separator("200", None)]
    #[case::not_a_number("a,b", None)]
    #[case::empty("", None)]
    fn test_join_settings_deser(#[case] body: &str, #[case] expected: Option<JoinSettings>) {
        assert_eq!(JoinSettings::deser(body).ok(), expected);
    }

    #[test]
    fn test_join_settings_ser() {
        assert_eq!(JoinSettings { max_chunk_size: 200, max_pending_sends: 10000 }.ser(), "200,10000");
    }

    #[rstest]
    #[case::timestamp("1760000000000", Some(1760000000000))]
    #[case::zero("0", None)]
    #[case::negative("-5", None)]
    #[case::empty("", None)]
    fn test_parse_generation(#[case] body: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_generation(body).ok(), expected);
    }

    #[rstest]
    #[case::valid("42", Some(42))]
    #[case::negative("-1", None)]
    #[case::garbage("x", None)]
    fn test_parse_ack(#[case] body: &str, #[case] expected: Option<u32>) {
        assert_eq!(parse_ack(body).ok(), expected);
    }

    #[test]
    fn test_application_messages_pass_through() {
        let mut app = MockMessageDispatcher::new();
        app.expect_on_message()
            .withf(|m, _| m.event_name == "chat" && m.body == "hi")
            .times(1)
            .return_const(());

        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async move {
            let handler = ControlMessageHandler::new(JoinSettings { max_chunk_size: 200, max_pending_sends: 10 }, Arc::new(app));
            handler.on_message(message("chat", "hi", 1), reply_channel(Arc::new(CollectingSendSocket::default()))).await;
            handler.on_message(message("$alive", "", 0), reply_channel(Arc::new(CollectingSendSocket::default()))).await;
            handler.on_message(message("$nonsense", "", 0), reply_channel(Arc::new(CollectingSendSocket::default()))).await;
        });
    }

    #[test]
    fn test_bytes_pass_through() {
        let mut app = MockMessageDispatcher::new();
        app.expect_on_bytes()
            .withf(|peer_addr, bytes| *peer_addr == peer() && bytes == &vec![1u8, 2, 3])
            .times(1)
            .return_const(());

        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async move {
            let handler = ControlMessageHandler::new(JoinSettings { max_chunk_size: 200, max_pending_sends: 10 }, Arc::new(app));
            handler.on_bytes(peer(), vec![1, 2, 3]).await;
        });
    }

    #[test]
    fn test_join_is_answered_with_settings() {
        let send_socket = Arc::new(CollectingSendSocket::default());

        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let app = Arc::new(CollectingMessageDispatcher::new());
            let handler = ControlMessageHandler::new(JoinSettings { max_chunk_size: 200, max_pending_sends: 10000 }, app.clone());

            handler.on_message(message(JOIN_EVENT, "", 9), reply_channel(send_socket.clone())).await;
            time::sleep(Duration::from_millis(10)).await;

            let sent = send_socket.fragments();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].event_name, WELCOME_EVENT);
            assert_eq!(sent[0].payload, "200,10000");
            assert_eq!(sent[0].epoch, 9);
            assert!(sent[0].reliable);
            assert!(app.events.lock().await.is_empty());
        });
    }

    #[test]
    fn test_welcome_is_reported() {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let app = Arc::new(CollectingMessageDispatcher::new());
            let handler = ControlMessageHandler::new(JoinSettings { max_chunk_size: 200, max_pending_sends: 10 }, app.clone());

            handler.on_message(message(WELCOME_EVENT, "100,50", 1), reply_channel(Arc::new(CollectingSendSocket::default()))).await;
            handler.on_message(message(WELCOME_EVENT, "garbage", 1), reply_channel(Arc::new(CollectingSendSocket::default()))).await;

            assert_eq!(
                *app.events.lock().await,
                vec![DispatcherEvent::JoinAccepted(peer(), JoinSettings { max_chunk_size: 100, max_pending_sends: 50 })],
            );
        });
    }
}
