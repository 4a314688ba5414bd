use crate::config::RudpConfig;
use crate::control_messages::{parse_ack, parse_generation, ControlMessageHandler, JoinSettings, ACK_EVENT, JOIN_EVENT, KEEPALIVE_EVENT, SYNCED_EVENT, SYNC_EVENT};
use crate::fragment::{Datagram, Fragment, DEFAULT_EPOCH};
use crate::message_dispatcher::{LogicalMessage, MessageDispatcher};
use crate::outbound::DeliveryCallback;
use crate::send_socket::SendSocket;
use crate::session::PeerSession;
use crate::session_registry::SessionRegistry;
use std::cmp::max;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::interval;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// EndPoint is the place where all other parts of the protocol come together: It listens on a
///  UdpSocket, dispatching incoming datagrams to the sessions of their senders, and has an API
///  for application code to send messages.
///
/// There is no distinction between client and server: a session is created on first contact,
///  either when a datagram arrives from an unknown peer or when sending to one.
///
/// Every session gets a fresh *generation*, derived from the wall clock and strictly
///  increasing, so a peer can tell a new session (after a disconnect, a timeout or a restart
///  of this node) from the one it knew before and re-initialize its per-peer state.
pub struct EndPoint {
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    self_addr: SocketAddr,
    sessions: SessionRegistry,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<RudpConfig>,
    last_generation: AtomicU64,
}

impl EndPoint {
    pub async fn new(
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<RudpConfig>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        let self_addr = receive_socket.local_addr()?;
        info!("bound receive socket to {:?}", self_addr);

        Ok(Self::from_parts(
            message_dispatcher,
            config,
            receive_socket.clone(),
            Arc::new(receive_socket),
            self_addr,
        ))
    }

    fn from_parts(
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<RudpConfig>,
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        self_addr: SocketAddr,
    ) -> EndPoint {
        let join_settings = JoinSettings {
            max_chunk_size: config.max_chunk_size,
            max_pending_sends: config.max_pending_sends,
        };

        EndPoint {
            receive_socket,
            send_socket,
            self_addr,
            sessions: SessionRegistry::new(),
            message_dispatcher: Arc::new(ControlMessageHandler::new(join_settings, message_dispatcher)),
            config,
            last_generation: AtomicU64::new(0),
        }
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    /// Runs the receive loop and the liveness watchdog, i.e. everything that needs to happen
    ///  in the background. This never returns.
    pub async fn run(&self) {
        select! {
            _ = self.recv_loop() => {}
            _ = self.run_liveness_watchdog() => {}
        }
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            self.on_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
    }

    /// Periodically tears down sessions that were idle for longer than the configured
    ///  timeout. This never returns.
    pub async fn run_liveness_watchdog(&self) {
        info!("starting liveness watchdog");

        let mut watchdog_interval = interval(self.config.watchdog_interval);
        loop {
            watchdog_interval.tick().await;
            self.reap_inactive_sessions().await;
        }
    }

    pub async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!("received datagram from {:?}: {:?}", from, datagram);

        let fragment = match Datagram::deser(datagram) {
            Ok(Datagram::Fragment(fragment)) => fragment,
            Ok(Datagram::RawBytes(bytes)) => {
                self.get_or_create_session(from).await.touch();
                self.message_dispatcher.on_bytes(from, bytes).await;
                return;
            }
            Err(e) => {
                debug!("received malformed datagram from {:?}: {} - dropping", from, e);
                return;
            }
        };

        let session = self.get_or_create_session(from).await;
        session.touch();

        if fragment.reliable {
            if session.peer_generation().is_none() {
                // sent in a session the peer started before this one, so it must not be acknowledged
                debug!("reliable fragment {} from {:?} before the peer announced its generation - dropping", fragment.sequence, from);
                return;
            }
            session.inbound().on_fragment_received(fragment).await;
            return;
        }

        match fragment.event_name.as_str() {
            ACK_EVENT => match parse_ack(&fragment.payload) {
                Ok(sequence) => session.outbound().acknowledge(sequence).await,
                Err(e) => warn!("{} from {:?} - dropping", e, from),
            },
            SYNC_EVENT => match parse_generation(&fragment.payload) {
                Ok(generation) => self.on_sync(session, generation).await,
                Err(e) => warn!("{} from {:?} - dropping", e, from),
            },
            SYNCED_EVENT => match parse_generation(&fragment.payload) {
                Ok(generation) => session.outbound().on_synced(generation),
                Err(e) => warn!("{} from {:?} - dropping", e, from),
            },
            _ => {
                self.message_dispatcher.on_message(
                    LogicalMessage::from_unreliable(from, fragment),
                    session.outbound().clone(),
                ).await;
            }
        }
    }

    /// A peer announced the generation of its session. If it differs from the one recorded
    ///  for the local session, the peer started over (reconnect or restart), and the local
    ///  session is replaced so both sides start numbering from scratch.
    async fn on_sync(&self, session: Arc<PeerSession>, generation: u64) {
        let peer_addr = session.peer_addr();
        let recorded = session.record_peer_generation(generation);

        let session = if recorded == generation {
            session
        }
        else if recorded > generation {
            debug!("peer {:?} announced generation {}, but {} is current - ignoring", peer_addr, generation, recorded);
            return;
        }
        else {
            info!("peer {:?} started a new session (generation {}, was {}) - re-initializing", peer_addr, generation, recorded);
            if let Some(old) = self.sessions.remove(peer_addr).await {
                old.destroy();
                self.message_dispatcher.on_session_ended(peer_addr).await;
            }

            let session = self.get_or_create_session(peer_addr).await;
            session.touch();
            session.record_peer_generation(generation);
            session
        };

        session.outbound().send_synced(generation).await;
    }

    pub async fn send_reliable(&self, to: SocketAddr, event_name: &str, body: &str, on_delivered: Option<DeliveryCallback>) -> anyhow::Result<()> {
        self.get_or_create_session(to).await
            .outbound()
            .send_reliable(event_name, body, on_delivered)
    }

    pub async fn send_reliable_with_epoch(&self, to: SocketAddr, event_name: &str, body: &str, epoch: u8, on_delivered: Option<DeliveryCallback>) -> anyhow::Result<()> {
        self.get_or_create_session(to).await
            .outbound()
            .send_reliable_with_epoch(event_name, body, epoch, on_delivered)
    }

    pub async fn send_unreliable(&self, to: SocketAddr, event_name: &str, body: &str) -> anyhow::Result<()> {
        self.get_or_create_session(to).await
            .outbound()
            .send_unreliable(event_name, body)
            .await
    }

    /// Sends raw bytes as a single datagram, unreliably. The peer receives them through
    ///  [MessageDispatcher::on_bytes].
    pub async fn send_bytes(&self, to: SocketAddr, bytes: &[u8]) -> anyhow::Result<()> {
        self.get_or_create_session(to).await
            .outbound()
            .send_bytes(bytes)
            .await
    }

    /// Asks a peer to accept this node. The peer's reply is reported through
    ///  [MessageDispatcher::on_join_accepted].
    pub async fn join(&self, to: SocketAddr) -> anyhow::Result<()> {
        debug!("sending join request to {:?}", to);
        self.get_or_create_session(to).await
            .outbound()
            .enqueue_reliable(JOIN_EVENT, "", DEFAULT_EPOCH, None)
    }

    /// Keeps this node's session at the peer from timing out without sending application
    ///  data
    pub async fn send_keep_alive(&self, to: SocketAddr) -> anyhow::Result<()> {
        self.get_or_create_session(to).await
            .outbound()
            .transmit_unreliable(KEEPALIVE_EVENT, "")
            .await
    }

    /// Tears down the session with a peer immediately. Returns `false` if there was none.
    pub async fn disconnect(&self, peer_addr: SocketAddr) -> bool {
        let Some(session) = self.sessions.remove(peer_addr).await else {
            return false;
        };

        info!("disconnecting {:?}", peer_addr);
        session.destroy();
        self.message_dispatcher.on_session_ended(peer_addr).await;
        true
    }

    /// Tears down all sessions that timed out, returning their number
    pub async fn reap_inactive_sessions(&self) -> usize {
        let inactive = self.sessions.remove_inactive().await;

        for session in &inactive {
            info!("session with {:?} timed out after {:?} of inactivity", session.peer_addr(), session.idle_for());
            session.destroy();
            self.message_dispatcher.on_session_ended(session.peer_addr()).await;
        }
        inactive.len()
    }

    pub async fn session(&self, peer_addr: SocketAddr) -> Option<Arc<PeerSession>> {
        self.sessions.get(peer_addr).await
    }

    pub async fn num_sessions(&self) -> usize {
        self.sessions.len().await
    }

    /// millis since the unix epoch, but always above the previous generation
    fn next_session_generation(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        match self.last_generation.fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| Some(max(now, prev + 1))) {
            Ok(prev) | Err(prev) => max(now, prev + 1),
        }
    }

    async fn get_or_create_session(&self, peer_addr: SocketAddr) -> Arc<PeerSession> {
        let (session, created) = self.sessions.get_or_create(peer_addr, || PeerSession::new(
            peer_addr,
            self.next_session_generation(),
            self.config.as_ref(),
            self.send_socket.clone(),
            self.message_dispatcher.clone(),
        )).await;

        if created {
            info!("new session with {:?}", peer_addr);
            self.message_dispatcher.on_session_started(peer_addr).await;
        }
        session
    }
}
