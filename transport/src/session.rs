use crate::config::RudpConfig;
use crate::inbound::InboundChannel;
use crate::message_dispatcher::MessageDispatcher;
use crate::outbound::OutboundChannel;
use crate::send_socket::SendSocket;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// the idle timeout elapsed, but the session was not torn down yet
    IdleTimeoutPending,
    Destroyed,
}

/// All per-peer state: the outbound and inbound channels and the time of the peer's last
///  activity. A session is torn down as a whole, there is no half-open state.
///
/// Each side of a session has a *generation* that identifies its sequence numbering. The
///  local generation is announced to the peer by the outbound channel; the peer's generation
///  is recorded when the peer announces it, and reliable fragments are only accepted after
///  that.
pub struct PeerSession {
    peer_addr: SocketAddr,
    /// 0 while the peer did not announce its generation
    peer_generation: AtomicU64,
    outbound: Arc<OutboundChannel>,
    inbound: InboundChannel,
    idle_timeout: Duration,
    created_at: Instant,
    /// millis since `created_at`
    last_activity: AtomicU64,
}

impl PeerSession {
    /// Creates both channels and spawns their background tasks
    pub fn new(
        peer_addr: SocketAddr,
        generation: u64,
        config: &RudpConfig,
        send_socket: Arc<dyn SendSocket>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> PeerSession {
        let mut outbound = OutboundChannel::new(
            Arc::new(config.get_effective_outbound_config()),
            peer_addr,
            send_socket,
        );
        outbound.require_handshake(generation);
        outbound.spawn_pump();
        let outbound = Arc::new(outbound);

        let mut inbound = InboundChannel::new(
            Arc::new(config.get_effective_inbound_config()),
            peer_addr,
            outbound.clone(),
            message_dispatcher,
        );
        inbound.spawn_reassembly_loop();

        PeerSession {
            peer_addr,
            peer_generation: AtomicU64::new(0),
            outbound,
            inbound,
            idle_timeout: config.session_idle_timeout,
            created_at: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_generation(&self) -> Option<u64> {
        match self.peer_generation.load(Ordering::Acquire) {
            0 => None,
            generation => Some(generation),
        }
    }

    /// Records the peer's generation if none was recorded yet, returning the recorded one
    pub fn record_peer_generation(&self, generation: u64) -> u64 {
        match self.peer_generation.compare_exchange(0, generation, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                debug!("peer {:?} announced generation {}", self.peer_addr, generation);
                generation
            }
            Err(recorded) => recorded,
        }
    }

    pub fn outbound(&self) -> &Arc<OutboundChannel> {
        &self.outbound
    }

    pub fn inbound(&self) -> &InboundChannel {
        &self.inbound
    }

    pub fn touch(&self) {
        self.last_activity.fetch_max(self.millis_since_creation(), Ordering::AcqRel);
    }

    pub fn idle_for(&self) -> Duration {
        let idle_millis = self.millis_since_creation()
            .saturating_sub(self.last_activity.load(Ordering::Acquire));
        Duration::from_millis(idle_millis)
    }

    pub fn state(&self) -> SessionState {
        if self.is_destroyed() {
            SessionState::Destroyed
        }
        else if self.idle_for() >= self.idle_timeout {
            SessionState::IdleTimeoutPending
        }
        else {
            SessionState::Active
        }
    }

    pub fn destroy(&self) {
        debug!("destroying session with {:?}", self.peer_addr);
        self.outbound.destroy();
        self.inbound.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.outbound.is_destroyed() && self.inbound.is_destroyed()
    }

    fn millis_since_creation(&self) -> u64 {
        u64::try_from(self.created_at.elapsed().as_millis())
            .unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_dispatcher::testing::CollectingMessageDispatcher;
    use crate::send_socket::testing::CollectingSendSocket;
    use tokio::runtime::Builder;
    use tokio::time;

    fn session() -> PeerSession {
        PeerSession::new(
            SocketAddr::from(([1, 2, 3, 4], 9)),
            5,
            &RudpConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))),
            Arc::new(CollectingSendSocket::default()),
            Arc::new(CollectingMessageDispatcher::new()),
        )
    }

    #[test]
    fn test_idle_timeout() {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let session = session();
            assert_eq!(session.state(), SessionState::Active);

            time::sleep(Duration::from_secs(60)).await;
            assert_eq!(session.state(), SessionState::Active);
            assert!(session.idle_for() >= Duration::from_secs(60));
            assert!(session.idle_for() < Duration::from_secs(61));

            session.touch();
            assert_eq!(session.idle_for(), Duration::ZERO);

            time::sleep(Duration::from_secs(99)).await;
            assert_eq!(session.state(), SessionState::Active);

            time::sleep(Duration::from_secs(1)).await;
            assert_eq!(session.state(), SessionState::IdleTimeoutPending);
        });
    }

    #[test]
    fn test_peer_generation() {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let session = session();
            assert_eq!(session.peer_generation(), None);
            assert_eq!(session.outbound().generation(), Some(5));
            assert!(!session.outbound().is_synced());

            assert_eq!(session.record_peer_generation(12), 12);
            assert_eq!(session.record_peer_generation(13), 12);
            assert_eq!(session.peer_generation(), Some(12));
        });
    }

    #[test]
    fn test_destroy() {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let session = session();
            session.destroy();

            assert!(session.is_destroyed());
            assert!(session.outbound().is_destroyed());
            assert!(session.inbound().is_destroyed());
            assert_eq!(session.state(), SessionState::Destroyed);
            assert!(session.outbound().send_reliable("e", "x", None).is_err());
        });
    }
}
