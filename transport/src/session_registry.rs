use crate::session::{PeerSession, SessionState};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// The table of live sessions by peer address, owned by the end point
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<SocketAddr, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        Default::default()
    }

    pub async fn get(&self, peer_addr: SocketAddr) -> Option<Arc<PeerSession>> {
        self.sessions.read().await
            .get(&peer_addr)
            .cloned()
    }

    /// Returns the session for a peer, creating it if there is none. The flag is `true` if
    ///  the session was created by this call.
    pub async fn get_or_create(&self, peer_addr: SocketAddr, create: impl FnOnce() -> PeerSession) -> (Arc<PeerSession>, bool) {
        if let Some(session) = self.get(peer_addr).await {
            return (session, false);
        }

        let mut sessions = self.sessions.write().await;
        // re-check, the session may have been created while we did not hold the lock
        if let Some(session) = sessions.get(&peer_addr) {
            return (session.clone(), false);
        }

        debug!("creating session for {:?}", peer_addr);
        let session = Arc::new(create());
        sessions.insert(peer_addr, session.clone());
        (session, true)
    }

    pub async fn remove(&self, peer_addr: SocketAddr) -> Option<Arc<PeerSession>> {
        self.sessions.write().await
            .remove(&peer_addr)
    }

    /// Removes all sessions that are idle past their timeout or destroyed, returning them
    pub async fn remove_inactive(&self) -> Vec<Arc<PeerSession>> {
        let mut sessions = self.sessions.write().await;

        let inactive = sessions.iter()
            .filter(|(_, s)| s.state() != SessionState::Active)
            .map(|(addr, _)| *addr)
            .collect::<Vec<_>>();

        inactive.into_iter()
            .filter_map(|addr| sessions.remove(&addr))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.sessions.read().await
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RudpConfig;
    use crate::message_dispatcher::testing::CollectingMessageDispatcher;
    use crate::send_socket::testing::CollectingSendSocket;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], port))
    }

    fn session(peer_addr: SocketAddr) -> PeerSession {
        PeerSession::new(
            peer_addr,
            1,
            &RudpConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))),
            Arc::new(CollectingSendSocket::default()),
            Arc::new(CollectingMessageDispatcher::new()),
        )
    }

    #[test]
    fn test_get_or_create() {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let registry = SessionRegistry::new();
            assert!(registry.get(peer(1)).await.is_none());

            let (first, created) = registry.get_or_create(peer(1), || session(peer(1))).await;
            assert!(created);
            let (second, created) = registry.get_or_create(peer(1), || panic!("must not create twice")).await;
            assert!(!created);
            assert!(Arc::ptr_eq(&first, &second));

            registry.get_or_create(peer(2), || session(peer(2))).await;
            let mut peers = registry.peers().await;
            peers.sort();
            assert_eq!(peers, vec![peer(1), peer(2)]);

            assert!(registry.remove(peer(1)).await.is_some());
            assert!(registry.remove(peer(1)).await.is_none());
            assert_eq!(registry.len().await, 1);
        });
    }

    #[test]
    fn test_remove_inactive() {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let registry = SessionRegistry::new();
            let (idle, _) = registry.get_or_create(peer(1), || session(peer(1))).await;
            let (active, _) = registry.get_or_create(peer(2), || session(peer(2))).await;
            let (destroyed, _) = registry.get_or_create(peer(3), || session(peer(3))).await;
            destroyed.destroy();

            time::sleep(Duration::from_secs(99)).await;
            active.touch();
            time::sleep(Duration::from_secs(1)).await;

            let mut removed = registry.remove_inactive().await
                .iter()
                .map(|s| s.peer_addr())
                .collect::<Vec<_>>();
            removed.sort();
            assert_eq!(removed, vec![idle.peer_addr(), destroyed.peer_addr()]);
            assert_eq!(registry.peers().await, vec![peer(2)]);
            assert!(!registry.is_empty().await);
        });
    }
}
