use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", datagram.len(), to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::fragment::Fragment;
    use std::sync::Mutex;

    /// records all sent datagrams, decoded, for later inspection
    #[derive(Default)]
    pub struct CollectingSendSocket {
        pub sent: Mutex<Vec<(SocketAddr, Fragment)>>,
    }
    impl CollectingSendSocket {
        pub fn fragments(&self) -> Vec<Fragment> {
            self.sent.lock().unwrap()
                .iter()
                .map(|(_, f)| f.clone())
                .collect()
        }

        pub fn sent_sequences(&self, event_name: &str) -> Vec<u32> {
            self.fragments().into_iter()
                .filter(|f| f.reliable && f.event_name == event_name)
                .map(|f| f.sequence)
                .collect()
        }

        /// sequence numbers of acknowledgments sent
        pub fn acks(&self) -> Vec<u32> {
            self.fragments().into_iter()
                .filter(|f| !f.reliable && f.event_name == crate::control_messages::ACK_EVENT)
                .map(|f| f.payload.parse().unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl SendSocket for CollectingSendSocket {
        async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
            let fragment = Fragment::deser(datagram).unwrap();
            self.sent.lock().unwrap().push((to, fragment));
        }
    }
}
