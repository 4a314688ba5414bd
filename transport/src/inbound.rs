use crate::config::EffectiveInboundConfig;
use crate::fragment::Fragment;
use crate::message_dispatcher::{LogicalMessage, MessageDispatcher};
use crate::outbound::OutboundChannel;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace, warn};

struct InboundChannelInner {
    peer_addr: SocketAddr,

    /// The sequence at which the next logical message must start. Everything below it was
    ///  consumed into delivered messages.
    next_expected: u32,

    /// sequences at or above `next_expected` that were received already
    known: FxHashSet<u32>,

    /// fragments received since the last reassembly pass, in arrival order
    arrivals: Vec<Fragment>,

    /// received fragments that are not part of a delivered message yet
    ordered: BTreeMap<u32, Fragment>,
}

impl InboundChannelInner {
    fn new(peer_addr: SocketAddr) -> InboundChannelInner {
        InboundChannelInner {
            peer_addr,
            next_expected: 0,
            known: FxHashSet::default(),
            arrivals: Vec::new(),
            ordered: BTreeMap::new(),
        }
    }

    fn is_known(&self, sequence: u32) -> bool {
        sequence < self.next_expected || self.known.contains(&sequence)
    }

    /// returns `true` if the fragment was new
    fn on_fragment(&mut self, fragment: Fragment) -> bool {
        if self.is_known(fragment.sequence) {
            return false;
        }
        self.known.insert(fragment.sequence);
        self.arrivals.push(fragment);
        true
    }

    /// Moves arrivals into the ordered buffer and extracts all complete messages that start
    ///  at `next_expected`, in order. Reassembly stalls at the first gap and at a fragment that
    ///  is not a message's first fragment.
    fn reassemble(&mut self) -> Vec<LogicalMessage> {
        for fragment in self.arrivals.drain(..) {
            self.ordered.insert(fragment.sequence, fragment);
        }

        let mut result = Vec::new();
        while let Some(message) = self.try_consume_next_message() {
            result.push(message);
        }
        result
    }

    fn try_consume_next_message(&mut self) -> Option<LogicalMessage> {
        let starter = self.ordered.get(&self.next_expected)?;
        if !starter.is_first {
            trace!("fragment {} from {:?} is not the start of a message - waiting", self.next_expected, self.peer_addr);
            return None;
        }

        let count = starter.remaining_count;
        let complete = (0..count)
            .all(|offs| self.ordered.contains_key(&self.next_expected.wrapping_add(offs)));
        if !complete {
            trace!("message starting at {} from {:?} is incomplete - waiting", self.next_expected, self.peer_addr);
            return None;
        }

        let first_sequence = self.next_expected;
        let event_name = starter.event_name.clone();
        let epoch = starter.epoch;

        let mut body = String::new();
        for offs in 0..count {
            let sequence = first_sequence.wrapping_add(offs);
            self.known.remove(&sequence);
            let Some(fragment) = self.ordered.remove(&sequence) else {
                continue;
            };

            if fragment.remaining_count != count - offs {
                warn!("fragment {} from {:?} has remaining count {}, expected {} - delivering anyway", sequence, self.peer_addr, fragment.remaining_count, count - offs);
            }
            if fragment.event_name != event_name {
                warn!("fragment {} from {:?} has event name {:?} in a message {:?} - delivering anyway", sequence, self.peer_addr, fragment.event_name, event_name);
            }
            body.push_str(&fragment.payload);
        }
        self.next_expected = first_sequence.wrapping_add(count);

        debug!("reassembled message {:?} of {} fragment(s) starting at {} from {:?}", event_name, count, first_sequence, self.peer_addr);
        Some(LogicalMessage {
            peer_addr: self.peer_addr,
            event_name,
            body,
            epoch,
            reliable: true,
        })
    }
}

/// The receiving half of a peer session. Incoming reliable fragments are acknowledged
///  immediately and buffered; a periodic task reassembles them into logical messages and
///  delivers those to the dispatcher strictly in send order.
///
/// A fragment that was received before is acknowledged again (the previous acknowledgment may
///  have been lost) but otherwise ignored.
pub struct InboundChannel {
    config: Arc<EffectiveInboundConfig>,
    peer_addr: SocketAddr,
    inner: Arc<RwLock<InboundChannelInner>>,
    ack_channel: Arc<OutboundChannel>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    destroyed: Arc<AtomicBool>,
    active_handle: Option<JoinHandle<()>>,
}

impl Drop for InboundChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.active_handle.take() {
            handle.abort();
        }
    }
}

impl InboundChannel {
    pub fn new(
        config: Arc<EffectiveInboundConfig>,
        peer_addr: SocketAddr,
        ack_channel: Arc<OutboundChannel>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> InboundChannel {
        InboundChannel {
            config,
            peer_addr,
            inner: Arc::new(RwLock::new(InboundChannelInner::new(peer_addr))),
            ack_channel,
            message_dispatcher,
            destroyed: Default::default(),
            active_handle: None,
        }
    }

    pub fn spawn_reassembly_loop(&mut self) {
        if self.active_handle.is_some() {
            warn!("reassembly loop already spawned");
            return;
        }
        self.active_handle = Some(tokio::spawn(Self::do_reassembly_loop(
            self.config.clone(),
            self.inner.clone(),
            self.ack_channel.clone(),
            self.message_dispatcher.clone(),
            self.destroyed.clone(),
        )));
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn on_fragment_received(&self, fragment: Fragment) {
        if self.is_destroyed() {
            trace!("inbound channel from {:?} is destroyed - dropping fragment {}", self.peer_addr, fragment.sequence);
            return;
        }

        let sequence = fragment.sequence;
        let is_new = self.inner.write().await
            .on_fragment(fragment);

        if is_new {
            trace!("received fragment {} from {:?}", sequence, self.peer_addr);
        }
        else {
            debug!("received duplicate fragment {} from {:?} - re-acknowledging", sequence, self.peer_addr);
        }
        self.ack_channel.send_ack(sequence).await;
    }

    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            debug!("destroying inbound channel from {:?}", self.peer_addr);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// the sequence at which the next message is expected to start
    pub async fn next_expected(&self) -> u32 {
        self.inner.read().await.next_expected
    }

    async fn do_reassembly_loop(
        config: Arc<EffectiveInboundConfig>,
        inner: Arc<RwLock<InboundChannelInner>>,
        reply_channel: Arc<OutboundChannel>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        destroyed: Arc<AtomicBool>,
    ) {
        let mut reassembly_interval = interval(config.reassembly_interval);

        loop {
            reassembly_interval.tick().await;
            if destroyed.load(Ordering::Acquire) {
                debug!("inbound channel destroyed - stopping reassembly");
                break;
            }

            let messages = inner.write().await
                .reassemble();

            // one at a time to preserve ordering
            for message in messages {
                message_dispatcher.on_message(message, reply_channel.clone()).await;
            }
        }
    }
}
