use crate::config::EffectiveOutboundConfig;
use crate::control_messages::{check_application_event_name, ACK_EVENT, SYNCED_EVENT, SYNC_EVENT};
use crate::fragment::{reliable_fragments, split_into_chunks, Datagram, Fragment, DEFAULT_EPOCH, MAX_EPOCH, MAX_EVENT_NAME_LEN, MAX_FRAGMENTS_PER_MESSAGE};
use crate::send_socket::SendSocket;
use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::{interval, Instant};
use tracing::{debug, error, trace, warn};

/// Called with the starter sequence number once every fragment of a reliable send was
///  acknowledged by the peer
pub type DeliveryCallback = Box<dyn FnOnce(u32) + Send + Sync + 'static>;

struct PendingSend {
    event_name: String,
    body: String,
    epoch: u8,
    on_delivered: Option<DeliveryCallback>,
}

struct PendingCompletion {
    outstanding: usize,
    callback: DeliveryCallback,
}

struct OutboundChannelInner {
    next_sequence: u32,
    /// fragments that are being (re-)transmitted, and whether they were acknowledged
    in_flight: FxHashMap<u32, bool>,
    /// completion callbacks by starter sequence
    completions: FxHashMap<u32, PendingCompletion>,
    /// starter sequence of each unacknowledged fragment that belongs to a send with a callback
    starter_of: FxHashMap<u32, u32>,
}

impl OutboundChannelInner {
    fn register_send(&mut self, pending: PendingSend, max_chunk_size: usize) -> Vec<Fragment> {
        let first_sequence = self.next_sequence;
        let chunks = split_into_chunks(&pending.body, max_chunk_size);
        let fragments = reliable_fragments(first_sequence, &pending.event_name, &chunks, pending.epoch);

        self.next_sequence = first_sequence.wrapping_add(fragments.len() as u32);

        for fragment in &fragments {
            self.in_flight.insert(fragment.sequence, false);
        }
        if let Some(callback) = pending.on_delivered {
            for fragment in &fragments {
                self.starter_of.insert(fragment.sequence, first_sequence);
            }
            self.completions.insert(first_sequence, PendingCompletion {
                outstanding: fragments.len(),
                callback,
            });
        }
        fragments
    }

    fn is_acknowledged(&self, sequence: u32) -> bool {
        self.in_flight.get(&sequence)
            .cloned()
            .unwrap_or(true)
    }

    /// Marks a fragment as acknowledged, returning the send's completion callback if this was
    ///  the last outstanding fragment of a send that has one
    fn on_ack(&mut self, sequence: u32) -> Option<(u32, DeliveryCallback)> {
        match self.in_flight.get_mut(&sequence) {
            Some(acked) if !*acked => *acked = true,
            Some(_) => {
                trace!("fragment {} is already acknowledged", sequence);
                return None;
            }
            None => {
                trace!("acknowledgment for fragment {} which is not in flight - ignoring", sequence);
                return None;
            }
        }

        let starter = self.starter_of.remove(&sequence)?;
        let completion = self.completions.get_mut(&starter)?;
        completion.outstanding -= 1;
        if completion.outstanding > 0 {
            return None;
        }
        self.completions.remove(&starter)
            .map(|c| (starter, c.callback))
    }
}

/// The sending half of a peer session. Reliable sends are queued and picked up by a
///  periodic 'pump' task which splits them into fragments. Each fragment is then re-sent by its
///  own task at a fixed interval until it is acknowledged or the channel is destroyed.
///
/// Unreliable sends bypass the queue and are transmitted exactly once.
///
/// A channel that requires a handshake holds back reliable sends until the peer confirmed the
///  channel's generation, see [SYNC_EVENT]. Until then the pump announces the generation once
///  per retransmit interval.
pub struct OutboundChannel {
    config: Arc<EffectiveOutboundConfig>,
    peer_addr: SocketAddr,
    send_socket: Arc<dyn SendSocket>,
    inner: Arc<RwLock<OutboundChannelInner>>,
    destroyed: Arc<AtomicBool>,
    handshake_generation: Option<u64>,
    synced: Arc<AtomicBool>,
    send_queue: mpsc::Sender<PendingSend>,
    send_queue_receiver: Option<mpsc::Receiver<PendingSend>>,
    pump_handle: Option<JoinHandle<()>>,
}

impl Drop for OutboundChannel {
    fn drop(&mut self) {
        self.destroyed.store(true, Ordering::Release);
        if let Some(handle) = self.pump_handle.take() {
            handle.abort();
        }
    }
}

impl OutboundChannel {
    pub fn new(
        config: Arc<EffectiveOutboundConfig>,
        peer_addr: SocketAddr,
        send_socket: Arc<dyn SendSocket>,
    ) -> OutboundChannel {
        let (send_queue, send_queue_receiver) = mpsc::channel(config.max_pending_sends);

        OutboundChannel {
            config,
            peer_addr,
            send_socket,
            inner: Arc::new(RwLock::new(OutboundChannelInner {
                next_sequence: 0,
                in_flight: FxHashMap::default(),
                completions: FxHashMap::default(),
                starter_of: FxHashMap::default(),
            })),
            destroyed: Default::default(),
            handshake_generation: None,
            synced: Arc::new(AtomicBool::new(true)),
            send_queue,
            send_queue_receiver: Some(send_queue_receiver),
            pump_handle: None,
        }
    }

    /// Must be called before the pump is spawned
    pub fn require_handshake(&mut self, generation: u64) {
        if self.pump_handle.is_some() {
            warn!("handshake required after the pump was spawned - ignoring");
            return;
        }
        self.handshake_generation = Some(generation);
        self.synced.store(false, Ordering::Release);
    }

    pub fn spawn_pump(&mut self) {
        let Some(send_queue_receiver) = self.send_queue_receiver.take() else {
            warn!("pump already spawned");
            return;
        };

        self.pump_handle = Some(tokio::spawn(Self::do_pump(
            self.config.clone(),
            self.peer_addr,
            self.send_socket.clone(),
            self.inner.clone(),
            self.destroyed.clone(),
            self.handshake_generation,
            self.synced.clone(),
            send_queue_receiver,
        )));
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn generation(&self) -> Option<u64> {
        self.handshake_generation
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Handles the peer's confirmation of a generation. Confirmations for other generations
    ///  are stale and ignored.
    pub fn on_synced(&self, generation: u64) {
        if self.handshake_generation != Some(generation) {
            debug!("confirmation of generation {} from {:?} does not match {:?} - ignoring", generation, self.peer_addr, self.handshake_generation);
            return;
        }
        if !self.synced.swap(true, Ordering::AcqRel) {
            debug!("{:?} confirmed generation {} - releasing reliable sends", self.peer_addr, generation);
        }
    }

    /// Queues a message for reliable delivery with the default epoch. This returns immediately,
    ///  the actual sending happens in the background.
    pub fn send_reliable(&self, event_name: &str, body: &str, on_delivered: Option<DeliveryCallback>) -> anyhow::Result<()> {
        self.send_reliable_with_epoch(event_name, body, DEFAULT_EPOCH, on_delivered)
    }

    pub fn send_reliable_with_epoch(&self, event_name: &str, body: &str, epoch: u8, on_delivered: Option<DeliveryCallback>) -> anyhow::Result<()> {
        check_application_event_name(event_name)?;
        self.enqueue_reliable(event_name, body, epoch, on_delivered)
    }

    /// Sends a message as a single datagram, once and without acknowledgment
    pub async fn send_unreliable(&self, event_name: &str, body: &str) -> anyhow::Result<()> {
        check_application_event_name(event_name)?;
        self.transmit_unreliable(event_name, body).await
    }

    /// Sends raw bytes as a single datagram, once and without acknowledgment
    pub async fn send_bytes(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if self.is_destroyed() {
            bail!("outbound channel to {:?} is destroyed", self.peer_addr);
        }
        if Datagram::RAW_BYTES_HEADER_LEN + bytes.len() > self.config.max_datagram_size {
            bail!("{} raw bytes do not fit into a single datagram of {} bytes", bytes.len(), self.config.max_datagram_size);
        }

        let mut buf = BytesMut::new();
        Datagram::ser_raw_bytes(bytes, &mut buf);
        self.send_socket.send_datagram(self.peer_addr, &buf).await;
        Ok(())
    }

    /// Handles an acknowledgment from the peer. Unknown and repeated acknowledgments are
    ///  ignored.
    pub async fn acknowledge(&self, sequence: u32) {
        if self.is_destroyed() {
            return;
        }

        let completed = self.inner.write().await
            .on_ack(sequence);

        if let Some((starter, callback)) = completed {
            debug!("all fragments of the send starting at {} were acknowledged by {:?}", starter, self.peer_addr);
            callback(starter);
        }
    }

    /// Stops the pump and all retransmissions at their next wake-up. Pending completion
    ///  callbacks are never called.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            debug!("destroying outbound channel to {:?}", self.peer_addr);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub async fn num_in_flight(&self) -> usize {
        self.inner.read().await.in_flight.len()
    }

    /// no check for reserved event names, this is used for control messages
    pub(crate) fn enqueue_reliable(&self, event_name: &str, body: &str, epoch: u8, on_delivered: Option<DeliveryCallback>) -> anyhow::Result<()> {
        if self.is_destroyed() {
            bail!("outbound channel to {:?} is destroyed", self.peer_addr);
        }
        Self::check_event_name_len(event_name)?;
        if epoch > MAX_EPOCH {
            bail!("epoch {} exceeds the maximum of {}", epoch, MAX_EPOCH);
        }
        let num_fragments = split_into_chunks(body, self.config.max_chunk_size).len();
        if num_fragments > MAX_FRAGMENTS_PER_MESSAGE {
            bail!("message body of {} bytes would be split into {} fragments, the maximum is {}", body.len(), num_fragments, MAX_FRAGMENTS_PER_MESSAGE);
        }

        trace!("queueing reliable message {:?} of {} bytes for {:?}", event_name, body.len(), self.peer_addr);
        let pending = PendingSend {
            event_name: event_name.to_string(),
            body: body.to_string(),
            epoch,
            on_delivered,
        };
        match self.send_queue.try_send(pending) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => bail!("send queue for {:?} is full", self.peer_addr),
            Err(TrySendError::Closed(_)) => bail!("outbound channel to {:?} is closed", self.peer_addr),
        }
    }

    pub(crate) async fn transmit_unreliable(&self, event_name: &str, body: &str) -> anyhow::Result<()> {
        if self.is_destroyed() {
            bail!("outbound channel to {:?} is destroyed", self.peer_addr);
        }
        Self::check_event_name_len(event_name)?;

        let fragment = Fragment::unreliable(event_name, body);
        if fragment.serialized_len() > self.config.max_datagram_size {
            bail!("unreliable message of {} bytes does not fit into a single datagram of {} bytes", fragment.serialized_len(), self.config.max_datagram_size);
        }

        let mut buf = BytesMut::new();
        fragment.ser(&mut buf);
        self.send_socket.send_datagram(self.peer_addr, &buf).await;
        Ok(())
    }

    pub(crate) async fn send_ack(&self, sequence: u32) {
        trace!("acknowledging fragment {} to {:?}", sequence, self.peer_addr);
        if let Err(e) = self.transmit_unreliable(ACK_EVENT, &sequence.to_string()).await {
            debug!("not acknowledging fragment {}: {}", sequence, e);
        }
    }

    pub(crate) async fn send_synced(&self, generation: u64) {
        trace!("confirming generation {} to {:?}", generation, self.peer_addr);
        if let Err(e) = self.transmit_unreliable(SYNCED_EVENT, &generation.to_string()).await {
            debug!("not confirming generation {}: {}", generation, e);
        }
    }

    fn check_event_name_len(event_name: &str) -> anyhow::Result<()> {
        if event_name.len() > MAX_EVENT_NAME_LEN {
            bail!("event name has {} bytes, the maximum is {}", event_name.len(), MAX_EVENT_NAME_LEN);
        }
        Ok(())
    }

    async fn do_pump(
        config: Arc<EffectiveOutboundConfig>,
        peer_addr: SocketAddr,
        send_socket: Arc<dyn SendSocket>,
        inner: Arc<RwLock<OutboundChannelInner>>,
        destroyed: Arc<AtomicBool>,
        handshake_generation: Option<u64>,
        synced: Arc<AtomicBool>,
        mut send_queue: mpsc::Receiver<PendingSend>,
    ) {
        let mut pump_interval = interval(config.pump_interval);
        let mut last_sync: Option<Instant> = None;

        loop {
            pump_interval.tick().await;
            if destroyed.load(Ordering::Acquire) {
                debug!("outbound channel to {:?} destroyed - stopping pump", peer_addr);
                break;
            }

            if !synced.load(Ordering::Acquire) {
                let Some(generation) = handshake_generation else {
                    continue;
                };
                if last_sync.map_or(true, |t| t.elapsed() >= config.retransmit_interval) {
                    trace!("announcing generation {} to {:?}", generation, peer_addr);
                    let mut buf = BytesMut::new();
                    Fragment::unreliable(SYNC_EVENT, &generation.to_string()).ser(&mut buf);
                    send_socket.send_datagram(peer_addr, &buf).await;
                    last_sync = Some(Instant::now());
                }
                continue;
            }

            while let Ok(pending) = send_queue.try_recv() {
                let fragments = inner.write().await
                    .register_send(pending, config.max_chunk_size);

                for fragment in fragments {
                    tokio::spawn(Self::retransmit_until_acknowledged(
                        config.retransmit_interval,
                        peer_addr,
                        send_socket.clone(),
                        inner.clone(),
                        destroyed.clone(),
                        fragment,
                    ));
                }
            }
        }
    }

    async fn retransmit_until_acknowledged(
        retransmit_interval: time::Duration,
        peer_addr: SocketAddr,
        send_socket: Arc<dyn SendSocket>,
        inner: Arc<RwLock<OutboundChannelInner>>,
        destroyed: Arc<AtomicBool>,
        fragment: Fragment,
    ) {
        let mut buf = BytesMut::new();
        fragment.ser(&mut buf);

        let mut num_transmissions = 0usize;
        loop {
            if destroyed.load(Ordering::Acquire) {
                trace!("channel destroyed - stopping retransmission of fragment {}", fragment.sequence);
                break;
            }
            if inner.read().await.is_acknowledged(fragment.sequence) {
                trace!("fragment {} acknowledged after {} transmission(s)", fragment.sequence, num_transmissions);
                break;
            }

            if num_transmissions > 0 {
                trace!("re-sending unacknowledged fragment {} to {:?}", fragment.sequence, peer_addr);
            }
            send_socket.send_datagram(peer_addr, &buf).await;
            num_transmissions += 1;

            time::sleep(retransmit_interval).await;
        }

        if inner.write().await.in_flight.remove(&fragment.sequence).is_none() {
            error!("fragment {} was not registered as in flight", fragment.sequence);
        }
    }
}
