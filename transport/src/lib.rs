//! A reliable, ordered, fragmenting message channel on top of UDP, designed as the transport
//!  layer of real-time multiplayer game servers.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*, i.e. an event name plus a text body,
//!   rather than streams of bytes
//! * Each message is sent either *reliably* or *unreliably*:
//!   * reliable messages are delivered exactly once and strictly in the order they were sent
//!     (per peer - there is no ordering across peers). They are split into fragments that are
//!     acknowledged individually and re-sent until acknowledged.
//!   * unreliable messages are sent as a single datagram, once, without acknowledgment (e.g.
//!     high-frequency position updates where only the latest value matters)
//! * There is no explicit connection handshake: a node creates a *session* for a peer on first
//!   contact, and sessions are torn down when the peer stays silent for a configurable timeout
//! * Simple and robust rather than maximising throughput: fixed-interval retransmission, no
//!   congestion control, no sliding window
//!
//! Explicitly *not* goals: encryption, NAT traversal, congestion control, multi-path delivery.
//!
//! ## Fragments
//!
//! Every datagram carries exactly one fragment - see [fragment::Fragment] for the wire format.
//!  Sequence numbers are transmitted as ascii-decimal digits, and all strings are UTF-8.
//!
//! A reliable message is split into chunks of at most `max_chunk_size` bytes (200 by default),
//!  and each chunk becomes a fragment with its own sequence number. Sequence numbers of a
//!  message's fragments are contiguous. The first fragment (the *starter*) carries the total
//!  number of fragments, later fragments carry the number of fragments remaining including
//!  themselves.
//!
//! An empty body is still sent as a single (empty) fragment.
//!
//! ## Acknowledgment and retransmission
//!
//! The receiver acknowledges each reliable fragment as soon as it arrives by sending an
//!  unreliable `$ack` control message with the fragment's sequence number as its body. Fragments
//!  that were received before are acknowledged again, since the previous acknowledgment may
//!  have been lost.
//!
//! The sender re-sends every fragment at a fixed interval (250ms by default) until it is
//!  acknowledged or the session is torn down. There is no backoff and no retry limit. The
//!  application can register a callback for a reliable send that is called once all of its
//!  fragments were acknowledged.
//!
//! ## Reassembly
//!
//! The receiver buffers fragments and periodically checks if the message starting at the next
//!  expected sequence number is complete. If it is, the message is delivered and the next
//!  expected sequence number advances past it; if it is not, delivery stalls until the missing
//!  fragments arrive. Messages are therefore never delivered partially or out of order.
//!
//! ## Control messages
//!
//! Event names starting with `$` are reserved for control messages:
//! * `$ack`: acknowledgment, see above
//! * `$alive`: keeps a session alive without sending application data
//! * `$join`: asks a peer for its settings. It replies with `$welcome` and a body of
//!   `<max chunk size>,<max pending sends>`.
//! * `$sync` / `$synced`: session generation handshake, see below
//!
//! ## Session generations
//!
//! Sequence numbers start at 0 in every session, so a receiver must not mistake the fragments
//!  of a new session for duplicates from an old one. Each session therefore has a *generation*
//!  (millis since the epoch, strictly increasing per end point). A new session announces it
//!  with unreliable `$sync` messages until the peer confirms with `$synced`, and holds back
//!  reliable fragments until then. The receiving side drops (without acknowledging) reliable
//!  fragments from a peer that has not announced its generation yet, and replaces its session
//!  when a peer announces a newer generation.
//!
//! ## Raw bytes
//!
//! Besides messages, an end point can send arbitrary bytes in a single unreliable datagram
//!  (tag byte 255 followed by the bytes), reported through
//!  [message_dispatcher::MessageDispatcher::on_bytes].
//!
//! ## Epochs
//!
//! Every reliable send carries a small *epoch* tag (1 by default, at most 253). It is delivered
//!  with the message, and replies from a [listener_registry::ListenerRegistry] carry the epoch
//!  of the request, allowing clients to correlate replies with requests.

pub mod config;
pub mod control_messages;
pub mod end_point;
pub mod fragment;
pub mod inbound;
pub mod listener_registry;
pub mod message_dispatcher;
pub mod outbound;
pub mod send_socket;
pub mod session;
pub mod session_registry;
