use std::cmp::max;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::fragment::{Fragment, MAX_EVENT_NAME_LEN, MAX_SEQUENCE_DIGITS};

pub struct RudpConfig {
    pub self_addr: SocketAddr,

    /// The maximum number of payload bytes per fragment. Reliable messages with bigger bodies
    ///  are split into several fragments and reassembled by the receiver.
    ///
    /// NB: This is not negotiated between peers, but it is sent in reply to a join request so
    ///      peers can check for agreement
    pub max_chunk_size: usize,

    /// Unacknowledged fragments are re-sent with this fixed period. There is no backoff and no
    ///  retry limit: retransmission stops when the fragment is acknowledged or the session is
    ///  torn down.
    pub retransmit_interval: Duration,

    /// the interval at which a peer's queue of pending reliable sends is drained
    pub pump_interval: Duration,
    /// the interval at which buffered incoming fragments are checked for complete messages
    pub reassembly_interval: Duration,

    /// A session with no incoming traffic for this long is considered gone and is torn down
    pub session_idle_timeout: Duration,
    pub watchdog_interval: Duration,

    /// the capacity of a peer's queue of reliable sends that were not picked up by the pump yet
    pub max_pending_sends: usize,

    /// The size of the receive buffer. Encoded fragments must fit into this, so it limits
    ///  the size of unreliable messages (which are never split) and must leave room for a full
    ///  chunk plus the biggest possible header.
    pub max_datagram_size: usize,
}

impl RudpConfig {
    pub fn new(self_addr: SocketAddr) -> RudpConfig {
        RudpConfig {
            self_addr,
            max_chunk_size: 200,
            retransmit_interval: Duration::from_millis(250),
            pump_interval: Duration::from_millis(5),
            reassembly_interval: Duration::from_millis(5),
            session_idle_timeout: Duration::from_secs(100),
            watchdog_interval: Duration::from_secs(1),
            max_pending_sends: 10_000,
            max_datagram_size: 2048,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chunk_size == 0 {
            bail!("max chunk size must be positive");
        }
        if self.retransmit_interval.is_zero() {
            bail!("retransmit interval must be positive");
        }
        if self.pump_interval.is_zero() || self.reassembly_interval.is_zero() || self.watchdog_interval.is_zero() {
            bail!("pump, reassembly and watchdog intervals must be positive");
        }
        if self.session_idle_timeout < self.retransmit_interval {
            bail!("session idle timeout {:?} is shorter than the retransmit interval {:?}", self.session_idle_timeout, self.retransmit_interval);
        }
        if self.max_pending_sends == 0 {
            bail!("max pending sends must be positive");
        }
        if self.max_datagram_size < self.max_reliable_datagram_size() {
            bail!("max datagram size {} is too small for chunks of {} bytes - it must be at least {}", self.max_datagram_size, self.max_chunk_size, self.max_reliable_datagram_size());
        }
        Ok(())
    }

    /// The longest possible encoded reliable fragment: full header, ten sequence digits, the
    ///  longest event name and a full chunk (or a single char if that is wider)
    fn max_reliable_datagram_size(&self) -> usize {
        Fragment::RELIABLE_HEADER_LEN + MAX_SEQUENCE_DIGITS + MAX_EVENT_NAME_LEN + max(self.max_chunk_size, 4)
    }

    pub fn get_effective_outbound_config(&self) -> EffectiveOutboundConfig {
        EffectiveOutboundConfig {
            max_chunk_size: self.max_chunk_size,
            retransmit_interval: self.retransmit_interval,
            pump_interval: self.pump_interval,
            max_pending_sends: self.max_pending_sends,
            max_datagram_size: self.max_datagram_size,
        }
    }

    pub fn get_effective_inbound_config(&self) -> EffectiveInboundConfig {
        EffectiveInboundConfig {
            reassembly_interval: self.reassembly_interval,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EffectiveOutboundConfig {
    pub max_chunk_size: usize,
    pub retransmit_interval: Duration,
    pub pump_interval: Duration,
    pub max_pending_sends: usize,
    pub max_datagram_size: usize,
}

#[derive(Clone, Debug)]
pub struct EffectiveInboundConfig {
    pub reassembly_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> RudpConfig {
        RudpConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_chunk_size, 200);
        assert_eq!(config.retransmit_interval, Duration::from_millis(250));
        assert_eq!(config.reassembly_interval, Duration::from_millis(5));
        assert_eq!(config.session_idle_timeout, Duration::from_secs(100));
    }

    #[rstest]
    #[case::zero_chunk(|c: &mut RudpConfig| c.max_chunk_size = 0)]
    #[case::zero_retransmit(|c: &mut RudpConfig| c.retransmit_interval = Duration::ZERO)]
    #[case::zero_pump(|c: &mut RudpConfig| c.pump_interval = Duration::ZERO)]
    #[case::zero_reassembly(|c: &mut RudpConfig| c.reassembly_interval = Duration::ZERO)]
    #[case::timeout_too_short(|c: &mut RudpConfig| c.session_idle_timeout = Duration::from_millis(10))]
    #[case::zero_queue(|c: &mut RudpConfig| c.max_pending_sends = 0)]
    #[case::datagram_too_small(|c: &mut RudpConfig| c.max_datagram_size = 400)]
    #[case::chunk_too_big_for_datagram(|c: &mut RudpConfig| c.max_chunk_size = 2000)]
    fn test_validate_rejects(#[case] modify: fn(&mut RudpConfig)) {
        let mut config = config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_configs() {
        let mut config = config();
        config.max_chunk_size = 100;
        config.reassembly_interval = Duration::from_millis(7);

        let outbound = config.get_effective_outbound_config();
        assert_eq!(outbound.max_chunk_size, 100);
        assert_eq!(outbound.max_pending_sends, 10_000);
        assert_eq!(config.get_effective_inbound_config().reassembly_interval, Duration::from_millis(7));
    }
}
