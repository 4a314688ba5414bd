use bytes::{BufMut, BytesMut};
use std::cmp::min;
use thiserror::Error;

/// Default epoch for reliable sends. Epoch 0 is reserved for "none", and the wire tag is
///  `1 + epoch`. Tag 255 marks raw bytes, so the largest usable epoch is 253.
pub const DEFAULT_EPOCH: u8 = 1;
pub const MAX_EPOCH: u8 = u8::MAX - 2;

/// Lengths and counts that are transmitted in a single header byte
pub const MAX_EVENT_NAME_LEN: usize = u8::MAX as usize;
pub const MAX_FRAGMENTS_PER_MESSAGE: usize = u8::MAX as usize;

/// A `u32` sequence number has at most 10 decimal digits
pub const MAX_SEQUENCE_DIGITS: usize = 10;

const TAG_UNRELIABLE: u8 = 0;
const TAG_RAW_BYTES: u8 = u8::MAX;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram of {actual} bytes is shorter than the minimum header of {required} bytes")]
    TooShort { actual: usize, required: usize },
    #[error("datagram is truncated: header announces {required} bytes after the header, only {actual} present")]
    Truncated { actual: usize, required: usize },
    #[error("invalid flag value {0}")]
    InvalidFlag(u8),
    #[error("invalid ascii-decimal sequence number")]
    InvalidSequence,
    #[error("reliable fragment with a remaining count of 0")]
    InvalidRemainingCount,
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("tag {0} does not start a fragment")]
    NotAFragment(u8),
}

/// What a single datagram carries: either a fragment, or raw application bytes that bypass
///  event names, fragmentation and ordering altogether.
///
/// Raw bytes are the tag byte 255 followed by the bytes, nothing else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Datagram {
    Fragment(Fragment),
    RawBytes(Vec<u8>),
}

impl Datagram {
    pub const RAW_BYTES_HEADER_LEN: usize = 1;

    pub fn deser(buf: &[u8]) -> Result<Datagram, DecodeError> {
        match buf.first() {
            Some(&TAG_RAW_BYTES) => Ok(Datagram::RawBytes(buf[Self::RAW_BYTES_HEADER_LEN..].to_vec())),
            _ => Fragment::deser(buf).map(Datagram::Fragment),
        }
    }

    pub fn ser_raw_bytes(bytes: &[u8], buf: &mut BytesMut) {
        buf.reserve(Self::RAW_BYTES_HEADER_LEN + bytes.len());
        buf.put_u8(TAG_RAW_BYTES);
        buf.put_slice(bytes);
    }
}

/// A Fragment is the unit that crosses the wire, i.e. the payload of a single UDP datagram.
///
/// Reliable fragments are laid out as follows:
/// ```ascii
/// 0: 1 + epoch (0 is reserved for unreliable fragments, 255 for raw bytes)
/// 1: length of the event name
/// 2: 'fragmented' flag (0 or 1)
/// 3: 'first' flag (0 or 1)
/// 4: number of ascii-decimal digits of the sequence number
/// 5: remaining count, truncated to 255
/// 6: sequence number digits
/// *: event name (UTF-8)
/// *: payload (UTF-8) until the end of the datagram
/// ```
///
/// Unreliable fragments have no sequence number and are never split:
/// ```ascii
/// 0: 0
/// 1: length of the event name
/// 2: event name (UTF-8)
/// *: payload (UTF-8) until the end of the datagram
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub sequence: u32,
    pub event_name: String,
    pub payload: String,
    pub reliable: bool,
    pub epoch: u8,
    pub is_fragmented: bool,
    pub is_first: bool,
    /// total number of fragments on the starter, fragments remaining (including this one) on
    ///  all others
    pub remaining_count: u32,
}

impl Fragment {
    pub const RELIABLE_HEADER_LEN: usize = 6;
    pub const UNRELIABLE_HEADER_LEN: usize = 2;

    pub fn unreliable(event_name: &str, payload: &str) -> Fragment {
        Fragment {
            sequence: 0,
            event_name: event_name.to_string(),
            payload: payload.to_string(),
            reliable: false,
            epoch: 0,
            is_fragmented: false,
            is_first: false,
            remaining_count: 0,
        }
    }

    pub fn serialized_len(&self) -> usize {
        if self.reliable {
            Self::RELIABLE_HEADER_LEN + decimal_digits(self.sequence) + self.event_name.len() + self.payload.len()
        }
        else {
            Self::UNRELIABLE_HEADER_LEN + self.event_name.len() + self.payload.len()
        }
    }

    /// Callers ensure that the event name fits into a single length byte and that the epoch
    ///  is at most [MAX_EPOCH].
    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.event_name.len() <= MAX_EVENT_NAME_LEN);
        buf.reserve(self.serialized_len());

        if self.reliable {
            debug_assert!(self.epoch <= MAX_EPOCH);

            let digits = self.sequence.to_string();
            buf.put_u8(self.epoch.saturating_add(1));
            buf.put_u8(self.event_name.len() as u8);
            buf.put_u8(self.is_fragmented.into());
            buf.put_u8(self.is_first.into());
            buf.put_u8(digits.len() as u8);
            buf.put_u8(min(self.remaining_count, u8::MAX as u32) as u8);
            buf.put_slice(digits.as_bytes());
        }
        else {
            buf.put_u8(TAG_UNRELIABLE);
            buf.put_u8(self.event_name.len() as u8);
        }
        buf.put_slice(self.event_name.as_bytes());
        buf.put_slice(self.payload.as_bytes());
    }

    pub fn deser(buf: &[u8]) -> Result<Fragment, DecodeError> {
        if buf.len() < Self::UNRELIABLE_HEADER_LEN {
            return Err(DecodeError::TooShort { actual: buf.len(), required: Self::UNRELIABLE_HEADER_LEN });
        }

        if buf[0] == TAG_UNRELIABLE {
            let name_len = buf[1] as usize;
            let rest = &buf[Self::UNRELIABLE_HEADER_LEN..];
            if rest.len() < name_len {
                return Err(DecodeError::Truncated { actual: rest.len(), required: name_len });
            }
            let (event_name, payload) = rest.split_at(name_len);
            return Ok(Fragment::unreliable(
                utf8(event_name, "event name")?,
                utf8(payload, "payload")?,
            ));
        }

        if buf[0] == TAG_RAW_BYTES {
            return Err(DecodeError::NotAFragment(buf[0]));
        }

        if buf.len() < Self::RELIABLE_HEADER_LEN {
            return Err(DecodeError::TooShort { actual: buf.len(), required: Self::RELIABLE_HEADER_LEN });
        }

        let epoch = buf[0] - 1;
        let name_len = buf[1] as usize;
        let is_fragmented = flag(buf[2])?;
        let is_first = flag(buf[3])?;
        let digits_len = buf[4] as usize;
        let remaining_count = buf[5] as u32;

        let rest = &buf[Self::RELIABLE_HEADER_LEN..];
        if rest.len() < digits_len + name_len {
            return Err(DecodeError::Truncated { actual: rest.len(), required: digits_len + name_len });
        }
        let (digits, rest) = rest.split_at(digits_len);
        let (event_name, payload) = rest.split_at(name_len);

        if remaining_count == 0 {
            return Err(DecodeError::InvalidRemainingCount);
        }

        Ok(Fragment {
            sequence: parse_sequence(digits)?,
            event_name: utf8(event_name, "event name")?.to_string(),
            payload: utf8(payload, "payload")?.to_string(),
            reliable: true,
            epoch,
            is_fragmented,
            is_first,
            remaining_count,
        })
    }
}

fn flag(raw: u8) -> Result<bool, DecodeError> {
    match raw {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(DecodeError::InvalidFlag(other)),
    }
}

fn utf8<'a>(raw: &'a [u8], what: &'static str) -> Result<&'a str, DecodeError> {
    std::str::from_utf8(raw)
        .map_err(|_| DecodeError::InvalidUtf8(what))
}

fn parse_sequence(digits: &[u8]) -> Result<u32, DecodeError> {
    if digits.is_empty() || digits.len() > MAX_SEQUENCE_DIGITS {
        return Err(DecodeError::InvalidSequence);
    }

    let mut result: u32 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return Err(DecodeError::InvalidSequence);
        }
        result = result.checked_mul(10)
            .and_then(|r| r.checked_add((d - b'0') as u32))
            .ok_or(DecodeError::InvalidSequence)?;
    }
    Ok(result)
}

fn decimal_digits(mut n: u32) -> usize {
    let mut result = 1;
    while n >= 10 {
        n /= 10;
        result += 1;
    }
    result
}

/// Splits a message body into chunks of at most `max_chunk_size` bytes, cutting only at char
///  boundaries. An empty body still yields a single (empty) chunk, and a chunk always holds at
///  least one char even if that char is wider than `max_chunk_size`.
pub fn split_into_chunks(body: &str, max_chunk_size: usize) -> Vec<&str> {
    if body.is_empty() {
        return vec![body];
    }

    let mut result = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let mut end = min(max_chunk_size, rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next()
                .map(|c| c.len_utf8())
                .unwrap_or(rest.len());
        }

        let (chunk, tail) = rest.split_at(end);
        result.push(chunk);
        rest = tail;
    }
    result
}

/// Builds the fragments for one reliable send, assigning ascending sequence numbers starting
///  at `first_sequence`. All fragments carry the send's epoch.
pub fn reliable_fragments(first_sequence: u32, event_name: &str, chunks: &[&str], epoch: u8) -> Vec<Fragment> {
    let count = chunks.len() as u32;

    chunks.iter()
        .enumerate()
        .map(|(idx, chunk)| {
            let idx = idx as u32;
            Fragment {
                sequence: first_sequence.wrapping_add(idx),
                event_name: event_name.to_string(),
                payload: chunk.to_string(),
                reliable: true,
                epoch,
                is_fragmented: count > 1,
                is_first: idx == 0,
                remaining_count: count - idx,
            }
        })
        .collect()
}
