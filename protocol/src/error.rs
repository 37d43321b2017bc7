//! Error types for the wire codec and the reliable transport

use thiserror::Error;

/// Byte-level decoding failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("malformed variable-length integer: {0}")]
    MalformedVarInt(String),
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("offline message magic mismatch")]
    InvalidMagic,
    #[error("unsupported address family {0}")]
    UnsupportedAddressFamily(u8),
}

/// Faults raised while processing a peer's transport traffic
///
/// Every variant is scoped to a single peer. Callers are expected to tear down
/// that peer's session rather than the listener.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("empty datagram")]
    EmptyDatagram,
    #[error("entry with empty payload")]
    EmptyPayload,
    #[error("fragment references unknown split id {0}")]
    UnknownSplitId(u16),
    #[error("split index {index} out of range for split count {count}")]
    SplitIndexOutOfRange { index: u16, count: u16 },
    #[error("split id {split_id} announced count {announced}, expected {expected}")]
    SplitCountMismatch {
        split_id: u16,
        announced: u16,
        expected: u16,
    },
    #[error("split count {0} is zero or exceeds the reassembly limit")]
    InvalidSplitCount(u16),
    #[error("more than {0} fragmentation groups in flight")]
    TooManyFragmentGroups(usize),
    #[error("payload of {size} bytes cannot be fragmented under mtu {mtu}")]
    PayloadTooLarge { size: usize, mtu: usize },
    #[error("unexpected packet 0x{0:02x} in current handshake state")]
    UnexpectedPacket(u8),
    #[error("{0} acknowledgment records do not fit one datagram")]
    TooManyAckRecords(usize),
}
