use thiserror::Error;

/// Errors produced by the ZRTP engine.
///
/// Per-packet failures (bad CRC, MAC mismatch, wrong message for the current state, ...) are
/// returned synchronously from `Channel::deliver`/`Session::channel_deliver`; the channel does
/// not change state when one of these is returned. See `host::Host::status_message` for the
/// subset of these (timeouts, cache mismatches) that are also reported asynchronously so a host
/// can warn a user without tearing the exchange down.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("out of order: expected sequence number greater than {last_seen}, got {got}")]
    OutOfOrder { last_seen: u16, got: u16 },

    #[error("fragment message-id {got} is older than the current reassembly ({current})")]
    OutOfOrderFragment { current: u16, got: u16 },

    #[error("unexpected message {message} received in state {state}")]
    Unexpected {
        state: &'static str,
        message: &'static str,
    },

    #[error("recomputed hash-chain image does not match the stored peer image")]
    UnmatchingHashChain,

    #[error("HMAC over a stored message does not match its recorded MAC")]
    UnmatchingMac,

    #[error("Confirm MAC does not match the received ciphertext")]
    UnmatchingConfirmMac,

    #[error("hvi does not match H(DHPart2 || responder Hello)")]
    UnmatchingHvi,

    #[error("a repeated message does not byte-match the one already stored")]
    UnmatchingRepetition,

    #[error("cached secret {0} does not match the peer-advertised ID")]
    CacheMismatch(&'static str),

    #[error("unsupported ZRTP version")]
    UnsupportedVersion,

    #[error("required key material is missing: {0}")]
    InvalidContext(&'static str),

    #[error("cryptographic primitive failed: {0}")]
    CryptoFailure(String),

    #[error("fragment reassembly incomplete, {0} bytes outstanding")]
    Fragment(usize),

    #[error("retransmission cap reached without a reply")]
    Timeout,

    #[error("failed to build outbound message: {0}")]
    BuilderFailure(&'static str),

    #[error("no channel 0 exists yet; it must be added before any other channel")]
    NoMainChannel,

    #[error("channel capacity exceeded (max {0})")]
    TooManyChannels(usize),

    #[error("unknown channel id {0}")]
    UnknownChannel(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
