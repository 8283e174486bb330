use thiserror::Error;

/// Failure kinds with protocol meaning. They travel inside `anyhow::Error`; callers that need to
///  distinguish them use `downcast_ref::<AmesError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmesError {
    #[error("malformed packet header: {0}")]
    MalformedHeader(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("checksum mismatch: header says {expected:#x}, body hashes to {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("key revision mismatch: expected tick {expected}, packet has {actual}")]
    TickMismatch { expected: u8, actual: u8 },
    #[error("fragment out of order: expected index {expected}, got {actual}")]
    OutOfOrderFragment { expected: u32, actual: u32 },
    #[error("message {num} is too far ahead, accepting messages below {limit}")]
    MessageTooFarAhead { num: u64, limit: u64 },
    #[error("back-reference to unknown offset {0}")]
    UnknownBackReference(String),
    #[error("malformed jam encoding: {0}")]
    MalformedJam(String),
    #[error("unexpected noun shape: {0}")]
    UnexpectedNoun(String),
    #[error("key directory lookup failed: {0}")]
    KeyLookup(String),
    #[error("invalid seed: {0}")]
    InvalidSeed(String),
    #[error("socket error: {0}")]
    Socket(String),
}
