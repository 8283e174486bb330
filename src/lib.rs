//! An implementation of Ames, Urbit's encrypted peer-to-peer UDP protocol.
//!
//! Application messages ("pokes") are nouns, i.e. binary trees of unsigned integers. A poke is
//!  serialized with `jam`, split into fragments of 8192 bits, and each fragment is encrypted
//!  into a single UDP packet. Receivers acknowledge fragments and messages, and the sender
//!  re-sends everything that is not acknowledged at a fixed interval.
//!
//! ## Design
//!
//! * Peers are identified by their ship (an integer address), not by their socket address
//!   * packets go through a relay (typically a galaxy) until a peer's direct address is known
//!     from a packet it sent us directly
//!   * a peer's public keys come from a [directory::KeyDirectory], the symmetric key is derived
//!     once per peer and cached
//! * Several logical flows ("connections") share a peer, each identified by a *bone*
//!   * message numbers are per connection, starting at 1
//!   * the peer replies to bone `b` on bone `b ^ 1`
//! * Reliability is by fixed-interval retransmission of all unacknowledged fragments. There is
//!   no backoff and no retry limit.
//! * Fragments of a message are reassembled strictly in order. Different messages have no
//!   ordering guarantees.
//!
//! ## Header
//!
//! All numbers are little endian. The 32 bit header:
//! ```ascii
//! bit 0-2:   reserved, must be 0
//! bit 3:     'extended' flag, must be 0
//! bit 4-6:   protocol version, currently 0
//! bit 7-8:   sender address rank (0: 2 bytes, 1: 4 bytes, 2: 8 bytes, 3: 16 bytes)
//! bit 9-10:  receiver address rank
//! bit 11-30: checksum, the low 20 bits of the body's mug
//! bit 31:    1 if the packet was sent directly, 0 if it was relayed
//! ```
//!
//! The header is followed by a 6 byte origin lane (IPv4 address and port of the original
//!  sender) for relayed packets, and then by the body:
//!
//! ```ascii
//! 0: sender life mod 16 (bits 0-3) and receiver life mod 16 (bits 4-7)
//! 1: sender address (width given by its rank)
//!    receiver address
//!    content (remaining bytes)
//! ```
//!
//! Trailing zero bytes are stripped from the packet.
//!
//! ## Encryption
//!
//! The content is the jammed shut packet `[bone message-num meat]`, encrypted with AES-256-SIV.
//!  The symmetric key is the SHA-512 of an X25519 shared secret, the associated data are the
//!  sender and receiver addresses and lives. The content atom is laid out as:
//!
//! ```ascii
//! bit 0-127:   SIV
//! bit 128-143: plaintext length in bytes
//! bit 144-:    ciphertext
//! ```

pub mod ames;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod noun;
pub mod packet;
pub mod seed;
pub mod session;
pub mod ship;
pub mod transport;

#[cfg(test)]
pub mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
