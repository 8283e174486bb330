//! Everything between an application message and the bytes of a UDP datagram.
//!
//! Outbound, a [poke::Poke] is turned into a noun, jammed and split into
//!  [fragments](fragment::Fragment). Each fragment is wrapped in a [shut::ShutPacket], encrypted
//!  into a [wire::Packet] and encoded. Inbound is the reverse.

pub mod fragment;
pub mod poke;
pub mod shut;
pub mod wire;
