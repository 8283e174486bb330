use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, BytesMut};
use num_bigint::BigUint;
use tracing::trace;

use crate::error::AmesError;
use crate::noun::mug::mug;
use crate::noun::Noun;
use crate::ship::{rank_width, Ship};

pub const HEADER_LEN: usize = 4;
pub const ORIGIN_LEN: usize = 6;
pub const PROTOCOL_VERSION: u8 = 0;

const CHECKSUM_MASK: u32 = 0xf_ffff;

/// An encrypted packet as it travels on the wire, see the crate documentation for the layout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub sndr: Ship,
    pub rcvr: Ship,
    /// sender's key revision, mod 16
    pub sndr_tick: u8,
    /// receiver's key revision, mod 16
    pub rcvr_tick: u8,
    /// Address of the packet's original sender, present if it was forwarded by a relay
    pub origin: Option<u64>,
    pub content: BigUint,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let sndr_rank = self.sndr.rank();
        let rcvr_rank = self.rcvr.rank();

        let mut body = BytesMut::new();
        body.put_u8((self.sndr_tick & 0xf) | (self.rcvr_tick & 0xf) << 4);
        body.put_slice(&self.sndr.0.to_le_bytes()[..rank_width(sndr_rank)]);
        body.put_slice(&self.rcvr.0.to_le_bytes()[..rank_width(rcvr_rank)]);
        if self.content.bits() > 0 {
            body.put_slice(&self.content.to_bytes_le());
        }

        let checksum = body_checksum(&body);

        let mut header = (sndr_rank as u32) << 7
            | (rcvr_rank as u32) << 9
            | checksum << 11;
        if self.origin.is_none() {
            header |= 1 << 31;
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + ORIGIN_LEN + body.len());
        buf.put_u32_le(header);
        if let Some(origin) = self.origin {
            buf.put_uint_le(origin & 0xffff_ffff_ffff, ORIGIN_LEN);
        }
        buf.put_slice(&body);

        // the packet is an atom on the wire, so trailing zero bytes are not transmitted
        let len = buf.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(0);
        buf.truncate(len);
        buf.to_vec()
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Packet> {
        if buf.len() < HEADER_LEN {
            return Err(AmesError::MalformedHeader(format!("packet of {} bytes is shorter than its header", buf.len())).into());
        }
        let header = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);

        if header & 0x7 != 0 {
            return Err(AmesError::MalformedHeader("reserved bits are set".to_string()).into());
        }
        if header & 0x8 != 0 {
            return Err(AmesError::MalformedHeader("extended protocol flag is set".to_string()).into());
        }
        let version = ((header >> 4) & 0x7) as u8;
        if version != PROTOCOL_VERSION {
            return Err(AmesError::UnsupportedVersion(version).into());
        }

        let sndr_width = rank_width(((header >> 7) & 0x3) as u8);
        let rcvr_width = rank_width(((header >> 9) & 0x3) as u8);
        let expected_checksum = (header >> 11) & CHECKSUM_MASK;
        let is_relayed = header >> 31 == 0;

        let mut body = &buf[HEADER_LEN..];
        let origin = if is_relayed {
            let origin = read_le(body, 0, ORIGIN_LEN) as u64;
            body = body.get(ORIGIN_LEN..).unwrap_or(&[]);
            Some(origin)
        }
        else {
            None
        };

        let actual_checksum = body_checksum(body);
        if actual_checksum != expected_checksum {
            return Err(AmesError::ChecksumMismatch { expected: expected_checksum, actual: actual_checksum }.into());
        }

        let ticks = body.first().copied().unwrap_or(0);
        let sndr = Ship(read_le(body, 1, sndr_width));
        let rcvr = Ship(read_le(body, 1 + sndr_width, rcvr_width));
        let content = BigUint::from_bytes_le(body.get(1 + sndr_width + rcvr_width..).unwrap_or(&[]));

        trace!(%sndr, %rcvr, ?origin, "decoded packet");
        Ok(Packet {
            sndr,
            rcvr,
            sndr_tick: ticks & 0xf,
            rcvr_tick: ticks >> 4,
            origin,
            content,
        })
    }

    /// `[[sndr rcvr] sndr-tick rcvr-tick origin content]`, with origin as a unit
    pub fn to_noun(&self) -> Noun {
        let origin = match self.origin {
            None => Noun::from(0u64),
            Some(lane) => Noun::cell(0u64.into(), lane.into()),
        };
        Noun::tuple(Noun::cell(self.sndr.to_noun(), self.rcvr.to_noun()), &[
            (self.sndr_tick as u64).into(),
            (self.rcvr_tick as u64).into(),
            origin,
            self.content.clone().into(),
        ])
    }
}

fn body_checksum(body: &[u8]) -> u32 {
    mug(&Noun::Atom(BigUint::from_bytes_le(body))) & CHECKSUM_MASK
}

/// reads up to 16 bytes little-endian, treating bytes past the end of the slice as zero
fn read_le(buf: &[u8], offset: usize, len: usize) -> u128 {
    let mut result = 0u128;
    for i in (0..len).rev() {
        result = (result << 8) | buf.get(offset + i).copied().unwrap_or(0) as u128;
    }
    result
}

/// Packs an IPv4 socket address into a 48 bit lane: address in the low 32 bits, port above
pub fn lane_from_addr(addr: &SocketAddrV4) -> u64 {
    u32::from(*addr.ip()) as u64 | (addr.port() as u64) << 32
}

pub fn addr_from_lane(lane: u64) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(lane as u32), (lane >> 32) as u16))
}
