use std::fmt::{Display, Formatter};

use num_bigint::BigUint;

use crate::noun::Noun;

/// A ship's numeric address. Galaxies fit 8 bits, stars 16, planets 32, moons 64 and comets 128.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ship(pub u128);

/// A ship's key revision counter
pub type Life = u32;

impl Ship {
    pub const ZOD: Ship = Ship(0);

    /// Number of bytes needed to represent the address, 0 for ~zod
    pub fn byte_len(&self) -> usize {
        (u128::BITS - self.0.leading_zeros()).div_ceil(8) as usize
    }

    /// The 2-bit rank selecting the address's width on the wire
    pub fn rank(&self) -> u8 {
        match self.byte_len() {
            0..=2 => 0,
            3..=4 => 1,
            5..=8 => 2,
            _ => 3,
        }
    }

    /// The ship one level up the hierarchy, e.g. a moon's planet. Galaxies have no parent,
    ///  and this returns the ship itself.
    pub fn parent(&self) -> Ship {
        match self.byte_len() {
            0..=1 => *self,
            2 => Ship(self.0 & 0xff),
            3..=4 => Ship(self.0 & 0xffff),
            5..=8 => Ship(self.0 & 0xffff_ffff),
            // comets are sponsored by a star
            _ => Ship(self.0 & 0xffff),
        }
    }

    pub fn to_noun(&self) -> Noun {
        Noun::Atom(BigUint::from(self.0))
    }
}

/// width in bytes of an address with a given rank
pub fn rank_width(rank: u8) -> usize {
    match rank & 3 {
        0 => 2,
        1 => 4,
        2 => 8,
        _ => 16,
    }
}

impl Display for Ship {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u128> for Ship {
    fn from(value: u128) -> Self {
        Ship(value)
    }
}
