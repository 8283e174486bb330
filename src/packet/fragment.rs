use num_bigint::BigUint;
use tracing::trace;

use crate::error::AmesError;
use crate::noun::bits::{BitReader, BitWriter};
use crate::noun::jam::{cue, jam};
use crate::noun::Noun;

/// Number of bits of a jammed message carried per fragment
pub const FRAGMENT_BITS: u64 = 8192;

/// One slice of a jammed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub num: u64,
    pub count: u32,
    pub index: u32,
    pub data: BigUint,
}

impl Fragment {
    /// `[num count index data]`
    pub fn to_noun(&self) -> Noun {
        Noun::tuple(self.num.into(), &[
            (self.count as u64).into(),
            (self.index as u64).into(),
            self.data.clone().into(),
        ])
    }
}

/// Jams a message and slices it into fragments in index order. Even an empty message yields
///  one fragment.
pub fn split_message(num: u64, message: &Noun) -> anyhow::Result<Vec<Fragment>> {
    let jammed = jam(message);
    let num_bits = jammed.bits();
    let count = num_bits.div_ceil(FRAGMENT_BITS).max(1);
    let count = u32::try_from(count)
        .map_err(|_| anyhow::anyhow!("message of {} bits exceeds the maximum number of fragments", num_bits))?;

    trace!(num, num_bits, count, "splitting message");

    let reader = BitReader::new(&jammed);
    Ok((0..count)
        .map(|index| Fragment {
            num,
            count,
            index,
            data: reader.read_atom(index as u64 * FRAGMENT_BITS, FRAGMENT_BITS),
        })
        .collect())
}

/// Concatenates fragments supplied in index order and cues the result. There is no
///  resequencing: a fragment whose index differs from its position fails the whole join.
pub fn join_message(fragments: &[Fragment]) -> anyhow::Result<Noun> {
    let mut writer = BitWriter::new();
    for (pos, fragment) in fragments.iter().enumerate() {
        let pos = pos as u32;
        if fragment.index != pos {
            return Err(AmesError::OutOfOrderFragment { expected: pos, actual: fragment.index }.into());
        }
        writer.push_atom(&fragment.data, FRAGMENT_BITS);
    }
    cue(&writer.into_atom())
}

/// Inbound reassembly state for a single message
#[derive(Debug)]
pub struct Reassembly {
    count: u32,
    fragments: Vec<Fragment>,
}

impl Reassembly {
    pub fn new(count: u32) -> Reassembly {
        Reassembly {
            count,
            fragments: Vec::new(),
        }
    }

    pub fn next_index(&self) -> u32 {
        self.fragments.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.next_index() >= self.count
    }

    /// Accepts the next fragment in sequence. Fragments that were already received are
    ///  ignored (returning `false`), fragments from further ahead are rejected.
    pub fn push(&mut self, fragment: Fragment) -> anyhow::Result<bool> {
        let expected = self.next_index();
        if fragment.index < expected {
            trace!(index = fragment.index, "duplicate fragment");
            return Ok(false);
        }
        if fragment.index > expected || fragment.index >= self.count {
            return Err(AmesError::OutOfOrderFragment { expected, actual: fragment.index }.into());
        }
        self.fragments.push(fragment);
        Ok(true)
    }

    pub fn join(&self) -> anyhow::Result<Noun> {
        join_message(&self.fragments)
    }
}
