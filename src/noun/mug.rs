//! Mug: a 31-bit structural hash over nouns, based on MurmurHash3 (x86, 32 bit).
//!
//! A mug is never zero - zero is reserved as the 'not yet computed' marker.

use std::io::Cursor;

use num_bigint::BigUint;

use crate::noun::{Cell, Noun};

const ATOM_SEED: u32 = 0xcafe_babe;
const ATOM_FALLBACK: u32 = 0x7fff;
const CELL_SEED: u32 = 0xdead_beef;
const CELL_FALLBACK: u32 = 0xfffe;

/// Seeded murmur3 over the first `len` little-endian bytes of `key`, zero padded
pub fn muk(seed: u32, len: usize, key: &BigUint) -> u32 {
    let mut bytes = key.to_bytes_le();
    bytes.resize(len, 0);
    murmur3::murmur3_32(&mut Cursor::new(bytes), seed)
        .expect("reading from an in-memory buffer cannot fail")
}

/// Folds a murmur hash to 31 bits, retrying with incremented seeds while the result is zero
fn mum(seed: u32, fallback: u32, key: &BigUint) -> u32 {
    let len = (key.bits() / 8 + 1) as usize;

    let mut seed = seed;
    for _ in 0..8 {
        let hash = muk(seed, len, key);
        let folded = (hash & 0x7fff_ffff) ^ (hash >> 31);
        if folded != 0 {
            return folded;
        }
        seed = seed.wrapping_add(1);
    }
    fallback
}

pub fn mug(noun: &Noun) -> u32 {
    let root = match noun {
        Noun::Atom(a) => return mum(ATOM_SEED, ATOM_FALLBACK, a),
        Noun::Cell(c) => c,
    };
    if let Some(m) = root.cached_mug() {
        return m;
    }

    // post-order: a cell's mug is computed only after both children are memoized, so the
    //  nested calls below never go deeper than one level
    let mut stack = vec![(root, false)];
    while let Some((cell, children_done)) = stack.pop() {
        if cell.cached_mug().is_some() {
            continue;
        }
        if children_done {
            cell_mug(cell);
            continue;
        }
        stack.push((cell, true));
        for child in [cell.tail(), cell.head()] {
            if let Noun::Cell(c) = child {
                if c.cached_mug().is_none() {
                    stack.push((c, false));
                }
            }
        }
    }
    cell_mug(root)
}

fn cell_mug(cell: &Cell) -> u32 {
    cell.memoized_mug(|| {
        let key = ((mug(cell.tail()) as u64) << 32) ^ mug(cell.head()) as u64;
        mum(CELL_SEED, CELL_FALLBACK, &BigUint::from(key))
    })
}
