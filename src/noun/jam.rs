//! Jam and cue: the canonical serialization of a noun into a single atom and back.
//!
//! The encoding is a bit stream, least significant bit first:
//!
//! ```ascii
//!  0    <mat(atom)>               atom
//!  1 0  <jam(head)> <jam(tail)>   cell
//!  1 1  <mat(offset)>             back-reference to the sub-noun first emitted at `offset`
//! ```
//!
//! `mat` is a self-describing length-prefixed integer encoding, `rub` its inverse.

use num_bigint::BigUint;
use num_traits::Zero;
use rustc_hash::FxHashMap;

use crate::error::AmesError;
use crate::noun::bits::{BitReader, BitWriter};
use crate::noun::Noun;

/// Encodes an atom's length-prefixed form, returning `(bit length, encoded value)`
pub fn mat(atom: &BigUint) -> (u64, BigUint) {
    let mut w = BitWriter::new();
    write_mat(&mut w, atom);
    (w.len(), w.into_atom())
}

fn write_mat(w: &mut BitWriter, atom: &BigUint) {
    if atom.is_zero() {
        w.push_bit(true);
        return;
    }
    let b = atom.bits();
    let c = u64::BITS - b.leading_zeros();

    w.push_zeros(c as u64);
    w.push_bit(true);
    // b's most significant bit is implicit
    w.push_u64(b, c - 1);
    w.push_atom(atom, b);
}

/// Decodes a `mat` encoded atom starting at bit `pos`, returning `(bit length, atom)`
pub fn rub(atom: &BigUint, pos: u64) -> anyhow::Result<(u64, BigUint)> {
    rub_at(&BitReader::new(atom), pos)
}

fn rub_at(r: &BitReader, pos: u64) -> anyhow::Result<(u64, BigUint)> {
    let mut c = 0u64;
    while !r.bit(pos + c) {
        c += 1;
        if pos + c >= r.len() {
            return Err(AmesError::MalformedJam(format!("unterminated length prefix at bit {}", pos)).into());
        }
    }
    if c == 0 {
        return Ok((1, BigUint::zero()));
    }
    if c > 64 {
        return Err(AmesError::MalformedJam(format!("length prefix at bit {} exceeds 64 bits", pos)).into());
    }

    let b = r.read_u64(pos + c + 1, (c - 1) as u32) + (1u64 << (c - 1));
    // the atom's most significant bit is set, so it must lie inside the input
    let end = (pos + c + c).checked_add(b);
    if end.map_or(true, |end| end > r.len()) {
        return Err(AmesError::MalformedJam(format!("atom of {} bits at bit {} runs past the end of the input", b, pos)).into());
    }
    let value = r.read_atom(pos + c + c, b);
    Ok((c + c + b, value))
}

pub fn jam(noun: &Noun) -> BigUint {
    let mut w = BitWriter::new();
    let mut cache: FxHashMap<&Noun, u64> = FxHashMap::default();
    let mut stack = vec![noun];

    while let Some(cur) = stack.pop() {
        let offset = w.len();

        if let Some(&prev) = cache.get(cur) {
            match cur {
                // a literal atom no longer than the pointer is emitted as is
                Noun::Atom(a) if a.bits() <= u64::BITS as u64 - prev.leading_zeros() as u64 => {
                    w.push_bit(false);
                    write_mat(&mut w, a);
                }
                _ => {
                    w.push_bit(true);
                    w.push_bit(true);
                    write_mat(&mut w, &BigUint::from(prev));
                }
            }
            continue;
        }

        cache.insert(cur, offset);
        match cur {
            Noun::Atom(a) => {
                w.push_bit(false);
                write_mat(&mut w, a);
            }
            Noun::Cell(c) => {
                w.push_bit(true);
                w.push_bit(false);
                stack.push(c.tail());
                stack.push(c.head());
            }
        }
    }

    w.into_atom()
}

/// A cell whose head or tail is still being decoded
enum CueFrame {
    Head { pos: u64 },
    Tail { pos: u64, head_len: u64, head: Noun },
}

pub fn cue(atom: &BigUint) -> anyhow::Result<Noun> {
    let r = BitReader::new(atom);
    let mut cache: FxHashMap<u64, Noun> = FxHashMap::default();
    let mut stack = Vec::new();
    let mut pos = 0u64;

    loop {
        if pos >= r.len() {
            return Err(AmesError::MalformedJam(format!("unexpected end of input at bit {}", pos)).into());
        }

        let (mut len, mut noun) = if !r.bit(pos) {
            let (len, value) = rub_at(&r, pos + 1)?;
            let noun = Noun::Atom(value);
            cache.insert(pos, noun.clone());
            (len + 1, noun)
        }
        else if !r.bit(pos + 1) {
            stack.push(CueFrame::Head { pos });
            pos += 2;
            continue;
        }
        else {
            let (len, target) = rub_at(&r, pos + 2)?;
            let noun = u64::try_from(&target).ok()
                .and_then(|offset| cache.get(&offset))
                .cloned()
                .ok_or_else(|| AmesError::UnknownBackReference(target.to_string()))?;
            (2 + len, noun)
        };

        // a complete noun either starts a cell's tail or completes cells up the stack
        loop {
            match stack.pop() {
                None => return Ok(noun),
                Some(CueFrame::Head { pos: cell_pos }) => {
                    pos = cell_pos + 2 + len;
                    stack.push(CueFrame::Tail { pos: cell_pos, head_len: len, head: noun });
                    break;
                }
                Some(CueFrame::Tail { pos: cell_pos, head_len, head }) => {
                    noun = Noun::cell(head, noun);
                    cache.insert(cell_pos, noun.clone());
                    len += 2 + head_len;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noun;
    use rstest::rstest;
    use std::str::FromStr;
    use std::sync::Arc;

    fn big(s: &str) -> BigUint {
        BigUint::from_str(s).unwrap()
    }

    #[rstest]
    #[case::zero(0, 1, 1)]
    #[case::one(1, 3, 6)]
    #[case::hundred(100, 13, 6456)]
    #[case::hundred_million(100_000_000, 37, 102400000736)]
    fn test_mat(#[case] atom: u64, #[case] expected_len: u64, #[case] expected_value: u64) {
        assert_eq!(mat(&BigUint::from(atom)), (expected_len, BigUint::from(expected_value)));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::one(1)]
    #[case::hundred(100)]
    #[case::hundred_million(100_000_000)]
    #[case::max(u64::MAX)]
    fn test_rub_inverts_mat(#[case] atom: u64) {
        let (len, encoded) = mat(&BigUint::from(atom));
        // shift to make sure rub honours its start offset
        let shifted = (encoded << 5u32) | BigUint::from(0b10101u32);
        assert_eq!(rub(&shifted, 5).unwrap(), (len, BigUint::from(atom)));
    }

    #[rstest]
    #[case::atom_zero(noun![0u64], "2")]
    #[case::pair(noun![1u64, 2u64], "4657")]
    #[case::small_cell(noun![12u64, 16u64], "17176641")]
    #[case::repeated_cell(noun![noun![12u64, 16u64, 19u64, 23u64], noun![12u64, 16u64, 19u64, 23u64]], "5322556398681252101")]
    #[case::repeated_nested(noun![noun![noun![1u64, 1u64], noun![2u64, 2u64]], noun![2u64, 2u64]], "3886480388885")]
    #[case::poke(noun![Noun::path(&["ge", "hood"]), 0u64, Noun::cord("m"), Noun::cord("helm-hi"), Noun::cord("ping")],
        "83103842581186151537609419784725107274636599623840339663322629")]
    fn test_jam_cue(#[case] noun: Noun, #[case] expected: &str) {
        let jammed = jam(&noun);
        assert_eq!(jammed, big(expected));
        assert_eq!(cue(&jammed).unwrap(), noun);
    }

    #[test]
    fn test_cue_shares_back_referenced_structure() {
        let shared = noun![1u64, 2u64, 3u64];
        let noun = noun![shared.clone(), shared.clone(), shared];
        let decoded = cue(&jam(&noun)).unwrap();

        let first = decoded.head().unwrap().as_cell().unwrap().clone();
        let second = decoded.tail().unwrap().head().unwrap().as_cell().unwrap().clone();
        assert!(Arc::ptr_eq(&first.0, &second.0));
        assert_eq!(decoded, noun);
    }

    #[test]
    fn test_large_atom_round_trip() {
        let atom = (BigUint::from(1u8) << 20_000u32) - 1u8;
        let noun = noun![atom.clone(), 7u64, atom];
        assert_eq!(cue(&jam(&noun)).unwrap(), noun);
    }

    #[test]
    fn test_deep_list_round_trip() {
        let list = Noun::tuple(Noun::atom(0u32), &vec![Noun::atom(0u32); 60_000]);
        let jammed = jam(&list);
        assert_eq!(jammed.bits(), 240_002);

        let decoded = cue(&jammed).unwrap();
        assert_eq!(decoded, list);
    }

    #[rstest]
    #[case::empty("0")]
    #[case::truncated_pointer("3")]
    #[case::truncated_cell("1")]
    // a 40 bit length prefix announcing an atom of about 2^40 bits in an 81 bit input
    #[case::length_past_end("2417851639227059326156800")]
    fn test_cue_malformed(#[case] input: &str) {
        let err = cue(&big(input)).unwrap_err();
        assert!(matches!(err.downcast_ref::<AmesError>(), Some(AmesError::MalformedJam(_))), "{:?}", err);
    }

    #[test]
    fn test_cue_unknown_back_reference() {
        // a pointer at offset 0 that references offset 1
        let err = cue(&BigUint::from(0b1_1_0_11u32)).unwrap_err();
        assert!(matches!(err.downcast_ref::<AmesError>(), Some(AmesError::UnknownBackReference(_))), "{:?}", err);
    }
}
