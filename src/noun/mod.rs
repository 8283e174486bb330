//! The noun data model: every value exchanged on the wire is either an arbitrary-precision
//!  unsigned integer (an *atom*) or an ordered pair of nouns (a *cell*).
//!
//! Nouns are immutable. Cells share their children through an `Arc`, so cloning a noun is
//!  cheap regardless of its size, and each cell memoizes its [mug](mug::mug) on first use.
//!  Equality is structural.

pub mod bits;
pub mod jam;
pub mod mug;

use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

use crate::error::AmesError;

#[derive(Clone)]
pub enum Noun {
    Atom(BigUint),
    Cell(Cell),
}

#[derive(Clone)]
pub struct Cell(Arc<CellInner>);

struct CellInner {
    head: Noun,
    tail: Noun,
    mug: OnceLock<u32>,
}

impl Cell {
    pub fn new(head: Noun, tail: Noun) -> Cell {
        Cell(Arc::new(CellInner {
            head,
            tail,
            mug: OnceLock::new(),
        }))
    }

    pub fn head(&self) -> &Noun {
        &self.0.head
    }

    pub fn tail(&self) -> &Noun {
        &self.0.tail
    }

    pub(crate) fn memoized_mug(&self, f: impl FnOnce() -> u32) -> u32 {
        *self.0.mug.get_or_init(f)
    }

    pub(crate) fn cached_mug(&self) -> Option<u32> {
        self.0.mug.get().copied()
    }
}

impl CellInner {
    /// moves child cells out, leaving cheap placeholder atoms behind
    fn take_child_cells(&mut self, into: &mut Vec<Cell>) {
        for child in [&mut self.head, &mut self.tail] {
            if let Noun::Cell(c) = std::mem::replace(child, Noun::Atom(BigUint::zero())) {
                into.push(c);
            }
        }
    }
}

/// Nouns can be nested far deeper than the call stack allows, so dropping the last reference
///  to a cell tears its subtree down with an explicit work list.
impl Drop for CellInner {
    fn drop(&mut self) {
        let mut orphans = Vec::new();
        self.take_child_cells(&mut orphans);
        while let Some(cell) = orphans.pop() {
            // shared subtrees are still referenced elsewhere and stay intact
            if let Ok(mut inner) = Arc::try_unwrap(cell.0) {
                inner.take_child_cells(&mut orphans);
            }
        }
    }
}

impl Noun {
    pub fn atom(value: impl Into<BigUint>) -> Noun {
        Noun::Atom(value.into())
    }

    pub fn cell(head: Noun, tail: Noun) -> Noun {
        Noun::Cell(Cell::new(head, tail))
    }

    /// Right-nested tuple: `[a b c]` is `[a [b c]]`. Without further elements, this is `first`
    ///  itself.
    pub fn tuple(first: Noun, rest: &[Noun]) -> Noun {
        match rest.split_last() {
            None => first,
            Some((last, init)) => {
                let tail = init.iter()
                    .rev()
                    .fold(last.clone(), |acc, n| Noun::cell(n.clone(), acc));
                Noun::cell(first, tail)
            }
        }
    }

    /// A cord is text stored as an atom, first character in the least significant byte.
    pub fn cord(text: &str) -> Noun {
        Noun::Atom(BigUint::from_bytes_le(text.as_bytes()))
    }

    /// A path is a null-terminated list of cords.
    pub fn path<S: AsRef<str>>(segments: &[S]) -> Noun {
        segments.iter()
            .rev()
            .fold(Noun::atom(0u32), |acc, s| Noun::cell(Noun::cord(s.as_ref()), acc))
    }

    pub fn is_atom(&self) -> bool {
        matches!(self, Noun::Atom(_))
    }

    pub fn as_atom(&self) -> anyhow::Result<&BigUint> {
        match self {
            Noun::Atom(a) => Ok(a),
            Noun::Cell(_) => Err(AmesError::UnexpectedNoun("expected an atom, found a cell".to_string()).into()),
        }
    }

    pub fn as_cell(&self) -> anyhow::Result<&Cell> {
        match self {
            Noun::Cell(c) => Ok(c),
            Noun::Atom(a) => Err(AmesError::UnexpectedNoun(format!("expected a cell, found atom {}", a)).into()),
        }
    }

    pub fn head(&self) -> anyhow::Result<&Noun> {
        Ok(self.as_cell()?.head())
    }

    pub fn tail(&self) -> anyhow::Result<&Noun> {
        Ok(self.as_cell()?.tail())
    }

    pub fn as_u64(&self) -> anyhow::Result<u64> {
        self.as_atom()?
            .to_u64()
            .ok_or_else(|| AmesError::UnexpectedNoun(format!("atom does not fit 64 bits: {}", self)).into())
    }

    pub fn as_u32(&self) -> anyhow::Result<u32> {
        self.as_atom()?
            .to_u32()
            .ok_or_else(|| AmesError::UnexpectedNoun(format!("atom does not fit 32 bits: {}", self)).into())
    }

    /// Interprets an atom as a cord. Trailing zero bytes cannot be represented and are absent.
    pub fn as_cord(&self) -> anyhow::Result<String> {
        let atom = self.as_atom()?;
        if atom.is_zero() {
            return Ok(String::new());
        }
        String::from_utf8(atom.to_bytes_le())
            .map_err(|_| AmesError::UnexpectedNoun(format!("atom is not a UTF-8 cord: {}", atom)).into())
    }

    /// Reads a null-terminated list of cords
    pub fn as_path(&self) -> anyhow::Result<Vec<String>> {
        let mut result = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Noun::Atom(a) if a.is_zero() => return Ok(result),
                Noun::Atom(a) => return Err(AmesError::UnexpectedNoun(format!("path terminated by non-null atom {}", a)).into()),
                Noun::Cell(c) => {
                    result.push(c.head().as_cord()?);
                    cur = c.tail();
                }
            }
        }
    }

    pub fn mug(&self) -> u32 {
        mug::mug(self)
    }
}

impl From<u64> for Noun {
    fn from(value: u64) -> Self {
        Noun::atom(value)
    }
}

impl From<BigUint> for Noun {
    fn from(value: BigUint) -> Self {
        Noun::Atom(value)
    }
}

impl PartialEq for Noun {
    fn eq(&self, other: &Self) -> bool {
        let mut stack = vec![(self, other)];
        while let Some((a, b)) = stack.pop() {
            match (a, b) {
                (Noun::Atom(a), Noun::Atom(b)) => {
                    if a != b {
                        return false;
                    }
                }
                (Noun::Cell(a), Noun::Cell(b)) => {
                    if Arc::ptr_eq(&a.0, &b.0) {
                        continue;
                    }
                    if let (Some(ma), Some(mb)) = (a.cached_mug(), b.cached_mug()) {
                        if ma != mb {
                            return false;
                        }
                    }
                    stack.push((a.tail(), b.tail()));
                    stack.push((a.head(), b.head()));
                }
                _ => return false,
            }
        }
        true
    }
}
impl Eq for Noun {}

impl Hash for Noun {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.mug());
    }
}

enum Piece<'a> {
    Noun(&'a Noun),
    Text(&'static str),
}

impl Display for Noun {
    /// Prints right-nested cells flat, e.g. `[1 2 3]` for `[1 [2 3]]`
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut stack = vec![Piece::Noun(self)];
        while let Some(piece) = stack.pop() {
            match piece {
                Piece::Text(text) => f.write_str(text)?,
                Piece::Noun(Noun::Atom(a)) => write!(f, "{}", a)?,
                Piece::Noun(Noun::Cell(c)) => {
                    let mut elements = vec![c.head()];
                    let mut tail = c.tail();
                    while let Noun::Cell(inner) = tail {
                        elements.push(inner.head());
                        tail = inner.tail();
                    }
                    elements.push(tail);

                    f.write_str("[")?;
                    stack.push(Piece::Text("]"));
                    for (i, element) in elements.into_iter().enumerate().rev() {
                        stack.push(Piece::Noun(element));
                        if i > 0 {
                            stack.push(Piece::Text(" "));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Debug for Noun {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Builds a right-nested tuple noun from anything convertible to a noun, e.g.
///  `noun![1u64, 2u64, Noun::cord("x")]`
#[macro_export]
macro_rules! noun {
    ($first:expr $(, $x:expr)* $(,)?) => {
        $crate::noun::Noun::tuple($crate::noun::Noun::from($first), &[$($crate::noun::Noun::from($x)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::atom(noun![5u64], "5")]
    #[case::pair(noun![12u64, 16u64], "[12 16]")]
    #[case::triple(noun![1u64, 2u64, 3u64], "[1 2 3]")]
    #[case::nested_head(Noun::cell(noun![1u64, 2u64], 3u64.into()), "[[1 2] 3]")]
    #[case::path(Noun::path(&["ge", "hood"]), "[25959 1685024616 0]")]
    fn test_display(#[case] noun: Noun, #[case] expected: &str) {
        assert_eq!(noun.to_string(), expected);
    }

    #[test]
    fn test_cord() {
        assert_eq!(Noun::cord("ping"), Noun::atom(0x676e6970u32));
        assert_eq!(Noun::cord(""), Noun::atom(0u32));
        assert_eq!(Noun::cord("helm-hi").as_cord().unwrap(), "helm-hi");
    }

    #[test]
    fn test_path_round_trip() {
        let path = Noun::path(&["ge", "hood"]);
        assert_eq!(path.as_path().unwrap(), vec!["ge".to_string(), "hood".to_string()]);
        assert_eq!(Noun::path::<&str>(&[]).as_path().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_path_not_terminated() {
        let not_a_path = noun![Noun::cord("a"), 7u64];
        let err = not_a_path.as_path().unwrap_err();
        assert!(matches!(err.downcast_ref::<AmesError>(), Some(AmesError::UnexpectedNoun(_))));
    }

    #[test]
    fn test_structural_equality() {
        let a = noun![noun![1u64, 2u64], 3u64];
        let b = noun![noun![1u64, 2u64], 3u64];
        assert_eq!(a, b);
        assert_ne!(a, noun![noun![1u64, 2u64], 4u64]);
        assert_ne!(Noun::atom(1u32), noun![1u64, 1u64]);
    }

    fn deep_list(len: usize) -> Noun {
        Noun::tuple(Noun::atom(0u32), &vec![Noun::atom(0u32); len])
    }

    #[test]
    fn test_deep_nouns_do_not_exhaust_the_stack() {
        let list = deep_list(200_000);
        let same = deep_list(200_000);
        assert_eq!(list, same);
        assert_ne!(list, deep_list(199_999));
        assert_ne!(list.mug(), 0);
        assert!(list.to_string().starts_with("[0 0 0"));

        let mut head_nested = Noun::atom(1u32);
        for _ in 0..200_000 {
            head_nested = Noun::cell(head_nested, Noun::atom(2u32));
        }
        assert!(head_nested.to_string().ends_with("1 2] 2] 2]"));
        drop(head_nested);
    }

    #[test]
    fn test_tuple() {
        assert_eq!(Noun::tuple(Noun::atom(4u32), &[]), Noun::atom(4u32));
        assert_eq!(Noun::tuple(1u64.into(), &[2u64.into(), 3u64.into()]), Noun::cell(1u64.into(), Noun::cell(2u64.into(), 3u64.into())));
    }

    #[test]
    fn test_accessors() {
        let n = noun![7u64, 8u64];
        assert_eq!(n.head().unwrap().as_u64().unwrap(), 7);
        assert_eq!(n.tail().unwrap().as_u32().unwrap(), 8);
        assert!(n.as_atom().is_err());
        assert!(Noun::atom(3u32).as_cell().is_err());
        assert!(Noun::Atom(BigUint::from(1u8) << 70).as_u64().is_err());
    }
}
