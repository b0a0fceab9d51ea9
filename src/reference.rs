use std::fmt::{Display, Formatter};
use std::ops::Neg;

/// A handle to a BDD node, possibly complemented.
///
/// The least significant bit is the complement flag, the remaining bits store
/// the index of the node in the manager's table. Handles are only meaningful
/// for the [`Bdd`][crate::bdd::Bdd] that produced them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Ref(u32);

impl Ref {
    /// Creates a new reference to the node at `index`.
    pub const fn new(index: u32, negated: bool) -> Self {
        assert!(index < (1 << 31), "Node index does not fit into a reference");
        Self((index << 1) | (negated as u32))
    }

    pub const fn positive(index: u32) -> Self {
        Self::new(index, false)
    }

    pub const fn negative(index: u32) -> Self {
        Self::new(index, true)
    }

    #[inline]
    pub const fn is_negated(self) -> bool {
        (self.0 & 1) != 0
    }

    /// Index of the referenced node in the table.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 >> 1) as usize
    }

    /// The same node without the complement flag.
    #[inline]
    pub const fn regular(self) -> Self {
        Self(self.0 & !1)
    }

    /// Raw underlying value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl Neg for Ref {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self(self.0 ^ 1)
    }
}

impl Display for Ref {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", if self.is_negated() { "~" } else { "" }, self.index())
    }
}
