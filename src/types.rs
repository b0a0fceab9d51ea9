//! Type-safe wrappers for BDD variables and literals.
use std::fmt;
use std::ops::Neg;

/// A variable identifier (1-indexed).
///
/// The id doubles as the position of the variable in the (fixed) ordering:
/// smaller ids are closer to the root.
///
/// # Invariants
///
/// - Variable IDs must be >= 1 (0 is reserved for terminals)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Var(u32);

impl Var {
    /// Creates a new variable with the given ID.
    ///
    /// # Panics
    ///
    /// Panics if `id == 0`. Variables must be 1-indexed.
    pub fn new(id: u32) -> Self {
        assert_ne!(id, 0, "Variable IDs must be >= 1");
        Var(id)
    }

    /// Returns the raw variable ID as a `u32`.
    pub fn id(self) -> u32 {
        self.0
    }

    /// Positive literal of this variable.
    pub fn pos(self) -> Lit {
        Lit::new(self, false)
    }

    /// Negative literal of this variable.
    pub fn neg(self) -> Lit {
        Lit::new(self, true)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

impl From<Var> for u32 {
    fn from(var: Var) -> Self {
        var.0
    }
}

/// A literal: a variable or its negation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Lit {
    var: Var,
    negated: bool,
}

impl Lit {
    pub fn new(var: Var, negated: bool) -> Self {
        Lit { var, negated }
    }

    /// Creates a literal from a DIMACS-style signed integer.
    ///
    /// # Panics
    ///
    /// Panics if `lit == 0`.
    pub fn from_dimacs(lit: i32) -> Self {
        assert_ne!(lit, 0, "Literal should not be zero");
        Lit::new(Var::new(lit.unsigned_abs()), lit < 0)
    }

    pub fn var(self) -> Var {
        self.var
    }

    pub fn is_negated(self) -> bool {
        self.negated
    }

    pub fn is_positive(self) -> bool {
        !self.negated
    }

    /// Value the variable takes when this literal is true.
    pub fn value(self) -> bool {
        !self.negated
    }

    pub fn to_dimacs(self) -> i32 {
        let v = self.var.id() as i32;
        if self.negated {
            -v
        } else {
            v
        }
    }
}

impl Neg for Lit {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Lit::new(self.var, !self.negated)
    }
}

impl From<i32> for Lit {
    fn from(lit: i32) -> Self {
        Lit::from_dimacs(lit)
    }
}

impl fmt::Display for Lit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "~{}", self.var)
        } else {
            write!(f, "{}", self.var)
        }
    }
}
