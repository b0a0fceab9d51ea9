//! Error types shared by every compiler in the crate.
//!
//! All failures are synchronous and carry the offending name or value.
//! Nothing here is retried: compilation is deterministic, so the same input
//! always fails the same way.

use std::fmt;

use thiserror::Error;

/// Kind of a named object that can be referenced from another object.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ReferenceKind {
    /// A named access-control list.
    Acl,
    /// A named IP space.
    IpSpace,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKind::Acl => write!(f, "ACL"),
            ReferenceKind::IpSpace => write!(f, "IP space"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum Error {
    #[error("value {value} does not fit into a {width}-bit integer")]
    ValueOutOfRange { value: u64, width: usize },

    #[error("bitvector widths differ: {left} vs {right}")]
    WidthMismatch { left: usize, right: usize },

    #[error("prefix length {len} is longer than 32")]
    InvalidPrefixLength { len: u8 },

    #[error("cannot encode {size} values using {width} bits")]
    DomainTooLarge { size: usize, width: usize },

    #[error("value '{value}' is not part of the domain")]
    UnknownValue { value: String },

    #[error("undefined {kind} reference '{name}'")]
    UndefinedReference { kind: ReferenceKind, name: String },

    #[error("circular {kind} reference '{name}'")]
    CircularReference { kind: ReferenceKind, name: String },

    #[error("not a full assignment: {what}")]
    PartialAssignment { what: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn undefined(kind: ReferenceKind, name: &str) -> Self {
        Error::UndefinedReference {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn circular(kind: ReferenceKind, name: &str) -> Self {
        Error::CircularReference {
            kind,
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let e = Error::undefined(ReferenceKind::Acl, "missing");
        assert_eq!(e.to_string(), "undefined ACL reference 'missing'");

        let e = Error::circular(ReferenceKind::IpSpace, "loop");
        assert_eq!(e.to_string(), "circular IP space reference 'loop'");

        let e = Error::ValueOutOfRange { value: 300, width: 8 };
        assert_eq!(e.to_string(), "value 300 does not fit into a 8-bit integer");
    }

    #[test]
    fn test_undefined_and_circular_are_distinct() {
        let a = Error::undefined(ReferenceKind::Acl, "x");
        let b = Error::circular(ReferenceKind::Acl, "x");
        assert_ne!(a, b);
    }
}
