//! # netbdd: symbolic packet spaces as Binary Decision Diagrams
//!
//! **`netbdd`** represents sets of packets as Boolean functions over the bits
//! of their header fields, and compiles network configuration objects (IP
//! spaces, header spaces, ACLs) into such functions. On top of that it picks
//! realistic example packets and explains in configuration terms what an ACL
//! permits.
//!
//! ## Layers
//!
//! - **[`bdd`]**: the [`Bdd`][crate::bdd::Bdd] manager. All functions live in
//!   one manager; [`Ref`][crate::reference::Ref] handles carry a complement bit,
//!   so negation is free and equal functions have equal handles.
//! - **[`integer`]**: fixed-width bitvectors over the manager with equality,
//!   range and comparison predicates, decoding, and ripple-carry addition.
//! - **[`packet`]**: [`PacketHeaders`][crate::packet::PacketHeaders], the
//!   registry that owns the manager and allocates every header field in a
//!   fixed variable order.
//! - **[`domain`]** and **[`source`]**: finite value sets encoded into
//!   bitvectors, and the per-device encoding of where a packet came from.
//! - **[`ip_space`]**, **[`header_space`]** and **[`acl`]**: compilers from
//!   configuration trees into functions.
//! - **[`flow`]** and **[`explain`]**: representative packets and ACL
//!   explanations.
//!
//! ## Basic usage
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use netbdd::acl::{Acl, AclCompiler, AclLine};
//! use netbdd::header_space::{HeaderSpace, SubRange};
//! use netbdd::packet::PacketHeaders;
//! use netbdd::source::{Source, SourceManager};
//!
//! let pkt = PacketHeaders::new();
//! let sources = SourceManager::trivial(pkt.bdd(), [Source::Device]);
//! let named_acls = BTreeMap::new();
//! let named_ip_spaces = BTreeMap::new();
//! let compiler = AclCompiler::new(&pkt, &sources, &named_acls, &named_ip_spaces);
//!
//! let acl = Acl::new(
//!     "web",
//!     vec![AclLine::permit(HeaderSpace::new().with_dst_ports([SubRange::singleton(80)]))],
//! );
//! let permitted = compiler.permitted_by(&acl).unwrap();
//! assert!(!pkt.bdd().is_zero(permitted));
//! assert!(!pkt.bdd().is_one(permitted));
//! ```
//!
//! ## Threading
//!
//! A [`Bdd`][crate::bdd::Bdd] manager is neither `Sync` nor meant to be
//! shared: use one [`PacketHeaders`][crate::packet::PacketHeaders] (and so
//! one manager) per analysis, and one compiler per thread. Independent
//! analyses can run in parallel, each with its own registry.

pub mod acl;
pub mod bdd;
pub mod cache;
pub mod domain;
pub mod error;
pub mod explain;
pub mod flow;
pub mod header_space;
pub mod integer;
pub mod ip_space;
pub mod node;
pub mod packet;
pub mod pairing;
pub mod paths;
pub mod reference;
pub mod sat;
pub mod source;
pub mod table;
pub mod types;
pub mod utils;

pub use error::{Error, Result};
