//! IP address sets and their compilation into BDDs.
//!
//! An [`IpSpace`] is an immutable tree. [`IpSpaceCompiler`] turns it into a
//! predicate over one 32-bit address field, memoizing by node identity: the
//! same node reached twice is compiled once, while two equal but distinct
//! nodes are compiled separately.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

use log::{debug, trace};

use crate::acl::LineAction;
use crate::bdd::Bdd;
use crate::error::{Error, ReferenceKind, Result};
use crate::integer::{BddInteger, BitVector};
use crate::packet::PacketHeaders;
use crate::reference::Ref;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum IpSpace {
    /// Every address.
    Universe,
    /// No address.
    Empty,
    /// A single address.
    Address(Ipv4Addr),
    /// Addresses equal to `ip` on every bit where `mask` is 0.
    ///
    /// Mask bits set to 1 are "don't care".
    Wildcard { ip: Ipv4Addr, mask: Ipv4Addr },
    /// Addresses sharing the first `len` bits with `ip`.
    Prefix { ip: Ipv4Addr, len: u8 },
    /// Ordered lines, first match wins, no match is a deny.
    AclLines(Vec<IpSpaceLine>),
    /// A named IP space, resolved when compiled.
    Reference(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct IpSpaceLine {
    pub action: LineAction,
    pub space: IpSpace,
}

impl IpSpaceLine {
    pub fn permit(space: IpSpace) -> Self {
        Self {
            action: LineAction::Permit,
            space,
        }
    }

    pub fn deny(space: IpSpace) -> Self {
        Self {
            action: LineAction::Deny,
            space,
        }
    }
}

impl IpSpace {
    /// # Panics
    ///
    /// Panics if `len > 32`.
    pub fn prefix(ip: Ipv4Addr, len: u8) -> Self {
        assert!(len <= 32, "Prefix length {} is longer than 32", len);
        IpSpace::Prefix { ip, len }
    }

    pub fn wildcard(ip: Ipv4Addr, mask: Ipv4Addr) -> Self {
        IpSpace::Wildcard { ip, mask }
    }

    pub fn reference(name: impl Into<String>) -> Self {
        IpSpace::Reference(name.into())
    }

    pub fn lines(lines: Vec<IpSpaceLine>) -> Self {
        IpSpace::AclLines(lines)
    }
}

impl From<Ipv4Addr> for IpSpace {
    fn from(ip: Ipv4Addr) -> Self {
        IpSpace::Address(ip)
    }
}

impl fmt::Display for IpSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpSpace::Universe => write!(f, "any"),
            IpSpace::Empty => write!(f, "none"),
            IpSpace::Address(ip) => write!(f, "{}", ip),
            IpSpace::Wildcard { ip, mask } => write!(f, "{}:{}", ip, mask),
            IpSpace::Prefix { ip, len } => write!(f, "{}/{}", ip, len),
            IpSpace::AclLines(lines) => {
                write!(f, "[")?;
                for (i, line) in lines.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} {}", line.action, line.space)?;
                }
                write!(f, "]")
            }
            IpSpace::Reference(name) => write!(f, "ref({})", name),
        }
    }
}

/// Compiles IP spaces over one address field.
///
/// The memo cache lives as long as the compiler; create a new compiler for
/// a different name table.
pub struct IpSpaceCompiler<'a> {
    bdd: &'a Bdd,
    ip: &'a BddInteger,
    named: &'a BTreeMap<String, IpSpace>,
    cache: RefCell<HashMap<*const IpSpace, Ref>>,
    visiting: RefCell<Vec<*const IpSpace>>,
}

impl<'a> IpSpaceCompiler<'a> {
    /// # Panics
    ///
    /// Panics if `ip` is not 32 bits wide.
    pub fn new(bdd: &'a Bdd, ip: &'a BddInteger, named: &'a BTreeMap<String, IpSpace>) -> Self {
        assert_eq!(ip.width(), PacketHeaders::IP_WIDTH, "IP fields are 32 bits wide");
        Self {
            bdd,
            ip,
            named,
            cache: RefCell::new(HashMap::new()),
            visiting: RefCell::new(Vec::new()),
        }
    }

    pub fn bdd(&self) -> &'a Bdd {
        self.bdd
    }

    pub fn ip(&self) -> &'a BddInteger {
        self.ip
    }

    /// Predicate "the address is in `space`".
    pub fn compile(&self, space: &'a IpSpace) -> Result<Ref> {
        let key = space as *const IpSpace;
        if let Some(&res) = self.cache.borrow().get(&key) {
            trace!("IP space cache hit for {}", space);
            return Ok(res);
        }

        let res = match space {
            IpSpace::Universe => self.bdd.one(),
            IpSpace::Empty => self.bdd.zero(),
            IpSpace::Address(ip) => self.prefix_bdd(*ip, 32),
            IpSpace::Wildcard { ip, mask } => self.wildcard_bdd(*ip, *mask),
            IpSpace::Prefix { ip, len } => {
                if *len > 32 {
                    return Err(Error::InvalidPrefixLength { len: *len });
                }
                self.prefix_bdd(*ip, *len as usize)
            }
            IpSpace::AclLines(lines) => {
                let mut res = self.bdd.zero();
                for line in lines.iter().rev() {
                    let matched = self.compile(&line.space)?;
                    let action = self.bdd.constant(line.action == LineAction::Permit);
                    res = self.bdd.apply_ite(matched, action, res);
                }
                res
            }
            IpSpace::Reference(name) => self.compile_reference(name)?,
        };

        self.cache.borrow_mut().insert(key, res);
        Ok(res)
    }

    fn compile_reference(&self, name: &str) -> Result<Ref> {
        let Some(target) = self.named.get(name) else {
            return Err(Error::undefined(ReferenceKind::IpSpace, name));
        };
        let key = target as *const IpSpace;
        if self.visiting.borrow().contains(&key) {
            return Err(Error::circular(ReferenceKind::IpSpace, name));
        }
        debug!("Compiling IP space '{}'", name);
        self.visiting.borrow_mut().push(key);
        let res = self.compile(target);
        self.visiting.borrow_mut().pop();
        res
    }

    fn prefix_bdd(&self, ip: Ipv4Addr, len: usize) -> Ref {
        let value = u32::from(ip);
        let bits = self.ip.bits();
        self.bdd.apply_and_many((0..len).map(|i| {
            if (value >> (31 - i)) & 1 == 1 {
                bits[i]
            } else {
                -bits[i]
            }
        }))
    }

    fn wildcard_bdd(&self, ip: Ipv4Addr, mask: Ipv4Addr) -> Ref {
        let (value, mask) = (u32::from(ip), u32::from(mask));
        let bits = self.ip.bits();
        self.bdd.apply_and_many((0..32).filter(|i| (mask >> (31 - i)) & 1 == 0).map(|i| {
            if (value >> (31 - i)) & 1 == 1 {
                bits[i]
            } else {
                -bits[i]
            }
        }))
    }
}

/// Simplifies IP spaces relative to a region of addresses.
///
/// The result agrees with the input on every address in the region and may
/// differ outside of it.
pub struct IpSpaceSpecializer<'c, 'a> {
    compiler: &'c IpSpaceCompiler<'a>,
    region: Ref,
}

impl<'c, 'a> IpSpaceSpecializer<'c, 'a> {
    pub fn new(compiler: &'c IpSpaceCompiler<'a>, region: Ref) -> Self {
        Self { compiler, region }
    }

    pub fn specialize(&self, space: &'a IpSpace) -> Result<IpSpace> {
        self.specialize_within(space, self.region)
    }

    fn specialize_within(&self, space: &'a IpSpace, region: Ref) -> Result<IpSpace> {
        let bdd = self.compiler.bdd();
        let f = self.compiler.compile(space)?;
        if bdd.is_implies(region, f) {
            return Ok(IpSpace::Universe);
        }
        if !bdd.intersects(region, f) {
            return Ok(IpSpace::Empty);
        }
        match space {
            IpSpace::AclLines(lines) => {
                let mut reached = region;
                let mut kept = Vec::new();
                for line in lines {
                    if bdd.is_zero(reached) {
                        break;
                    }
                    let matched = self.compiler.compile(&line.space)?;
                    if bdd.intersects(matched, reached) {
                        kept.push(IpSpaceLine {
                            action: line.action,
                            space: self.specialize_within(&line.space, reached)?,
                        });
                    }
                    reached = bdd.apply_diff(reached, matched);
                }
                Ok(IpSpace::AclLines(kept))
            }
            _ => Ok(space.clone()),
        }
    }
}
