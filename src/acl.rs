//! Access-control lists and their compilation into BDDs.
//!
//! An [`Acl`] is an ordered list of permit/deny lines. The first line whose
//! match expression holds decides; a packet matching no line is denied.
//!
//! [`AclCompiler`] is bound to one analysis context (packet registry, source
//! manager, named ACLs, named IP spaces). It memoizes match expressions and
//! ACLs by identity, so build a new compiler whenever the context changes.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Not;

use log::{debug, trace};

use crate::bdd::Bdd;
use crate::error::{Error, ReferenceKind, Result};
use crate::header_space::{HeaderSpace, HeaderSpaceCompiler};
use crate::ip_space::IpSpace;
use crate::packet::PacketHeaders;
use crate::reference::Ref;
use crate::source::{Source, SourceManager};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LineAction {
    Permit,
    Deny,
}

impl fmt::Display for LineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineAction::Permit => write!(f, "permit"),
            LineAction::Deny => write!(f, "deny"),
        }
    }
}

/// Boolean condition on a packet and where it entered the device.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum MatchExpr {
    True,
    False,
    HeaderSpace(HeaderSpace),
    /// The packet arrived on one of these interfaces.
    SourceInterfaces(BTreeSet<String>),
    /// The packet was generated by the device itself.
    OriginatingFromDevice,
    PermittedByAcl(String),
    DeniedByAcl(String),
    And(Vec<MatchExpr>),
    Or(Vec<MatchExpr>),
    Not(Box<MatchExpr>),
}

impl MatchExpr {
    pub fn header_space(hs: HeaderSpace) -> Self {
        MatchExpr::HeaderSpace(hs)
    }

    pub fn source_interfaces(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        MatchExpr::SourceInterfaces(names.into_iter().map(Into::into).collect())
    }

    pub fn permitted_by(name: impl Into<String>) -> Self {
        MatchExpr::PermittedByAcl(name.into())
    }

    pub fn denied_by(name: impl Into<String>) -> Self {
        MatchExpr::DeniedByAcl(name.into())
    }

    pub fn and(exprs: impl IntoIterator<Item = MatchExpr>) -> Self {
        MatchExpr::And(exprs.into_iter().collect())
    }

    pub fn or(exprs: impl IntoIterator<Item = MatchExpr>) -> Self {
        MatchExpr::Or(exprs.into_iter().collect())
    }

    /// Whether the expression is an atom: no `And`, `Or` or `Not` at the top.
    pub fn is_atom(&self) -> bool {
        !matches!(self, MatchExpr::And(_) | MatchExpr::Or(_) | MatchExpr::Not(_))
    }
}

impl Not for MatchExpr {
    type Output = MatchExpr;

    fn not(self) -> MatchExpr {
        match self {
            MatchExpr::True => MatchExpr::False,
            MatchExpr::False => MatchExpr::True,
            MatchExpr::Not(e) => *e,
            e => MatchExpr::Not(Box::new(e)),
        }
    }
}

impl From<HeaderSpace> for MatchExpr {
    fn from(hs: HeaderSpace) -> Self {
        MatchExpr::HeaderSpace(hs)
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, op: &str, es: &[MatchExpr]) -> fmt::Result {
    write!(f, "{}(", op)?;
    for (i, e) in es.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", e)?;
    }
    write!(f, ")")
}

impl fmt::Display for MatchExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchExpr::True => write!(f, "true"),
            MatchExpr::False => write!(f, "false"),
            MatchExpr::HeaderSpace(hs) => write!(f, "{}", hs),
            MatchExpr::SourceInterfaces(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "src_interfaces={{{}}}", names.join(","))
            }
            MatchExpr::OriginatingFromDevice => write!(f, "from_device"),
            MatchExpr::PermittedByAcl(name) => write!(f, "permitted_by({})", name),
            MatchExpr::DeniedByAcl(name) => write!(f, "denied_by({})", name),
            MatchExpr::And(es) => write_list(f, "AND", es),
            MatchExpr::Or(es) => write_list(f, "OR", es),
            MatchExpr::Not(e) => write!(f, "NOT({})", e),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AclLine {
    pub action: LineAction,
    pub expr: MatchExpr,
    pub name: Option<String>,
}

impl AclLine {
    pub fn new(action: LineAction, expr: impl Into<MatchExpr>) -> Self {
        Self {
            action,
            expr: expr.into(),
            name: None,
        }
    }

    pub fn permit(expr: impl Into<MatchExpr>) -> Self {
        Self::new(LineAction::Permit, expr)
    }

    pub fn deny(expr: impl Into<MatchExpr>) -> Self {
        Self::new(LineAction::Deny, expr)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for AclLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{} {}", self.action, self.expr),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Acl {
    pub name: String,
    pub lines: Vec<AclLine>,
}

impl Acl {
    pub fn new(name: impl Into<String>, lines: Vec<AclLine>) -> Self {
        Self {
            name: name.into(),
            lines,
        }
    }
}

/// Reachability of one ACL line.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LineBdds {
    /// Packets not matched by any earlier line.
    pub reached: Ref,
    /// Packets that reach this line and match it.
    pub matched: Ref,
}

/// Sources inspected by `acl`, following named ACL references.
///
/// Undefined references are skipped; compiling the ACL reports them.
pub fn referenced_sources(acl: &Acl, named_acls: &BTreeMap<String, Acl>) -> BTreeSet<Source> {
    let mut seen = BTreeSet::new();
    let mut res = BTreeSet::new();
    for line in &acl.lines {
        collect_sources(&line.expr, named_acls, &mut seen, &mut res);
    }
    res
}

fn collect_sources(
    expr: &MatchExpr,
    named_acls: &BTreeMap<String, Acl>,
    seen: &mut BTreeSet<String>,
    res: &mut BTreeSet<Source>,
) {
    match expr {
        MatchExpr::SourceInterfaces(names) => {
            res.extend(names.iter().map(Source::interface));
        }
        MatchExpr::OriginatingFromDevice => {
            res.insert(Source::Device);
        }
        MatchExpr::PermittedByAcl(name) | MatchExpr::DeniedByAcl(name) => {
            if seen.insert(name.clone()) {
                if let Some(acl) = named_acls.get(name) {
                    for line in &acl.lines {
                        collect_sources(&line.expr, named_acls, seen, res);
                    }
                }
            }
        }
        MatchExpr::And(es) | MatchExpr::Or(es) => {
            for e in es {
                collect_sources(e, named_acls, seen, res);
            }
        }
        MatchExpr::Not(e) => collect_sources(e, named_acls, seen, res),
        MatchExpr::True | MatchExpr::False | MatchExpr::HeaderSpace(_) => {}
    }
}

pub struct AclCompiler<'a> {
    pkt: &'a PacketHeaders,
    sources: &'a SourceManager,
    named_acls: &'a BTreeMap<String, Acl>,
    headers: HeaderSpaceCompiler<'a>,
    cache: RefCell<HashMap<*const MatchExpr, Ref>>,
    acl_cache: RefCell<HashMap<*const Acl, Ref>>,
    visiting: RefCell<Vec<*const Acl>>,
}

impl<'a> AclCompiler<'a> {
    pub fn new(
        pkt: &'a PacketHeaders,
        sources: &'a SourceManager,
        named_acls: &'a BTreeMap<String, Acl>,
        named_ip_spaces: &'a BTreeMap<String, IpSpace>,
    ) -> Self {
        Self {
            pkt,
            sources,
            named_acls,
            headers: HeaderSpaceCompiler::new(pkt, named_ip_spaces),
            cache: RefCell::new(HashMap::new()),
            acl_cache: RefCell::new(HashMap::new()),
            visiting: RefCell::new(Vec::new()),
        }
    }

    pub fn bdd(&self) -> &'a Bdd {
        self.pkt.bdd()
    }

    pub fn packet(&self) -> &'a PacketHeaders {
        self.pkt
    }

    pub fn sources(&self) -> &'a SourceManager {
        self.sources
    }

    pub fn named_acls(&self) -> &'a BTreeMap<String, Acl> {
        self.named_acls
    }

    pub fn header_space_compiler(&self) -> &HeaderSpaceCompiler<'a> {
        &self.headers
    }

    /// Predicate "the packet satisfies `expr`".
    pub fn to_bdd(&self, expr: &'a MatchExpr) -> Result<Ref> {
        let key = expr as *const MatchExpr;
        if let Some(&res) = self.cache.borrow().get(&key) {
            trace!("Match expression cache hit");
            return Ok(res);
        }

        let bdd = self.bdd();
        let res = match expr {
            MatchExpr::True => bdd.one(),
            MatchExpr::False => bdd.zero(),
            MatchExpr::HeaderSpace(hs) => self.headers.compile(hs)?,
            MatchExpr::SourceInterfaces(names) => {
                bdd.apply_or_many(names.iter().map(|name| self.sources.interface_bdd(name)))
            }
            MatchExpr::OriginatingFromDevice => self.sources.originating_from_device_bdd(),
            MatchExpr::PermittedByAcl(name) => self.permitted_by(self.resolve(name)?)?,
            MatchExpr::DeniedByAcl(name) => self.denied_by(self.resolve(name)?)?,
            MatchExpr::And(es) => {
                let mut res = bdd.one();
                for e in es {
                    res = bdd.apply_and(res, self.to_bdd(e)?);
                    if bdd.is_zero(res) {
                        break;
                    }
                }
                res
            }
            MatchExpr::Or(es) => {
                let mut res = bdd.zero();
                for e in es {
                    res = bdd.apply_or(res, self.to_bdd(e)?);
                    if bdd.is_one(res) {
                        break;
                    }
                }
                res
            }
            MatchExpr::Not(e) => -self.to_bdd(e)?,
        };

        self.cache.borrow_mut().insert(key, res);
        Ok(res)
    }

    fn resolve(&self, name: &str) -> Result<&'a Acl> {
        self.named_acls
            .get(name)
            .ok_or_else(|| Error::undefined(ReferenceKind::Acl, name))
    }

    /// Packets the ACL permits.
    pub fn permitted_by(&self, acl: &'a Acl) -> Result<Ref> {
        let key = acl as *const Acl;
        if let Some(&res) = self.acl_cache.borrow().get(&key) {
            return Ok(res);
        }
        if self.visiting.borrow().contains(&key) {
            return Err(Error::circular(ReferenceKind::Acl, &acl.name));
        }

        debug!("Compiling ACL '{}' ({} lines)", acl.name, acl.lines.len());
        self.visiting.borrow_mut().push(key);
        let res = self.fold_lines(acl);
        self.visiting.borrow_mut().pop();
        let res = res?;

        self.acl_cache.borrow_mut().insert(key, res);
        Ok(res)
    }

    /// Packets the ACL denies, explicitly or by matching no line.
    pub fn denied_by(&self, acl: &'a Acl) -> Result<Ref> {
        Ok(-self.permitted_by(acl)?)
    }

    fn fold_lines(&self, acl: &'a Acl) -> Result<Ref> {
        let bdd = self.bdd();
        let mut res = bdd.zero();
        for line in acl.lines.iter().rev() {
            let matched = self.to_bdd(&line.expr)?;
            let action = bdd.constant(line.action == LineAction::Permit);
            res = bdd.apply_ite(matched, action, res);
        }
        Ok(res)
    }

    /// For each line, the packets reaching it and the packets it matches.
    ///
    /// Independent of the line actions. The `matched` sets are disjoint and
    /// their union is everything matched by some line.
    pub fn reach_and_match_lines(&self, acl: &'a Acl) -> Result<Vec<LineBdds>> {
        let bdd = self.bdd();
        let mut reached = bdd.one();
        let mut res = Vec::with_capacity(acl.lines.len());
        for line in &acl.lines {
            let m = self.with_visiting(acl, || self.to_bdd(&line.expr))?;
            res.push(LineBdds {
                reached,
                matched: bdd.apply_and(reached, m),
            });
            reached = bdd.apply_diff(reached, m);
        }
        Ok(res)
    }

    /// Each line's own match expression, ignoring earlier lines.
    pub fn line_matches(&self, acl: &'a Acl) -> Result<Vec<Ref>> {
        acl.lines
            .iter()
            .map(|line| self.with_visiting(acl, || self.to_bdd(&line.expr)))
            .collect()
    }

    fn with_visiting<T>(&self, acl: &'a Acl, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let key = acl as *const Acl;
        if self.visiting.borrow().contains(&key) {
            return Err(Error::circular(ReferenceKind::Acl, &acl.name));
        }
        self.visiting.borrow_mut().push(key);
        let res = f();
        self.visiting.borrow_mut().pop();
        res
    }
}
