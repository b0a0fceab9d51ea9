//! Explaining what an ACL permits, in the ACL's own vocabulary.
//!
//! The explainer turns the permitted region of an ACL into a disjunctive
//! normal form over the atoms of its match expressions, simplifies it against
//! the compiled region, and records which lines every remaining atom comes
//! from.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::debug;

use crate::acl::{Acl, AclCompiler, LineAction, LineBdds, MatchExpr};
use crate::bdd::Bdd;
use crate::error::Result;
use crate::ip_space::IpSpace;
use crate::packet::PacketHeaders;
use crate::reference::Ref;
use crate::source::SourceManager;

/// One line of one ACL.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LineRef {
    pub acl: String,
    pub index: usize,
}

impl LineRef {
    pub fn new(acl: impl Into<String>, index: usize) -> Self {
        Self {
            acl: acl.into(),
            index,
        }
    }
}

impl fmt::Display for LineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.acl, self.index)
    }
}

/// Lines behind every atom of an explanation, in order of first appearance.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Provenance {
    entries: Vec<(MatchExpr, BTreeSet<LineRef>)>,
}

impl Provenance {
    pub fn get(&self, atom: &MatchExpr) -> Option<&BTreeSet<LineRef>> {
        self.entries.iter().find(|(a, _)| a == atom).map(|(_, lines)| lines)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MatchExpr, &BTreeSet<LineRef>)> + '_ {
        self.entries.iter().map(|(a, lines)| (a, lines))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Explanation {
    pub expr: MatchExpr,
    pub provenance: Provenance,
}

impl fmt::Display for Explanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        for (atom, lines) in self.provenance.iter() {
            let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
            write!(f, "\n  {} <- {}", atom, lines.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone)]
struct Literal<'a> {
    atom: &'a MatchExpr,
    positive: bool,
    f: Ref,
}

impl Literal<'_> {
    fn same(&self, other: &Literal<'_>) -> bool {
        self.positive == other.positive && self.atom == other.atom
    }

    fn to_expr(self) -> MatchExpr {
        if self.positive {
            self.atom.clone()
        } else {
            !self.atom.clone()
        }
    }
}

/// Conjunction of literals, with its region under the invariant.
#[derive(Debug, Clone)]
struct Conjunct<'a> {
    lits: Vec<Literal<'a>>,
    region: Ref,
}

/// Compiled lines of one ACL.
struct CompiledAcl<'a> {
    acl: &'a Acl,
    lines: Vec<LineBdds>,
    matches: Vec<Ref>,
}

pub struct AclExplainer<'a> {
    compiler: AclCompiler<'a>,
}

impl<'a> AclExplainer<'a> {
    pub fn new(
        pkt: &'a PacketHeaders,
        sources: &'a SourceManager,
        named_acls: &'a BTreeMap<String, Acl>,
        named_ip_spaces: &'a BTreeMap<String, IpSpace>,
    ) -> Self {
        Self {
            compiler: AclCompiler::new(pkt, sources, named_acls, named_ip_spaces),
        }
    }

    pub fn compiler(&self) -> &AclCompiler<'a> {
        &self.compiler
    }

    fn bdd(&self) -> &'a Bdd {
        self.compiler.bdd()
    }

    /// Packets satisfying `invariant` that `acl` permits.
    pub fn explain(&self, invariant: &'a MatchExpr, acl: &'a Acl) -> Result<Explanation> {
        let bdd = self.bdd();
        let inv = self.compiler.to_bdd(invariant)?;
        let compiled = self.compile(acl)?;
        let target = bdd.apply_and(inv, self.compiler.permitted_by(acl)?);
        debug!("Explaining ACL '{}'", acl.name);

        let dnf = Dnf::new(&self.compiler, inv);
        let conjuncts = dnf.acl(&compiled, LineAction::Permit)?;
        let conjuncts = dnf.simplify(conjuncts, target);
        let provenance = self.provenance(&conjuncts, &[&compiled], None)?;
        Ok(Explanation {
            expr: to_expr(&conjuncts),
            provenance,
        })
    }

    /// Packets satisfying `invariant` that `deny_acl` denies but `permit_acl` permits.
    ///
    /// Swap the arguments for the opposite direction.
    pub fn explain_differential(
        &self,
        invariant: &'a MatchExpr,
        deny_acl: &'a Acl,
        permit_acl: &'a Acl,
    ) -> Result<Explanation> {
        let bdd = self.bdd();
        let inv = self.compiler.to_bdd(invariant)?;
        let denying = self.compile(deny_acl)?;
        let permitting = self.compile(permit_acl)?;
        let target = bdd.apply_and_many([
            inv,
            self.compiler.denied_by(deny_acl)?,
            self.compiler.permitted_by(permit_acl)?,
        ]);
        debug!(
            "Explaining difference between ACLs '{}' and '{}'",
            deny_acl.name, permit_acl.name
        );

        let dnf = Dnf::new(&self.compiler, inv);
        let permitted = dnf.acl(&permitting, LineAction::Permit)?;
        let denied = dnf.acl(&denying, LineAction::Deny)?;
        let conjuncts = dnf.simplify(dnf.product(&permitted, &denied), target);
        let provenance = self.provenance(&conjuncts, &[&denying, &permitting], Some(inv))?;
        Ok(Explanation {
            expr: to_expr(&conjuncts),
            provenance,
        })
    }

    fn compile(&self, acl: &'a Acl) -> Result<CompiledAcl<'a>> {
        let lines = self.compiler.reach_and_match_lines(acl)?;
        let matches = self.compiler.line_matches(acl)?;
        Ok(CompiledAcl { acl, lines, matches })
    }

    /// Lines whose compiled match overlaps an atom, in every given ACL.
    ///
    /// With `reachable_under`, lines that no packet of that region reaches
    /// are left out.
    fn provenance(
        &self,
        conjuncts: &[Conjunct<'a>],
        acls: &[&CompiledAcl<'a>],
        reachable_under: Option<Ref>,
    ) -> Result<Provenance> {
        let bdd = self.bdd();
        let mut provenance = Provenance::default();
        for lit in conjuncts.iter().flat_map(|c| c.lits.iter()) {
            if provenance.get(lit.atom).is_some() {
                continue;
            }
            let atom = self.compiler.to_bdd(lit.atom)?;
            let mut lines = BTreeSet::new();
            for compiled in acls {
                for (i, line) in compiled.acl.lines.iter().enumerate() {
                    if !bdd.intersects(compiled.matches[i], atom) {
                        continue;
                    }
                    if let Some(region) = reachable_under {
                        if !bdd.intersects(compiled.lines[i].matched, region) {
                            continue;
                        }
                    }
                    lines.insert(LineRef::new(compiled.acl.name.as_str(), i));
                }
            }
            provenance.entries.push((lit.atom.clone(), lines));
        }
        Ok(provenance)
    }
}

fn to_expr(conjuncts: &[Conjunct<'_>]) -> MatchExpr {
    let mut disjuncts: Vec<MatchExpr> = conjuncts
        .iter()
        .map(|c| {
            let mut lits: Vec<MatchExpr> = c.lits.iter().map(|l| l.to_expr()).collect();
            match lits.len() {
                0 => MatchExpr::True,
                1 => lits.remove(0),
                _ => MatchExpr::And(lits),
            }
        })
        .collect();
    match disjuncts.len() {
        0 => MatchExpr::False,
        1 => disjuncts.remove(0),
        _ => MatchExpr::Or(disjuncts),
    }
}

/// DNF construction under a fixed invariant region.
///
/// Conjuncts that are empty under the invariant are pruned as soon as they
/// appear.
struct Dnf<'c, 'a> {
    compiler: &'c AclCompiler<'a>,
    inv: Ref,
}

impl<'c, 'a> Dnf<'c, 'a> {
    fn new(compiler: &'c AclCompiler<'a>, inv: Ref) -> Self {
        Self { compiler, inv }
    }

    fn bdd(&self) -> &'a Bdd {
        self.compiler.bdd()
    }

    fn unit(&self) -> Conjunct<'a> {
        Conjunct {
            lits: Vec::new(),
            region: self.inv,
        }
    }

    /// DNF of `expr`, or of its negation when `positive` is false.
    fn expr(&self, expr: &'a MatchExpr, positive: bool) -> Result<Vec<Conjunct<'a>>> {
        match (expr, positive) {
            (MatchExpr::True, true) | (MatchExpr::False, false) => Ok(vec![self.unit()]),
            (MatchExpr::True, false) | (MatchExpr::False, true) => Ok(Vec::new()),
            (MatchExpr::Not(e), _) => self.expr(e, !positive),
            (MatchExpr::And(es), true) | (MatchExpr::Or(es), false) => {
                let mut acc = vec![self.unit()];
                for e in es {
                    let next = self.expr(e, positive)?;
                    acc = self.product(&acc, &next);
                    if acc.is_empty() {
                        break;
                    }
                }
                Ok(acc)
            }
            (MatchExpr::Or(es), true) | (MatchExpr::And(es), false) => {
                let mut acc = Vec::new();
                for e in es {
                    acc.extend(self.expr(e, positive)?);
                }
                Ok(acc)
            }
            (atom, _) => {
                let bdd = self.bdd();
                let f = self.compiler.to_bdd(atom)?;
                let f = if positive { f } else { -f };
                let region = bdd.apply_and(self.inv, f);
                if bdd.is_zero(region) {
                    return Ok(Vec::new());
                }
                Ok(vec![Conjunct {
                    lits: vec![Literal { atom, positive, f }],
                    region,
                }])
            }
        }
    }

    fn product(&self, left: &[Conjunct<'a>], right: &[Conjunct<'a>]) -> Vec<Conjunct<'a>> {
        let bdd = self.bdd();
        let mut res = Vec::new();
        for x in left {
            for y in right {
                let region = bdd.apply_and(x.region, y.region);
                if bdd.is_zero(region) {
                    continue;
                }
                let mut lits = x.lits.clone();
                for lit in &y.lits {
                    if !lits.iter().any(|l| l.same(lit)) {
                        lits.push(*lit);
                    }
                }
                res.push(Conjunct { lits, region });
            }
        }
        res
    }

    /// DNF of the packets for which the ACL's decision is `action`.
    ///
    /// Line `i` contributes its own expression AND the negations of the
    /// earlier lines that overlap it. For `Deny`, the implicit deny at the
    /// end contributes the negation of every line.
    fn acl(&self, compiled: &CompiledAcl<'a>, action: LineAction) -> Result<Vec<Conjunct<'a>>> {
        let bdd = self.bdd();
        let acl = compiled.acl;
        let mut res = Vec::new();
        for (i, line) in acl.lines.iter().enumerate() {
            if line.action != action || !bdd.intersects(compiled.lines[i].matched, self.inv) {
                continue;
            }
            let here = bdd.apply_and(self.inv, compiled.matches[i]);
            let mut acc = self.expr(&line.expr, true)?;
            for j in 0..i {
                if acc.is_empty() {
                    break;
                }
                if bdd.intersects(compiled.matches[j], here) {
                    acc = self.product(&acc, &self.expr(&acl.lines[j].expr, false)?);
                }
            }
            res.extend(acc);
        }

        if action == LineAction::Deny {
            let mut acc = vec![self.unit()];
            for (j, line) in acl.lines.iter().enumerate() {
                if acc.is_empty() {
                    break;
                }
                if bdd.intersects(compiled.matches[j], self.inv) {
                    acc = self.product(&acc, &self.expr(&line.expr, false)?);
                }
            }
            res.extend(acc);
        }
        Ok(res)
    }

    /// Drop redundant literals, then disjuncts contained in other disjuncts.
    ///
    /// Every conjunct must lie inside `target`.
    fn simplify(&self, conjuncts: Vec<Conjunct<'a>>, target: Ref) -> Vec<Conjunct<'a>> {
        let bdd = self.bdd();

        let mut reduced: Vec<Conjunct<'a>> = Vec::with_capacity(conjuncts.len());
        for mut conj in conjuncts {
            let mut i = 0;
            while i < conj.lits.len() {
                let rest = conj
                    .lits
                    .iter()
                    .enumerate()
                    .filter(|&(k, _)| k != i)
                    .map(|(_, l)| l.f);
                let region = bdd.apply_and(self.inv, bdd.apply_and_many(rest));
                if bdd.is_implies(region, target) {
                    conj.lits.remove(i);
                } else {
                    i += 1;
                }
            }
            conj.region = bdd.apply_and(self.inv, bdd.apply_and_many(conj.lits.iter().map(|l| l.f)));
            reduced.push(conj);
        }

        let mut keep = vec![true; reduced.len()];
        for j in 0..reduced.len() {
            for k in 0..reduced.len() {
                if j == k || !keep[k] {
                    continue;
                }
                let (rj, rk) = (reduced[j].region, reduced[k].region);
                // Equal regions keep the earlier disjunct.
                if bdd.is_implies(rj, rk) && (rj != rk || k < j) {
                    keep[j] = false;
                    break;
                }
            }
        }

        let res: Vec<Conjunct<'a>> = reduced
            .into_iter()
            .zip(keep)
            .filter_map(|(c, k)| k.then_some(c))
            .collect();
        debug!("Explanation has {} disjuncts", res.len());
        res
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use test_log::test;

    use super::*;
    use crate::acl::AclLine;
    use crate::header_space::HeaderSpace;
    use crate::source::Source;

    fn dst(space: impl Into<IpSpace>) -> MatchExpr {
        HeaderSpace::new().with_dst_ips(space).into()
    }

    fn prefix(a: u8, b: u8, c: u8, d: u8, len: u8) -> MatchExpr {
        dst(IpSpace::prefix(Ipv4Addr::new(a, b, c, d), len))
    }

    fn lines(xs: &[usize], acl: &str) -> BTreeSet<LineRef> {
        xs.iter().map(|&i| LineRef::new(acl, i)).collect()
    }

    struct Ctx {
        pkt: PacketHeaders,
        sources: SourceManager,
        named_acls: BTreeMap<String, Acl>,
        named_ips: BTreeMap<String, IpSpace>,
    }

    impl Ctx {
        fn new() -> Self {
            let pkt = PacketHeaders::new();
            let sources = SourceManager::trivial(pkt.bdd(), [Source::Device]);
            Self {
                pkt,
                sources,
                named_acls: BTreeMap::new(),
                named_ips: BTreeMap::new(),
            }
        }

        fn explainer(&self) -> AclExplainer<'_> {
            AclExplainer::new(&self.pkt, &self.sources, &self.named_acls, &self.named_ips)
        }
    }

    #[test]
    fn test_two_hosts() {
        let ctx = Ctx::new();
        let a = dst(Ipv4Addr::new(1, 1, 1, 1));
        let b = dst(Ipv4Addr::new(2, 2, 2, 2));
        let acl = Acl::new("acl", vec![AclLine::permit(a.clone()), AclLine::permit(b.clone())]);
        let inv = MatchExpr::True;

        let res = ctx.explainer().explain(&inv, &acl).unwrap();
        assert_eq!(res.expr, MatchExpr::or([a.clone(), b.clone()]));
        assert_eq!(res.provenance.len(), 2);
        assert_eq!(res.provenance.get(&a), Some(&lines(&[0], "acl")));
        assert_eq!(res.provenance.get(&b), Some(&lines(&[1], "acl")));
    }

    #[test]
    fn test_subsumed_host_dropped() {
        let ctx = Ctx::new();
        let host = dst(Ipv4Addr::new(1, 1, 1, 1));
        let net = prefix(1, 1, 1, 0, 24);
        let acl = Acl::new("acl", vec![AclLine::permit(host.clone()), AclLine::permit(net.clone())]);
        let inv = MatchExpr::True;

        let res = ctx.explainer().explain(&inv, &acl).unwrap();
        assert_eq!(res.expr, net);
        // The host line also overlaps the prefix.
        assert_eq!(res.provenance.get(&net), Some(&lines(&[0, 1], "acl")));
        assert_eq!(res.provenance.get(&host), None);
    }

    #[test]
    fn test_deny_before_permit() {
        let ctx = Ctx::new();
        let host = dst(Ipv4Addr::new(1, 1, 1, 1));
        let net = prefix(1, 1, 1, 0, 24);
        let acl = Acl::new("acl", vec![AclLine::deny(host.clone()), AclLine::permit(net.clone())]);
        let inv = MatchExpr::True;

        let explainer = ctx.explainer();
        let res = explainer.explain(&inv, &acl).unwrap();
        assert_eq!(res.expr, MatchExpr::and([net.clone(), !host.clone()]));
        assert_eq!(res.provenance.get(&host), Some(&lines(&[0, 1], "acl")));
        assert_eq!(res.provenance.get(&net), Some(&lines(&[0, 1], "acl")));

        // The explanation denotes exactly the permitted region.
        let compiler = explainer.compiler();
        let explained = compiler.to_bdd(&res.expr).unwrap();
        assert_eq!(explained, compiler.permitted_by(&acl).unwrap());
    }

    #[test]
    fn test_invariant() {
        let ctx = Ctx::new();
        let net = prefix(1, 1, 1, 0, 24);
        let acl = Acl::new("acl", vec![AclLine::permit(net.clone())]);

        let explainer = ctx.explainer();
        let inside = dst(Ipv4Addr::new(1, 1, 1, 7));
        let res = explainer.explain(&inside, &acl).unwrap();
        assert_eq!(res.expr, MatchExpr::True);

        let outside = dst(Ipv4Addr::new(9, 9, 9, 9));
        let res = explainer.explain(&outside, &acl).unwrap();
        assert_eq!(res.expr, MatchExpr::False);
        assert!(res.provenance.is_empty());
    }

    #[test]
    fn test_deny_all() {
        let ctx = Ctx::new();
        let acl = Acl::new("acl", vec![AclLine::deny(MatchExpr::True)]);
        let inv = MatchExpr::True;
        let res = ctx.explainer().explain(&inv, &acl).unwrap();
        assert_eq!(res.expr, MatchExpr::False);
    }

    #[test]
    fn test_differential() {
        let ctx = Ctx::new();
        let p16 = prefix(10, 1, 0, 0, 16);
        let p8 = prefix(10, 0, 0, 0, 8);
        let old = Acl::new("old", vec![AclLine::permit(p16.clone()), AclLine::permit(p16.clone())]);
        let new = Acl::new("new", vec![AclLine::permit(p8.clone())]);
        let inv = MatchExpr::True;

        let explainer = ctx.explainer();
        let res = explainer.explain_differential(&inv, &old, &new).unwrap();
        assert_eq!(res.expr, MatchExpr::and([p8.clone(), !p16.clone()]));
        // The duplicate line of `old` is never reached.
        let expected: BTreeSet<LineRef> = lines(&[0], "old").into_iter().chain(lines(&[0], "new")).collect();
        assert_eq!(res.provenance.get(&p8), Some(&expected));
        assert_eq!(res.provenance.get(&p16), Some(&expected));

        let plain = explainer.explain(&inv, &old).unwrap();
        assert_eq!(plain.expr, p16);
        assert_eq!(plain.provenance.get(&p16), Some(&lines(&[0, 1], "old")));

        let reverse = explainer.explain_differential(&inv, &new, &old).unwrap();
        assert_eq!(reverse.expr, MatchExpr::False);
    }

    #[test]
    fn test_display() {
        let ctx = Ctx::new();
        let a = dst(Ipv4Addr::new(1, 1, 1, 1));
        let acl = Acl::new("acl", vec![AclLine::permit(a)]);
        let inv = MatchExpr::True;
        let res = ctx.explainer().explain(&inv, &acl).unwrap();
        assert_eq!(res.to_string(), "{dst_ips=1.1.1.1}\n  {dst_ips=1.1.1.1} <- acl[0]");
    }
}
