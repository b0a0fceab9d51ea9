//! Where a packet enters a device.
//!
//! A packet either originates on the device itself or arrives on one of its
//! interfaces. [`SourceManager`] encodes the possible sources into a finite
//! domain, but only when some ACL or session actually looks at the source:
//! otherwise it is trivial, allocates no variables, and every source
//! constraint is ONE.
//!
//! Sources that are active but never referenced cannot be told apart by any
//! policy, so they are folded into one representative value.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::debug;

use crate::acl::{referenced_sources, Acl};
use crate::bdd::Bdd;
use crate::domain::FiniteDomain;
use crate::error::Result;
use crate::packet::PacketHeaders;
use crate::reference::Ref;
use crate::utils::bits_needed;

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Source {
    /// The packet was generated by the device itself.
    Device,
    /// The packet arrived on the named interface.
    Interface(String),
}

impl Source {
    pub fn interface(name: impl Into<String>) -> Self {
        Source::Interface(name.into())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Device => write!(f, "device"),
            Source::Interface(name) => write!(f, "{}", name),
        }
    }
}

/// Sources of one device: which can occur, and which some policy inspects.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DeviceSources {
    active: BTreeSet<Source>,
    referenced: BTreeSet<Source>,
}

impl DeviceSources {
    /// Device whose packets may arrive on `active_interfaces` or originate locally.
    pub fn new(active_interfaces: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut active: BTreeSet<Source> = active_interfaces.into_iter().map(Source::interface).collect();
        active.insert(Source::Device);
        Self {
            active,
            referenced: BTreeSet::new(),
        }
    }

    /// Record the sources `acl` inspects, following named ACL references.
    pub fn referencing(mut self, acl: &Acl, named_acls: &BTreeMap<String, Acl>) -> Self {
        self.referenced.extend(referenced_sources(acl, named_acls));
        self
    }

    /// Record interfaces whose sessions must remember the ingress interface.
    pub fn with_session_interfaces(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.referenced.extend(names.into_iter().map(Source::interface));
        self
    }

    pub fn with_referenced(mut self, sources: impl IntoIterator<Item = Source>) -> Self {
        self.referenced.extend(sources);
        self
    }

    pub fn active(&self) -> &BTreeSet<Source> {
        &self.active
    }

    pub fn referenced(&self) -> &BTreeSet<Source> {
        &self.referenced
    }

    /// Values the device needs encoded, or `None` if the device is trivial.
    fn encoded_sources(&self) -> Option<Encoding> {
        let tracked: BTreeSet<Source> = self.active.intersection(&self.referenced).cloned().collect();
        if tracked.is_empty() {
            return None;
        }
        let untracked: BTreeSet<Source> = self.active.difference(&tracked).cloned().collect();
        let representative = untracked.iter().next().cloned();
        Some(Encoding {
            tracked,
            untracked,
            representative,
        })
    }
}

struct Encoding {
    tracked: BTreeSet<Source>,
    untracked: BTreeSet<Source>,
    representative: Option<Source>,
}

impl Encoding {
    fn values(&self) -> impl Iterator<Item = &Source> + '_ {
        self.tracked.iter().chain(self.representative.iter())
    }
}

#[derive(Debug, Clone)]
pub struct SourceManager {
    domain: Option<FiniteDomain<Source>>,
    sources: BTreeSet<Source>,
    folded: BTreeMap<Source, Source>,
    one: Ref,
    zero: Ref,
}

impl SourceManager {
    /// Manager that does not distinguish sources at all.
    pub fn trivial(bdd: &Bdd, sources: impl IntoIterator<Item = Source>) -> Self {
        Self {
            domain: None,
            sources: sources.into_iter().collect(),
            folded: BTreeMap::new(),
            one: bdd.one(),
            zero: bdd.zero(),
        }
    }

    /// Manager for one device.
    ///
    /// Trivial when no active source is referenced. Otherwise the codes live
    /// in an extension field named `name`, or `name#1`, `name#2`, ... when
    /// that name is already taken, so managers of several devices can share
    /// one registry.
    pub fn for_sources(pkt: &mut PacketHeaders, name: &str, device: &DeviceSources) -> Self {
        let Some(encoding) = device.encoded_sources() else {
            debug!("Source manager '{}' is trivial", name);
            return Self::trivial(pkt.bdd(), device.active.iter().cloned());
        };
        let values: Vec<Source> = encoding.values().cloned().collect();
        debug!(
            "Source manager '{}' tracks {} of {} sources",
            name,
            encoding.tracked.len(),
            device.active.len()
        );
        let field = pkt.fresh_field_name(name);
        let domain = FiniteDomain::new(pkt, &field, values);
        Self::with_domain(pkt.bdd(), domain, device, encoding)
    }

    /// Managers for every device of a network, over one shared bitvector.
    ///
    /// The same source name has the same code on every device, so constraints
    /// can be compared across devices. Devices whose sources are never
    /// referenced get trivial managers.
    pub fn for_network(
        pkt: &mut PacketHeaders,
        name: &str,
        devices: &BTreeMap<String, DeviceSources>,
    ) -> Result<BTreeMap<String, SourceManager>> {
        let encodings: BTreeMap<&String, Option<Encoding>> = devices
            .iter()
            .map(|(device, sources)| (device, sources.encoded_sources()))
            .collect();

        let global: BTreeSet<Source> = encodings
            .values()
            .flatten()
            .flat_map(|e| e.values().cloned())
            .collect();
        let codes: BTreeMap<Source, u64> = global.iter().cloned().zip(0..).collect();

        let integer = if global.is_empty() {
            None
        } else {
            debug!("Network source domain '{}' has {} values", name, global.len());
            Some(pkt.allocate_bitvector(name, bits_needed(global.len()), false))
        };

        let mut managers = BTreeMap::new();
        for (device, encoding) in encodings {
            let sources = &devices[device];
            let manager = match (encoding, &integer) {
                (Some(encoding), Some(integer)) => {
                    let encoded = encoding.values().map(|s| (s.clone(), codes[s]));
                    let domain = FiniteDomain::with_encoding(pkt.bdd(), integer.clone(), encoded)?;
                    Self::with_domain(pkt.bdd(), domain, sources, encoding)
                }
                _ => Self::trivial(pkt.bdd(), sources.active.iter().cloned()),
            };
            managers.insert(device.clone(), manager);
        }
        Ok(managers)
    }

    fn with_domain(bdd: &Bdd, domain: FiniteDomain<Source>, device: &DeviceSources, encoding: Encoding) -> Self {
        let folded = match &encoding.representative {
            Some(repr) => encoding
                .untracked
                .iter()
                .map(|s| (s.clone(), repr.clone()))
                .collect(),
            None => BTreeMap::new(),
        };
        Self {
            domain: Some(domain),
            sources: device.active.clone(),
            folded,
            one: bdd.one(),
            zero: bdd.zero(),
        }
    }

    pub fn is_trivial(&self) -> bool {
        self.domain.is_none()
    }

    /// Whether every source has a code of its own.
    ///
    /// False when two or more sources are folded into one code, or when a
    /// trivial manager stands for more than one source.
    pub fn all_sources_tracked(&self) -> bool {
        match self.domain {
            None => self.sources.len() <= 1,
            Some(_) => self.folded.len() <= 1,
        }
    }

    /// Every source that can occur on the device.
    pub fn sources(&self) -> impl Iterator<Item = &Source> + '_ {
        self.sources.iter()
    }

    /// Predicate "the packet entered from `source`".
    ///
    /// ONE for every source of a trivial manager. A source the device does
    /// not have, such as an unknown interface name, never matches: it gets
    /// ZERO rather than an error.
    pub fn source_bdd(&self, source: &Source) -> Ref {
        let Some(domain) = &self.domain else {
            return self.one;
        };
        let source = self.folded.get(source).unwrap_or(source);
        domain.constraint_for_value(source).unwrap_or(self.zero)
    }

    pub fn interface_bdd(&self, name: &str) -> Ref {
        self.source_bdd(&Source::interface(name))
    }

    pub fn originating_from_device_bdd(&self) -> Ref {
        self.source_bdd(&Source::Device)
    }

    /// Predicate "the source encoding is valid".
    pub fn is_valid_value(&self) -> Ref {
        match &self.domain {
            Some(domain) => domain.is_valid_value(),
            None => self.one,
        }
    }

    /// Source of one satisfying assignment of `f`.
    ///
    /// A trivial manager cannot tell, and returns `None`.
    pub fn source_from_assignment(&self, bdd: &Bdd, f: Ref) -> Option<Source> {
        self.domain.as_ref()?.value_from_assignment(bdd, f)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::acl::{AclLine, MatchExpr};

    #[test]
    fn test_trivial_allocates_nothing() {
        let mut pkt = PacketHeaders::new();
        let before = pkt.bdd().num_vars();
        let device = DeviceSources::new(["eth0", "eth1"]);
        let mgr = SourceManager::for_sources(&mut pkt, "src", &device);

        assert!(mgr.is_trivial());
        assert_eq!(pkt.bdd().num_vars(), before);
        assert_eq!(mgr.interface_bdd("eth0"), pkt.bdd().one());
        assert_eq!(mgr.originating_from_device_bdd(), pkt.bdd().one());
        assert_eq!(mgr.source_from_assignment(pkt.bdd(), pkt.bdd().one()), None);
        assert!(!mgr.all_sources_tracked());
    }

    #[test]
    fn test_tracked_and_folded() {
        let mut pkt = PacketHeaders::new();
        let device = DeviceSources::new(["eth0", "eth1", "eth2", "eth3"])
            .with_referenced([Source::interface("eth0"), Source::interface("ghost")]);
        let mgr = SourceManager::for_sources(&mut pkt, "src", &device);
        let bdd = pkt.bdd();

        assert!(!mgr.is_trivial());
        assert!(!mgr.all_sources_tracked());
        let eth0 = mgr.interface_bdd("eth0");
        let eth1 = mgr.interface_bdd("eth1");
        assert!(!bdd.intersects(eth0, eth1));
        // Untracked sources share a code.
        assert_eq!(eth1, mgr.interface_bdd("eth3"));
        assert_eq!(eth1, mgr.originating_from_device_bdd());
        // Referenced but inactive sources do not exist on the device.
        assert_eq!(mgr.interface_bdd("ghost"), bdd.zero());
        assert_eq!(mgr.source_from_assignment(bdd, eth0), Some(Source::interface("eth0")));
        assert_eq!(mgr.is_valid_value(), bdd.apply_or(eth0, eth1));
    }

    #[test]
    fn test_all_sources_tracked() {
        let mut pkt = PacketHeaders::new();
        let device = DeviceSources::new(["eth0", "eth1"]).with_referenced([
            Source::interface("eth0"),
            Source::interface("eth1"),
            Source::Device,
        ]);
        let mgr = SourceManager::for_sources(&mut pkt, "src", &device);
        let bdd = pkt.bdd();

        assert!(!mgr.is_trivial());
        assert!(mgr.all_sources_tracked());
        let codes: Vec<Ref> = mgr.sources().map(|s| mgr.source_bdd(s)).collect();
        assert_eq!(codes.len(), 3);
        for (i, &a) in codes.iter().enumerate() {
            for &b in &codes[i + 1..] {
                assert!(!bdd.intersects(a, b));
            }
        }

        // A single untracked source keeps a code of its own.
        let mut pkt = PacketHeaders::new();
        let device = DeviceSources::new(["eth0", "eth1"])
            .with_referenced([Source::interface("eth0"), Source::interface("eth1")]);
        let mgr = SourceManager::for_sources(&mut pkt, "src", &device);
        assert!(mgr.all_sources_tracked());
        assert_ne!(mgr.originating_from_device_bdd(), mgr.interface_bdd("eth0"));
    }

    #[test]
    fn test_trivial_single_source() {
        let pkt = PacketHeaders::new();
        let mgr = SourceManager::trivial(pkt.bdd(), [Source::Device]);
        assert!(mgr.is_trivial());
        assert!(mgr.all_sources_tracked());

        let mut pkt = PacketHeaders::new();
        let mgr = SourceManager::for_sources(&mut pkt, "src", &DeviceSources::new(Vec::<String>::new()));
        assert!(mgr.is_trivial());
        assert!(mgr.all_sources_tracked());
        assert_eq!(mgr.sources().collect::<Vec<_>>(), vec![&Source::Device]);
    }

    #[test]
    fn test_unknown_interface_never_matches() {
        let mut pkt = PacketHeaders::new();
        let device = DeviceSources::new(["eth0"]).with_referenced([Source::interface("eth0")]);
        let mgr = SourceManager::for_sources(&mut pkt, "src", &device);
        assert_eq!(mgr.interface_bdd("nope"), pkt.bdd().zero());
    }

    #[test]
    fn test_devices_share_registry() {
        let mut pkt = PacketHeaders::new();
        let r1 = DeviceSources::new(["eth0", "eth1"]).with_referenced([Source::interface("eth0")]);
        let r2 = DeviceSources::new(["ge0", "ge1"]).with_referenced([Source::interface("ge1")]);
        let m1 = SourceManager::for_sources(&mut pkt, "src", &r1);
        let m2 = SourceManager::for_sources(&mut pkt, "src", &r2);
        let bdd = pkt.bdd();

        assert!(pkt.extension("src").is_some());
        assert!(pkt.extension("src#1").is_some());
        let (a, b) = (m1.interface_bdd("eth0"), m2.interface_bdd("ge1"));
        assert!(bdd.support(a).is_disjoint(&bdd.support(b)));
        assert!(bdd.intersects(a, b));
    }

    #[test]
    fn test_referencing_acl() {
        let mut pkt = PacketHeaders::new();
        let acl = Acl::new(
            "in",
            vec![AclLine::permit(MatchExpr::source_interfaces(["eth1"]))],
        );
        let device = DeviceSources::new(["eth0", "eth1"]).referencing(&acl, &BTreeMap::new());
        let mgr = SourceManager::for_sources(&mut pkt, "src", &device);

        assert!(!mgr.is_trivial());
        assert_ne!(mgr.interface_bdd("eth0"), mgr.interface_bdd("eth1"));
        // eth0 and the device itself are folded together.
        assert_eq!(mgr.interface_bdd("eth0"), mgr.originating_from_device_bdd());
        assert!(!mgr.all_sources_tracked());
    }

    #[test]
    fn test_network_shares_codes() {
        let mut pkt = PacketHeaders::new();
        let devices = BTreeMap::from([
            (
                "r1".to_string(),
                DeviceSources::new(["a", "b"]).with_session_interfaces(["a"]),
            ),
            (
                "r2".to_string(),
                DeviceSources::new(["a", "c"]).with_session_interfaces(["a", "c"]),
            ),
            ("r3".to_string(), DeviceSources::new(["z"])),
        ]);
        let managers = SourceManager::for_network(&mut pkt, "src", &devices).unwrap();

        assert_eq!(managers["r1"].interface_bdd("a"), managers["r2"].interface_bdd("a"));
        assert!(managers["r3"].is_trivial());
        assert!(!managers["r1"].is_trivial());
        assert!(pkt.extension("src").is_some());
    }

    #[test]
    fn test_network_all_trivial() {
        let mut pkt = PacketHeaders::new();
        let devices = BTreeMap::from([("r1".to_string(), DeviceSources::new(["a"]))]);
        let managers = SourceManager::for_network(&mut pkt, "src", &devices).unwrap();
        assert!(managers["r1"].is_trivial());
        assert!(pkt.extension("src").is_none());
    }
}
