//! Conjunctive predicates over packet header fields.
//!
//! A [`HeaderSpace`] constrains each field independently; every populated
//! field must match. Empty lists and absent IP spaces do not constrain their
//! field. `not_*` fields exclude what they match, and the `src_or_dst_*`
//! fields match when either the source or the destination does.

use std::collections::BTreeMap;
use std::fmt;

use crate::bdd::Bdd;
use crate::error::Result;
use crate::integer::{BddInteger, BitVector};
use crate::ip_space::{IpSpace, IpSpaceCompiler};
use crate::packet::{IpProtocol, PacketHeaders, TcpFlag};
use crate::reference::Ref;

/// Inclusive integer range. A range with `start > end` is empty.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubRange {
    pub start: u64,
    pub end: u64,
}

impl SubRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn singleton(value: u64) -> Self {
        Self::new(value, value)
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, value: u64) -> bool {
        self.start <= value && value <= self.end
    }
}

impl fmt::Display for SubRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Required values for some TCP flags; flags not mentioned are free.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct TcpFlagsMatchConditions {
    required: BTreeMap<TcpFlag, bool>,
}

impl TcpFlagsMatchConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, flag: TcpFlag, value: bool) -> Self {
        self.required.insert(flag, value);
        self
    }

    pub fn required(&self) -> impl Iterator<Item = (TcpFlag, bool)> + '_ {
        self.required.iter().map(|(&f, &v)| (f, v))
    }

    /// Conditions of a new TCP connection: SYN without ACK.
    pub fn syn_only() -> Self {
        Self::new().require(TcpFlag::Syn, true).require(TcpFlag::Ack, false)
    }
}

impl fmt::Display for TcpFlagsMatchConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .required()
            .map(|(flag, v)| format!("{}{}", if v { "+" } else { "-" }, flag))
            .collect();
        write!(f, "{}", parts.join(""))
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct HeaderSpace {
    pub dst_ips: Option<IpSpace>,
    pub not_dst_ips: Option<IpSpace>,
    pub src_ips: Option<IpSpace>,
    pub not_src_ips: Option<IpSpace>,
    pub src_or_dst_ips: Option<IpSpace>,
    pub dst_ports: Vec<SubRange>,
    pub not_dst_ports: Vec<SubRange>,
    pub src_ports: Vec<SubRange>,
    pub not_src_ports: Vec<SubRange>,
    pub src_or_dst_ports: Vec<SubRange>,
    pub ip_protocols: Vec<IpProtocol>,
    pub not_ip_protocols: Vec<IpProtocol>,
    pub icmp_types: Vec<SubRange>,
    pub not_icmp_types: Vec<SubRange>,
    pub icmp_codes: Vec<SubRange>,
    pub not_icmp_codes: Vec<SubRange>,
    /// Any one of the conditions must hold.
    pub tcp_flags: Vec<TcpFlagsMatchConditions>,
    pub dscps: Vec<SubRange>,
    pub not_dscps: Vec<SubRange>,
    pub ecns: Vec<SubRange>,
    pub not_ecns: Vec<SubRange>,
    pub fragment_offsets: Vec<SubRange>,
    pub not_fragment_offsets: Vec<SubRange>,
    pub packet_lengths: Vec<SubRange>,
    pub not_packet_lengths: Vec<SubRange>,
    /// Match the complement of the whole space.
    pub negate: bool,
}

impl HeaderSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dst_ips(mut self, space: impl Into<IpSpace>) -> Self {
        self.dst_ips = Some(space.into());
        self
    }

    pub fn with_not_dst_ips(mut self, space: impl Into<IpSpace>) -> Self {
        self.not_dst_ips = Some(space.into());
        self
    }

    pub fn with_src_ips(mut self, space: impl Into<IpSpace>) -> Self {
        self.src_ips = Some(space.into());
        self
    }

    pub fn with_not_src_ips(mut self, space: impl Into<IpSpace>) -> Self {
        self.not_src_ips = Some(space.into());
        self
    }

    pub fn with_src_or_dst_ips(mut self, space: impl Into<IpSpace>) -> Self {
        self.src_or_dst_ips = Some(space.into());
        self
    }

    pub fn with_dst_ports(mut self, ports: impl IntoIterator<Item = SubRange>) -> Self {
        self.dst_ports.extend(ports);
        self
    }

    pub fn with_not_dst_ports(mut self, ports: impl IntoIterator<Item = SubRange>) -> Self {
        self.not_dst_ports.extend(ports);
        self
    }

    pub fn with_src_ports(mut self, ports: impl IntoIterator<Item = SubRange>) -> Self {
        self.src_ports.extend(ports);
        self
    }

    pub fn with_src_or_dst_ports(mut self, ports: impl IntoIterator<Item = SubRange>) -> Self {
        self.src_or_dst_ports.extend(ports);
        self
    }

    pub fn with_ip_protocols(mut self, protocols: impl IntoIterator<Item = IpProtocol>) -> Self {
        self.ip_protocols.extend(protocols);
        self
    }

    pub fn with_not_ip_protocols(mut self, protocols: impl IntoIterator<Item = IpProtocol>) -> Self {
        self.not_ip_protocols.extend(protocols);
        self
    }

    pub fn with_icmp_types(mut self, types: impl IntoIterator<Item = SubRange>) -> Self {
        self.icmp_types.extend(types);
        self
    }

    pub fn with_tcp_flags(mut self, conditions: impl IntoIterator<Item = TcpFlagsMatchConditions>) -> Self {
        self.tcp_flags.extend(conditions);
        self
    }

    pub fn with_dscps(mut self, dscps: impl IntoIterator<Item = SubRange>) -> Self {
        self.dscps.extend(dscps);
        self
    }

    pub fn with_packet_lengths(mut self, lengths: impl IntoIterator<Item = SubRange>) -> Self {
        self.packet_lengths.extend(lengths);
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// Whether no field is constrained (ignoring `negate`).
    pub fn is_unconstrained(&self) -> bool {
        let mut copy = self.clone();
        copy.negate = false;
        copy == HeaderSpace::default()
    }
}

fn push_ranges(parts: &mut Vec<String>, name: &str, ranges: &[SubRange]) {
    if !ranges.is_empty() {
        let items: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
        parts.push(format!("{}=[{}]", name, items.join(",")));
    }
}

impl fmt::Display for HeaderSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let spaces = [
            ("dst_ips", &self.dst_ips),
            ("not_dst_ips", &self.not_dst_ips),
            ("src_ips", &self.src_ips),
            ("not_src_ips", &self.not_src_ips),
            ("src_or_dst_ips", &self.src_or_dst_ips),
        ];
        for (name, space) in spaces {
            if let Some(space) = space {
                parts.push(format!("{}={}", name, space));
            }
        }
        push_ranges(&mut parts, "dst_ports", &self.dst_ports);
        push_ranges(&mut parts, "not_dst_ports", &self.not_dst_ports);
        push_ranges(&mut parts, "src_ports", &self.src_ports);
        push_ranges(&mut parts, "not_src_ports", &self.not_src_ports);
        push_ranges(&mut parts, "src_or_dst_ports", &self.src_or_dst_ports);
        for (name, protocols) in [
            ("ip_protocols", &self.ip_protocols),
            ("not_ip_protocols", &self.not_ip_protocols),
        ] {
            if !protocols.is_empty() {
                let items: Vec<String> = protocols.iter().map(|p| p.to_string()).collect();
                parts.push(format!("{}=[{}]", name, items.join(",")));
            }
        }
        push_ranges(&mut parts, "icmp_types", &self.icmp_types);
        push_ranges(&mut parts, "not_icmp_types", &self.not_icmp_types);
        push_ranges(&mut parts, "icmp_codes", &self.icmp_codes);
        push_ranges(&mut parts, "not_icmp_codes", &self.not_icmp_codes);
        if !self.tcp_flags.is_empty() {
            let items: Vec<String> = self.tcp_flags.iter().map(|c| c.to_string()).collect();
            parts.push(format!("tcp_flags=[{}]", items.join(",")));
        }
        push_ranges(&mut parts, "dscps", &self.dscps);
        push_ranges(&mut parts, "not_dscps", &self.not_dscps);
        push_ranges(&mut parts, "ecns", &self.ecns);
        push_ranges(&mut parts, "not_ecns", &self.not_ecns);
        push_ranges(&mut parts, "fragment_offsets", &self.fragment_offsets);
        push_ranges(&mut parts, "not_fragment_offsets", &self.not_fragment_offsets);
        push_ranges(&mut parts, "packet_lengths", &self.packet_lengths);
        push_ranges(&mut parts, "not_packet_lengths", &self.not_packet_lengths);

        if self.negate {
            write!(f, "!")?;
        }
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Compiles header spaces over the fields of one [`PacketHeaders`].
pub struct HeaderSpaceCompiler<'a> {
    pkt: &'a PacketHeaders,
    dst: IpSpaceCompiler<'a>,
    src: IpSpaceCompiler<'a>,
}

impl<'a> HeaderSpaceCompiler<'a> {
    pub fn new(pkt: &'a PacketHeaders, named_ip_spaces: &'a BTreeMap<String, IpSpace>) -> Self {
        Self {
            pkt,
            dst: IpSpaceCompiler::new(pkt.bdd(), pkt.dst_ip(), named_ip_spaces),
            src: IpSpaceCompiler::new(pkt.bdd(), pkt.src_ip(), named_ip_spaces),
        }
    }

    pub fn dst_ip_compiler(&self) -> &IpSpaceCompiler<'a> {
        &self.dst
    }

    pub fn src_ip_compiler(&self) -> &IpSpaceCompiler<'a> {
        &self.src
    }

    fn bdd(&self) -> &'a Bdd {
        self.pkt.bdd()
    }

    /// Predicate "the packet is in `hs`".
    pub fn compile(&self, hs: &'a HeaderSpace) -> Result<Ref> {
        let bdd = self.bdd();
        let pkt = self.pkt;
        let mut parts = Vec::new();

        if let Some(space) = &hs.dst_ips {
            parts.push(self.dst.compile(space)?);
        }
        if let Some(space) = &hs.not_dst_ips {
            parts.push(-self.dst.compile(space)?);
        }
        if let Some(space) = &hs.src_ips {
            parts.push(self.src.compile(space)?);
        }
        if let Some(space) = &hs.not_src_ips {
            parts.push(-self.src.compile(space)?);
        }
        if let Some(space) = &hs.src_or_dst_ips {
            parts.push(bdd.apply_or(self.src.compile(space)?, self.dst.compile(space)?));
        }

        parts.push(self.positive(pkt.dst_port(), &hs.dst_ports)?);
        parts.push(self.negative(pkt.dst_port(), &hs.not_dst_ports)?);
        parts.push(self.positive(pkt.src_port(), &hs.src_ports)?);
        parts.push(self.negative(pkt.src_port(), &hs.not_src_ports)?);
        if !hs.src_or_dst_ports.is_empty() {
            let src = self.any_range(pkt.src_port(), &hs.src_or_dst_ports)?;
            let dst = self.any_range(pkt.dst_port(), &hs.src_or_dst_ports)?;
            parts.push(bdd.apply_or(src, dst));
        }

        let protocols = |ps: &[IpProtocol]| -> Vec<SubRange> {
            ps.iter().map(|p| SubRange::singleton(p.number() as u64)).collect()
        };
        parts.push(self.positive(pkt.ip_protocol(), &protocols(&hs.ip_protocols))?);
        parts.push(self.negative(pkt.ip_protocol(), &protocols(&hs.not_ip_protocols))?);

        parts.push(self.positive(pkt.icmp_type(), &hs.icmp_types)?);
        parts.push(self.negative(pkt.icmp_type(), &hs.not_icmp_types)?);
        parts.push(self.positive(pkt.icmp_code(), &hs.icmp_codes)?);
        parts.push(self.negative(pkt.icmp_code(), &hs.not_icmp_codes)?);

        if !hs.tcp_flags.is_empty() {
            parts.push(bdd.apply_or_many(hs.tcp_flags.iter().map(|c| self.tcp_flags(c))));
        }

        parts.push(self.positive(pkt.dscp(), &hs.dscps)?);
        parts.push(self.negative(pkt.dscp(), &hs.not_dscps)?);
        parts.push(self.positive(pkt.ecn(), &hs.ecns)?);
        parts.push(self.negative(pkt.ecn(), &hs.not_ecns)?);
        parts.push(self.positive(pkt.fragment_offset(), &hs.fragment_offsets)?);
        parts.push(self.negative(pkt.fragment_offset(), &hs.not_fragment_offsets)?);
        parts.push(self.positive(pkt.packet_length(), &hs.packet_lengths)?);
        parts.push(self.negative(pkt.packet_length(), &hs.not_packet_lengths)?);

        let res = bdd.apply_and_many(parts);
        Ok(if hs.negate { -res } else { res })
    }

    /// Predicate "the field is in one of `ranges`".
    fn any_range(&self, field: &BddInteger, ranges: &[SubRange]) -> Result<Ref> {
        let bdd = self.bdd();
        let mut res = bdd.zero();
        for r in ranges {
            res = bdd.apply_or(res, field.range(bdd, r.start, r.end)?);
        }
        Ok(res)
    }

    fn positive(&self, field: &BddInteger, ranges: &[SubRange]) -> Result<Ref> {
        if ranges.is_empty() {
            return Ok(self.bdd().one());
        }
        self.any_range(field, ranges)
    }

    fn negative(&self, field: &BddInteger, ranges: &[SubRange]) -> Result<Ref> {
        if ranges.is_empty() {
            return Ok(self.bdd().one());
        }
        Ok(-self.any_range(field, ranges)?)
    }

    fn tcp_flags(&self, conditions: &TcpFlagsMatchConditions) -> Ref {
        let pkt = self.pkt;
        self.bdd().apply_and_many(conditions.required().map(|(flag, value)| {
            let x = pkt.tcp_flag(flag);
            if value {
                x
            } else {
                -x
            }
        }))
    }
}
