//! Packet header layout.
//!
//! [`PacketHeaders`] owns the BDD manager of an analysis and allocates one
//! bitvector per header field, in this fixed order (which is also the
//! variable order, root first):
//!
//! | field             | width |
//! |-------------------|-------|
//! | `dst_ip`          | 32    |
//! | `src_ip`          | 32    |
//! | `dst_port`        | 16    |
//! | `src_port`        | 16    |
//! | `ip_protocol`     | 8     |
//! | `icmp_code`       | 8     |
//! | `icmp_type`       | 8     |
//! | TCP flags         | 8 x 1 |
//! | `dscp`            | 6     |
//! | `ecn`             | 2     |
//! | `fragment_offset` | 13    |
//! | `packet_length`   | 16    |
//!
//! TCP flags come in the order `ack, cwr, ece, fin, psh, rst, syn, urg`.
//! Extension fields are appended after everything allocated before them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use log::debug;
use num_bigint::BigUint;

use crate::bdd::{Bdd, BddConfig};
use crate::error::Result;
use crate::integer::{BddInteger, BitVector};
use crate::pairing::Pairing;
use crate::reference::Ref;
use crate::types::Var;

/// IP protocol number.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IpProtocol(pub u8);

impl IpProtocol {
    pub const HOPOPT: IpProtocol = IpProtocol(0);
    pub const ICMP: IpProtocol = IpProtocol(1);
    pub const IGMP: IpProtocol = IpProtocol(2);
    pub const TCP: IpProtocol = IpProtocol(6);
    pub const UDP: IpProtocol = IpProtocol(17);
    pub const GRE: IpProtocol = IpProtocol(47);
    pub const ESP: IpProtocol = IpProtocol(50);
    pub const AH: IpProtocol = IpProtocol(51);
    pub const OSPF: IpProtocol = IpProtocol(89);

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            IpProtocol::HOPOPT => "HOPOPT",
            IpProtocol::ICMP => "ICMP",
            IpProtocol::IGMP => "IGMP",
            IpProtocol::TCP => "TCP",
            IpProtocol::UDP => "UDP",
            IpProtocol::GRE => "GRE",
            IpProtocol::ESP => "ESP",
            IpProtocol::AH => "AH",
            IpProtocol::OSPF => "OSPF",
            _ => return None,
        })
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", self.0),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TcpFlag {
    Ack,
    Cwr,
    Ece,
    Fin,
    Psh,
    Rst,
    Syn,
    Urg,
}

impl TcpFlag {
    /// All flags, in allocation order.
    pub const ALL: [TcpFlag; 8] = [
        TcpFlag::Ack,
        TcpFlag::Cwr,
        TcpFlag::Ece,
        TcpFlag::Fin,
        TcpFlag::Psh,
        TcpFlag::Rst,
        TcpFlag::Syn,
        TcpFlag::Urg,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TcpFlag::Ack => "ACK",
            TcpFlag::Cwr => "CWR",
            TcpFlag::Ece => "ECE",
            TcpFlag::Fin => "FIN",
            TcpFlag::Psh => "PSH",
            TcpFlag::Rst => "RST",
            TcpFlag::Syn => "SYN",
            TcpFlag::Urg => "URG",
        }
    }
}

impl fmt::Display for TcpFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Values of the eight TCP flags.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct TcpFlags {
    bits: [bool; 8],
}

impl TcpFlags {
    pub fn get(&self, flag: TcpFlag) -> bool {
        self.bits[flag.index()]
    }

    pub fn set(&mut self, flag: TcpFlag, value: bool) {
        self.bits[flag.index()] = value;
    }

    pub fn with(mut self, flag: TcpFlag, value: bool) -> Self {
        self.set(flag, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (TcpFlag, bool)> + '_ {
        TcpFlag::ALL.iter().map(|&flag| (flag, self.get(flag)))
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<&str> = self.iter().filter(|(_, v)| *v).map(|(flag, _)| flag.name()).collect();
        write!(f, "[{}]", set.join(","))
    }
}

/// A concrete packet header.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Flow {
    pub dst_ip: Ipv4Addr,
    pub src_ip: Ipv4Addr,
    pub dst_port: u16,
    pub src_port: u16,
    pub ip_protocol: IpProtocol,
    pub icmp_code: u8,
    pub icmp_type: u8,
    pub tcp_flags: TcpFlags,
    pub dscp: u8,
    pub ecn: u8,
    pub fragment_offset: u16,
    pub packet_length: u16,
}

impl Default for Flow {
    fn default() -> Self {
        Self {
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_port: 0,
            src_port: 0,
            ip_protocol: IpProtocol::HOPOPT,
            icmp_code: 0,
            icmp_type: 0,
            tcp_flags: TcpFlags::default(),
            dscp: 0,
            ecn: 0,
            fragment_offset: 0,
            packet_length: 0,
        }
    }
}

impl Flow {
    /// The single packet with exactly these header values.
    ///
    /// Fails if `dscp`, `ecn` or `fragment_offset` exceed their field widths.
    pub fn to_bdd(&self, pkt: &PacketHeaders) -> Result<Ref> {
        let bdd = pkt.bdd();
        let mut parts = vec![
            pkt.dst_ip.equals_value(bdd, u32::from(self.dst_ip) as u64)?,
            pkt.src_ip.equals_value(bdd, u32::from(self.src_ip) as u64)?,
            pkt.dst_port.equals_value(bdd, self.dst_port as u64)?,
            pkt.src_port.equals_value(bdd, self.src_port as u64)?,
            pkt.ip_protocol.equals_value(bdd, self.ip_protocol.0 as u64)?,
            pkt.icmp_code.equals_value(bdd, self.icmp_code as u64)?,
            pkt.icmp_type.equals_value(bdd, self.icmp_type as u64)?,
            pkt.dscp.equals_value(bdd, self.dscp as u64)?,
            pkt.ecn.equals_value(bdd, self.ecn as u64)?,
            pkt.fragment_offset.equals_value(bdd, self.fragment_offset as u64)?,
            pkt.packet_length.equals_value(bdd, self.packet_length as u64)?,
        ];
        for (flag, value) in self.tcp_flags.iter() {
            let x = pkt.tcp_flag(flag);
            parts.push(if value { x } else { -x });
        }
        Ok(bdd.apply_and_many(parts))
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} {}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.ip_protocol
        )?;
        match self.ip_protocol {
            IpProtocol::ICMP => write!(f, " type={} code={}", self.icmp_type, self.icmp_code)?,
            IpProtocol::TCP => write!(f, " flags={}", self.tcp_flags)?,
            _ => {}
        }
        write!(
            f,
            " dscp={} ecn={} fragment_offset={} length={}",
            self.dscp, self.ecn, self.fragment_offset, self.packet_length
        )
    }
}

/// Registry of packet header fields, owning the manager.
pub struct PacketHeaders {
    bdd: Bdd,
    dst_ip: BddInteger,
    src_ip: BddInteger,
    dst_port: BddInteger,
    src_port: BddInteger,
    ip_protocol: BddInteger,
    icmp_code: BddInteger,
    icmp_type: BddInteger,
    tcp_flags: BddInteger,
    dscp: BddInteger,
    ecn: BddInteger,
    fragment_offset: BddInteger,
    packet_length: BddInteger,
    header_vars: Vec<Var>,
    extensions: BTreeMap<String, BddInteger>,
}

impl Default for PacketHeaders {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHeaders")
            .field("bdd", &self.bdd)
            .field("header_vars", &self.header_vars.len())
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PacketHeaders {
    pub const IP_WIDTH: usize = 32;
    pub const PORT_WIDTH: usize = 16;

    pub fn new() -> Self {
        Self::with_config(BddConfig::default())
    }

    pub fn with_config(config: BddConfig) -> Self {
        let bdd = Bdd::with_config(config);
        let alloc = |width: usize| BddInteger::allocate(&bdd, width, false);

        let dst_ip = alloc(Self::IP_WIDTH);
        let src_ip = alloc(Self::IP_WIDTH);
        let dst_port = alloc(Self::PORT_WIDTH);
        let src_port = alloc(Self::PORT_WIDTH);
        let ip_protocol = alloc(8);
        let icmp_code = alloc(8);
        let icmp_type = alloc(8);
        let tcp_flags = alloc(TcpFlag::ALL.len());
        let dscp = alloc(6);
        let ecn = alloc(2);
        let fragment_offset = alloc(13);
        let packet_length = alloc(16);

        let header_vars: Vec<Var> = (1..=bdd.num_vars()).map(Var::new).collect();
        debug!("Allocated {} packet header variables", header_vars.len());

        Self {
            bdd,
            dst_ip,
            src_ip,
            dst_port,
            src_port,
            ip_protocol,
            icmp_code,
            icmp_type,
            tcp_flags,
            dscp,
            ecn,
            fragment_offset,
            packet_length,
            header_vars,
            extensions: BTreeMap::new(),
        }
    }

    pub fn bdd(&self) -> &Bdd {
        &self.bdd
    }

    pub fn dst_ip(&self) -> &BddInteger {
        &self.dst_ip
    }
    pub fn src_ip(&self) -> &BddInteger {
        &self.src_ip
    }
    pub fn dst_port(&self) -> &BddInteger {
        &self.dst_port
    }
    pub fn src_port(&self) -> &BddInteger {
        &self.src_port
    }
    pub fn ip_protocol(&self) -> &BddInteger {
        &self.ip_protocol
    }
    pub fn icmp_code(&self) -> &BddInteger {
        &self.icmp_code
    }
    pub fn icmp_type(&self) -> &BddInteger {
        &self.icmp_type
    }
    pub fn dscp(&self) -> &BddInteger {
        &self.dscp
    }
    pub fn ecn(&self) -> &BddInteger {
        &self.ecn
    }
    pub fn fragment_offset(&self) -> &BddInteger {
        &self.fragment_offset
    }
    pub fn packet_length(&self) -> &BddInteger {
        &self.packet_length
    }

    /// Single-variable predicate "flag is set".
    pub fn tcp_flag(&self, flag: TcpFlag) -> Ref {
        self.tcp_flags.bits()[flag.index()]
    }

    /// Variables of the built-in header fields, in order.
    pub fn header_vars(&self) -> &[Var] {
        &self.header_vars
    }

    /// Allocate a fresh extension bitvector named `name`.
    ///
    /// # Panics
    ///
    /// Panics if a field with this name already exists.
    pub fn allocate_bitvector(&mut self, name: &str, width: usize, signed: bool) -> BddInteger {
        assert!(
            !self.extensions.contains_key(name),
            "Field '{}' is already allocated",
            name
        );
        let first = self.bdd.num_vars() + 1;
        let integer = BddInteger::allocate(&self.bdd, width, signed);
        debug!(
            "Allocated extension field '{}' ({} bits from x{})",
            name, width, first
        );
        self.extensions.insert(name.to_string(), integer.clone());
        integer
    }

    /// Allocate a fresh single-bit extension field named `name`.
    pub fn allocate_bit(&mut self, name: &str) -> Ref {
        self.allocate_bitvector(name, 1, false).bits()[0]
    }

    pub fn extension(&self, name: &str) -> Option<&BddInteger> {
        self.extensions.get(name)
    }

    /// `base` if no extension field has that name yet, else the first free
    /// `base#N`.
    pub fn fresh_field_name(&self, base: &str) -> String {
        if !self.extensions.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{}#{}", base, n))
            .find(|name| !self.extensions.contains_key(name))
            .unwrap_or_else(|| base.to_string())
    }

    /// Pairing that swaps source and destination IPs and ports.
    pub fn swap_source_and_destination_pairing(&self) -> Pairing {
        let ips = Pairing::swap(self.src_ip.vars(), self.dst_ip.vars());
        let ports = Pairing::swap(self.src_port.vars(), self.dst_port.vars());
        ips.compose(&ports)
    }

    /// `f` with source and destination swapped.
    pub fn swap_source_and_destination(&self, f: Ref) -> Ref {
        self.bdd.replace(f, &self.swap_source_and_destination_pairing())
    }

    /// Decode one packet allowed by `f`, `None` if `f` is empty.
    ///
    /// Every field is read from the same assignment, so the result is one
    /// consistent packet. Fields that `f` leaves free decode as zero.
    pub fn packet_from_assignment(&self, f: Ref) -> Option<Flow> {
        let assignment = self.bdd.one_sat_assignment(f)?;
        let value = |integer: &BddInteger| integer.value_under(&self.bdd, &assignment);

        let mut tcp_flags = TcpFlags::default();
        for flag in TcpFlag::ALL {
            tcp_flags.set(flag, self.bdd.eval(self.tcp_flag(flag), &assignment));
        }
        Some(Flow {
            dst_ip: Ipv4Addr::from(value(&self.dst_ip) as u32),
            src_ip: Ipv4Addr::from(value(&self.src_ip) as u32),
            dst_port: value(&self.dst_port) as u16,
            src_port: value(&self.src_port) as u16,
            ip_protocol: IpProtocol(value(&self.ip_protocol) as u8),
            icmp_code: value(&self.icmp_code) as u8,
            icmp_type: value(&self.icmp_type) as u8,
            tcp_flags,
            dscp: value(&self.dscp) as u8,
            ecn: value(&self.ecn) as u8,
            fragment_offset: value(&self.fragment_offset) as u16,
            packet_length: value(&self.packet_length) as u16,
        })
    }

    /// Strict decode of a cube fixing every header variable.
    pub fn flow_from_full_assignment(&self, cube: Ref) -> Result<Flow> {
        let bdd = &self.bdd;
        let value = |integer: &BddInteger| integer.value_from_full_assignment(bdd, cube);

        let flags = value(&self.tcp_flags)?;
        let mut tcp_flags = TcpFlags::default();
        for flag in TcpFlag::ALL {
            let shift = TcpFlag::ALL.len() - 1 - flag.index();
            tcp_flags.set(flag, (flags >> shift) & 1 == 1);
        }
        Ok(Flow {
            dst_ip: Ipv4Addr::from(value(&self.dst_ip)? as u32),
            src_ip: Ipv4Addr::from(value(&self.src_ip)? as u32),
            dst_port: value(&self.dst_port)? as u16,
            src_port: value(&self.src_port)? as u16,
            ip_protocol: IpProtocol(value(&self.ip_protocol)? as u8),
            icmp_code: value(&self.icmp_code)? as u8,
            icmp_type: value(&self.icmp_type)? as u8,
            tcp_flags,
            dscp: value(&self.dscp)? as u8,
            ecn: value(&self.ecn)? as u8,
            fragment_offset: value(&self.fragment_offset)? as u16,
            packet_length: value(&self.packet_length)? as u16,
        })
    }

    /// Number of distinct packet headers allowed by `f`.
    ///
    /// Extension variables are projected away first.
    pub fn count_packets(&self, f: Ref) -> BigUint {
        let extra: Vec<Var> = self
            .extensions
            .values()
            .flat_map(|integer| integer.vars().iter().copied())
            .collect();
        let projected = self.bdd.exists(f, &extra);
        self.bdd.sat_count(projected, self.header_vars.len())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::error::Error;

    #[test]
    fn test_field_order() {
        let pkt = PacketHeaders::new();
        assert_eq!(pkt.dst_ip().vars()[0], Var::new(1));
        assert_eq!(pkt.src_ip().vars()[0], Var::new(33));
        assert_eq!(pkt.dst_port().vars()[0], Var::new(65));
        assert_eq!(pkt.src_port().vars()[0], Var::new(81));
        assert_eq!(pkt.ip_protocol().vars()[0], Var::new(97));
        assert_eq!(pkt.bdd().var_of(pkt.tcp_flag(TcpFlag::Ack)), Some(Var::new(121)));
        assert_eq!(pkt.bdd().var_of(pkt.tcp_flag(TcpFlag::Urg)), Some(Var::new(128)));
        assert_eq!(pkt.header_vars().len(), 32 + 32 + 16 + 16 + 8 + 8 + 8 + 8 + 6 + 2 + 13 + 16);
    }

    #[test]
    fn test_extensions_append() {
        let mut pkt = PacketHeaders::new();
        let before = pkt.bdd().num_vars();
        let x = pkt.allocate_bitvector("hop", 4, false);
        let b = pkt.allocate_bit("marked");

        assert_eq!(x.vars()[0], Var::new(before + 1));
        assert_eq!(pkt.bdd().var_of(b), Some(Var::new(before + 5)));
        assert_eq!(pkt.extension("hop"), Some(&x));
        assert!(pkt.extension("nope").is_none());
        assert_eq!(pkt.header_vars().len() as u32, before);
    }

    #[test]
    #[should_panic(expected = "already allocated")]
    fn test_duplicate_extension() {
        let mut pkt = PacketHeaders::new();
        pkt.allocate_bit("x");
        pkt.allocate_bit("x");
    }

    #[test]
    fn test_flow_roundtrip() {
        let pkt = PacketHeaders::new();
        let flow = Flow {
            dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_ip: Ipv4Addr::new(192, 168, 1, 7),
            dst_port: 443,
            src_port: 49152,
            ip_protocol: IpProtocol::TCP,
            tcp_flags: TcpFlags::default().with(TcpFlag::Syn, true),
            dscp: 46,
            packet_length: 512,
            ..Flow::default()
        };
        let f = flow.to_bdd(&pkt).unwrap();
        assert_eq!(pkt.packet_from_assignment(f), Some(flow.clone()));
        assert_eq!(pkt.flow_from_full_assignment(f), Ok(flow));
        assert_eq!(pkt.count_packets(f), BigUint::from(1u32));
        assert_eq!(pkt.packet_from_assignment(pkt.bdd().zero()), None);
    }

    #[test]
    fn test_flow_out_of_range() {
        let pkt = PacketHeaders::new();
        let flow = Flow {
            dscp: 64,
            ..Flow::default()
        };
        assert!(matches!(flow.to_bdd(&pkt), Err(Error::ValueOutOfRange { width: 6, .. })));
    }

    #[test]
    fn test_partial_flow_is_rejected() {
        let pkt = PacketHeaders::new();
        let f = pkt.dst_port().equals_value(pkt.bdd(), 22).unwrap();
        assert!(pkt.flow_from_full_assignment(f).is_err());

        let flow = pkt.packet_from_assignment(f).unwrap();
        assert_eq!(flow.dst_port, 22);
        assert_eq!(flow.src_port, 0);
    }

    #[test]
    fn test_swap_source_and_destination() {
        let pkt = PacketHeaders::new();
        let bdd = pkt.bdd();
        let f = bdd.apply_and(
            pkt.src_ip().equals_value(bdd, 1).unwrap(),
            pkt.dst_port().equals_value(bdd, 80).unwrap(),
        );
        let g = pkt.swap_source_and_destination(f);
        let expected = bdd.apply_and(
            pkt.dst_ip().equals_value(bdd, 1).unwrap(),
            pkt.src_port().equals_value(bdd, 80).unwrap(),
        );
        assert_eq!(g, expected);
        assert_eq!(pkt.swap_source_and_destination(g), f);
    }

    #[test]
    fn test_count_packets() {
        let mut pkt = PacketHeaders::new();
        let marked = pkt.allocate_bit("marked");
        let bdd = pkt.bdd();
        let f = pkt.ip_protocol().equals_value(bdd, 6).unwrap();
        let total = BigUint::from(1u32) << (pkt.header_vars().len() - 8);
        assert_eq!(pkt.count_packets(f), total);
        assert_eq!(pkt.count_packets(bdd.apply_and(f, marked)), total);
    }
}
