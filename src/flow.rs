//! Picking one representative packet out of a packet set.
//!
//! A set usually contains many packets, most of them unrealistic (port 0,
//! fragments, loopback addresses). [`RepresentativePicker`] walks a ranked
//! list of preferred regions and returns a packet from the first one that
//! overlaps the target set.

use std::fmt;

use log::debug;

use crate::bdd::Bdd;
use crate::error::Result;
use crate::integer::BitVector;
use crate::packet::{Flow, IpProtocol, PacketHeaders, TcpFlag};
use crate::reference::Ref;
use crate::types::Var;

/// Ephemeral source ports (IANA dynamic range).
const EPHEMERAL_PORTS: (u64, u64) = (49152, 65535);
/// Destination ports used by `traceroute` probes.
const TRACEROUTE_PORTS: (u64, u64) = (33434, 33534);
const WELL_KNOWN_TCP_PORTS: [u64; 6] = [22, 23, 80, 443, 3389, 8080];
const WELL_KNOWN_UDP_PORTS: [u64; 4] = [53, 123, 161, 514];
const DEFAULT_PACKET_LENGTH: u64 = 512;
const ICMP_ECHO_REQUEST: u64 = 8;

/// What kind of packet the caller would like to see.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum FlowPreference {
    /// Probes a network engineer would send: ping, then traceroute, then TCP.
    #[default]
    Debugging,
    /// Application traffic: TCP connection setup first.
    Application,
    /// Like `Application`, but leaves source ports alone.
    TestFilter,
}

impl fmt::Display for FlowPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowPreference::Debugging => write!(f, "debugging"),
            FlowPreference::Application => write!(f, "application"),
            FlowPreference::TestFilter => write!(f, "test-filter"),
        }
    }
}

impl FlowPreference {
    /// Ranked preferred regions over the header fields of `pkt`.
    ///
    /// Each protocol region is tried with the common header constraints
    /// first and then alone; the common constraints come last.
    pub fn preferences(&self, pkt: &PacketHeaders) -> Result<Vec<Ref>> {
        let bdd = pkt.bdd();
        let regions = Regions::new(pkt)?;

        let protocols = match self {
            FlowPreference::Debugging => vec![
                regions.icmp_echo,
                bdd.apply_and(regions.udp_traceroute, regions.ephemeral_src),
                bdd.apply_and(regions.tcp_well_known, regions.ephemeral_src),
                regions.tcp_syn,
            ],
            FlowPreference::Application => vec![
                bdd.apply_and(regions.tcp_well_known, regions.ephemeral_src),
                bdd.apply_and(regions.udp_well_known, regions.ephemeral_src),
                regions.tcp_syn,
                regions.icmp_echo,
            ],
            FlowPreference::TestFilter => vec![
                regions.tcp_well_known,
                regions.udp_well_known,
                regions.icmp_echo,
                regions.tcp_syn,
            ],
        };

        let mut res = Vec::with_capacity(2 * protocols.len() + 1);
        for p in protocols {
            res.push(bdd.apply_and(p, regions.common));
            res.push(p);
        }
        res.push(regions.common);
        Ok(res)
    }
}

/// Building blocks of the preference lists.
struct Regions {
    common: Ref,
    ephemeral_src: Ref,
    icmp_echo: Ref,
    udp_traceroute: Ref,
    udp_well_known: Ref,
    tcp_syn: Ref,
    tcp_well_known: Ref,
}

impl Regions {
    fn new(pkt: &PacketHeaders) -> Result<Self> {
        let bdd = pkt.bdd();
        let protocol = |p: IpProtocol| pkt.ip_protocol().equals_value(bdd, p.number() as u64);
        let dst_ports = |ports: &[u64]| -> Result<Ref> {
            let mut res = bdd.zero();
            for &port in ports {
                res = bdd.apply_or(res, pkt.dst_port().equals_value(bdd, port)?);
            }
            Ok(res)
        };

        let common = bdd.apply_and_many([
            unicast(bdd, pkt.dst_ip())?,
            unicast(bdd, pkt.src_ip())?,
            pkt.fragment_offset().equals_value(bdd, 0)?,
            pkt.packet_length().equals_value(bdd, DEFAULT_PACKET_LENGTH)?,
        ]);
        let ephemeral_src = pkt.src_port().range(bdd, EPHEMERAL_PORTS.0, EPHEMERAL_PORTS.1)?;

        let icmp_echo = bdd.apply_and_many([
            protocol(IpProtocol::ICMP)?,
            pkt.icmp_type().equals_value(bdd, ICMP_ECHO_REQUEST)?,
            pkt.icmp_code().equals_value(bdd, 0)?,
        ]);

        let udp = protocol(IpProtocol::UDP)?;
        let udp_traceroute = bdd.apply_and(
            udp,
            pkt.dst_port().range(bdd, TRACEROUTE_PORTS.0, TRACEROUTE_PORTS.1)?,
        );
        let udp_well_known = bdd.apply_and(udp, dst_ports(&WELL_KNOWN_UDP_PORTS)?);

        let syn_only = bdd.apply_and_many(TcpFlag::ALL.iter().map(|&flag| {
            let bit = pkt.tcp_flag(flag);
            if flag == TcpFlag::Syn {
                bit
            } else {
                -bit
            }
        }));
        let tcp_syn = bdd.apply_and(protocol(IpProtocol::TCP)?, syn_only);
        let tcp_well_known = bdd.apply_and(tcp_syn, dst_ports(&WELL_KNOWN_TCP_PORTS)?);

        Ok(Self {
            common,
            ephemeral_src,
            icmp_echo,
            udp_traceroute,
            udp_well_known,
            tcp_syn,
            tcp_well_known,
        })
    }
}

/// Unicast addresses outside `0.0.0.0/8` and `127.0.0.0/8`.
fn unicast(bdd: &Bdd, ip: &impl BitVector) -> Result<Ref> {
    let routable = ip.range(bdd, 0x0100_0000, 0xdfff_ffff)?;
    let loopback = ip.range(bdd, 0x7f00_0000, 0x7fff_ffff)?;
    Ok(bdd.apply_diff(routable, loopback))
}

pub struct RepresentativePicker;

impl RepresentativePicker {
    /// One full assignment over `vars` inside `target`.
    ///
    /// The assignment satisfies the first preference that intersects
    /// `target`, or just `target` when none does. Returns `None` only for
    /// an empty target.
    pub fn pick(bdd: &Bdd, target: Ref, preferences: &[Ref], vars: &[Var]) -> Option<Ref> {
        if bdd.is_zero(target) {
            return None;
        }
        let region = preferences
            .iter()
            .enumerate()
            .map(|(i, &p)| (i, bdd.apply_and(target, p)))
            .find(|&(_, r)| !bdd.is_zero(r));
        let region = match region {
            Some((i, r)) => {
                debug!("Picking from preference {} of {}", i, preferences.len());
                r
            }
            None => {
                debug!("No preference intersects the target");
                target
            }
        };
        bdd.full_sat_one(region, vars)
    }
}

impl PacketHeaders {
    /// A realistic packet in `f`, chosen according to `preference`.
    ///
    /// Returns `Ok(None)` if `f` is empty.
    pub fn representative_flow(&self, f: Ref, preference: FlowPreference) -> Result<Option<Flow>> {
        let preferences = preference.preferences(self)?;
        match RepresentativePicker::pick(self.bdd(), f, &preferences, self.header_vars()) {
            Some(cube) => Ok(Some(self.flow_from_full_assignment(cube)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use test_log::test;

    use super::*;

    #[test]
    fn test_pick_prefers_first_intersecting() {
        let bdd = Bdd::default();
        let vars = bdd.allocate_vars(3);
        let x: Vec<Ref> = vars.iter().map(|&v| bdd.mk_var(v)).collect();

        let target = bdd.apply_or(x[0], x[1]);
        let prefs = [-target, x[2], x[1]];
        let cube = RepresentativePicker::pick(&bdd, target, &prefs, &vars).unwrap();
        assert!(bdd.is_implies(cube, target));
        assert!(bdd.is_implies(cube, x[2]));
        assert!(bdd.is_full_assignment(cube, &vars));
    }

    #[test]
    fn test_pick_falls_back_to_target() {
        let bdd = Bdd::default();
        let vars = bdd.allocate_vars(2);
        let x: Vec<Ref> = vars.iter().map(|&v| bdd.mk_var(v)).collect();

        let target = bdd.apply_and(x[0], -x[1]);
        let cube = RepresentativePicker::pick(&bdd, target, &[x[1], -x[0]], &vars).unwrap();
        assert_eq!(cube, target);

        assert_eq!(RepresentativePicker::pick(&bdd, bdd.zero(), &[x[0]], &vars), None);
        assert_eq!(RepresentativePicker::pick(&bdd, bdd.one(), &[], &vars), Some(bdd.mk_cube([-1, -2])));
    }

    #[test]
    fn test_debugging_prefers_ping() {
        let pkt = PacketHeaders::new();
        let flow = pkt
            .representative_flow(pkt.bdd().one(), FlowPreference::Debugging)
            .unwrap()
            .unwrap();
        assert_eq!(flow.ip_protocol, IpProtocol::ICMP);
        assert_eq!(flow.icmp_type, 8);
        assert_eq!(flow.icmp_code, 0);
        assert_eq!(flow.dst_ip, Ipv4Addr::new(1, 0, 0, 0));
        assert_eq!(flow.packet_length, 512);
        assert_eq!(flow.fragment_offset, 0);
    }

    #[test]
    fn test_application_prefers_tcp_syn() {
        let pkt = PacketHeaders::new();
        let bdd = pkt.bdd();
        let web = pkt.dst_port().equals_value(bdd, 80).unwrap();
        let flow = pkt
            .representative_flow(web, FlowPreference::Application)
            .unwrap()
            .unwrap();
        assert_eq!(flow.ip_protocol, IpProtocol::TCP);
        assert_eq!(flow.dst_port, 80);
        assert_eq!(flow.src_port, 49152);
        assert!(flow.tcp_flags.get(TcpFlag::Syn));
        assert!(!flow.tcp_flags.get(TcpFlag::Ack));
    }

    #[test]
    fn test_udp_target_under_debugging() {
        let pkt = PacketHeaders::new();
        let bdd = pkt.bdd();
        let udp = pkt.ip_protocol().equals_value(bdd, 17).unwrap();
        let flow = pkt
            .representative_flow(udp, FlowPreference::Debugging)
            .unwrap()
            .unwrap();
        assert_eq!(flow.ip_protocol, IpProtocol::UDP);
        assert_eq!(flow.dst_port, 33434);
    }

    #[test]
    fn test_never_leaves_target() {
        let pkt = PacketHeaders::new();
        let bdd = pkt.bdd();
        // Loopback GRE: outside every preference.
        let target = bdd.apply_and(
            pkt.ip_protocol().equals_value(bdd, 47).unwrap(),
            pkt.src_ip().equals_value(bdd, 0x7f00_0001).unwrap(),
        );
        for preference in [
            FlowPreference::Debugging,
            FlowPreference::Application,
            FlowPreference::TestFilter,
        ] {
            let flow = pkt.representative_flow(target, preference).unwrap().unwrap();
            assert_eq!(flow.ip_protocol, IpProtocol::GRE);
            assert_eq!(flow.src_ip, Ipv4Addr::new(127, 0, 0, 1));
            assert!(bdd.is_implies(flow.to_bdd(&pkt).unwrap(), target));
        }

        let empty = pkt.representative_flow(bdd.zero(), FlowPreference::Debugging).unwrap();
        assert_eq!(empty, None);
    }
}
