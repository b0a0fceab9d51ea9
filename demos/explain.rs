use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{bail, eyre, WrapErr};

use netbdd::acl::{Acl, AclCompiler, AclLine, LineAction, MatchExpr};
use netbdd::explain::AclExplainer;
use netbdd::flow::FlowPreference;
use netbdd::header_space::{HeaderSpace, SubRange};
use netbdd::ip_space::IpSpace;
use netbdd::packet::PacketHeaders;
use netbdd::source::{Source, SourceManager};

#[derive(Debug, Copy, Clone, ValueEnum)]
enum Preference {
    Debugging,
    Application,
    TestFilter,
}

impl From<Preference> for FlowPreference {
    fn from(p: Preference) -> Self {
        match p {
            Preference::Debugging => FlowPreference::Debugging,
            Preference::Application => FlowPreference::Application,
            Preference::TestFilter => FlowPreference::TestFilter,
        }
    }
}

/// Explain an ACL given as lines like `permit 10.0.0.0/8` or `deny 10.1.2.3:22`.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// ACL lines, in order.
    #[arg(value_name = "LINE", required = true)]
    lines: Vec<String>,

    /// Lines of a second ACL; explains what it permits but the first denies.
    #[clap(long = "against", value_name = "LINE")]
    against: Vec<String>,

    /// Kind of example packet to show.
    #[clap(long, value_enum, default_value = "debugging")]
    preference: Preference,

    /// BDD size (in bits, so the actual size is `2^size` nodes).
    #[clap(long, value_name = "INT", default_value = "20")]
    size: usize,
}

/// Parse `ACTION ADDR[/LEN][:PORT[-PORT]]`.
fn parse_line(line: &str) -> color_eyre::Result<AclLine> {
    let mut parts = line.split_whitespace();
    let action = match parts.next() {
        Some("permit") => LineAction::Permit,
        Some("deny") => LineAction::Deny,
        other => bail!("expected 'permit' or 'deny', got {:?}", other),
    };
    let target = parts.next().ok_or_else(|| eyre!("missing address in '{}'", line))?;

    let (addr, ports) = match target.split_once(':') {
        Some((addr, ports)) => (addr, Some(ports)),
        None => (target, None),
    };
    let space = match addr {
        "any" => IpSpace::Universe,
        _ => match addr.split_once('/') {
            Some((ip, len)) => {
                let ip: Ipv4Addr = ip.parse().wrap_err_with(|| format!("bad address in '{}'", line))?;
                let len: u8 = len.parse().wrap_err_with(|| format!("bad prefix length in '{}'", line))?;
                if len > 32 {
                    bail!("prefix length {} is longer than 32", len);
                }
                IpSpace::prefix(ip, len)
            }
            None => IpSpace::from(addr.parse::<Ipv4Addr>().wrap_err_with(|| format!("bad address in '{}'", line))?),
        },
    };

    let mut hs = HeaderSpace::new().with_dst_ips(space);
    if let Some(ports) = ports {
        let (lo, hi) = ports.split_once('-').unwrap_or((ports, ports));
        hs = hs.with_dst_ports([SubRange::new(lo.parse()?, hi.parse()?)]);
    }
    Ok(AclLine::new(action, hs).named(line.to_string()))
}

fn parse_acl(name: &str, lines: &[String]) -> color_eyre::Result<Acl> {
    let lines = lines.iter().map(|l| parse_line(l)).collect::<color_eyre::Result<Vec<_>>>()?;
    Ok(Acl::new(name, lines))
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let acl = parse_acl("acl", &args.lines)?;
    let against = if args.against.is_empty() {
        None
    } else {
        Some(parse_acl("against", &args.against)?)
    };

    let pkt = PacketHeaders::with_config(netbdd::bdd::BddConfig::default().with_storage_bits(args.size));
    let sources = SourceManager::trivial(pkt.bdd(), [Source::Device]);
    let named_acls = BTreeMap::new();
    let named_ip_spaces = BTreeMap::new();
    let compiler = AclCompiler::new(&pkt, &sources, &named_acls, &named_ip_spaces);
    let explainer = AclExplainer::new(&pkt, &sources, &named_acls, &named_ip_spaces);
    let invariant = MatchExpr::True;

    for (i, line) in compiler.reach_and_match_lines(&acl)?.iter().enumerate() {
        let matched = pkt.count_packets(line.matched);
        println!("line {} '{}' matches {} packets", i, acl.lines[i], matched);
        if pkt.bdd().is_zero(line.matched) {
            println!("  (unreachable)");
        }
    }

    let (explanation, target) = match &against {
        None => (explainer.explain(&invariant, &acl)?, compiler.permitted_by(&acl)?),
        Some(other) => {
            let target = pkt
                .bdd()
                .apply_and(compiler.denied_by(&acl)?, compiler.permitted_by(other)?);
            (explainer.explain_differential(&invariant, &acl, other)?, target)
        }
    };
    println!("explanation = {}", explanation);
    println!("packets = {}", pkt.count_packets(target));

    match pkt.representative_flow(target, args.preference.into())? {
        Some(flow) => println!("example = {}", flow),
        None => println!("example = none"),
    }

    println!("bdd = {:?}", pkt.bdd());

    let time_total = time_total.elapsed();
    println!("Done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}
