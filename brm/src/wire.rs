//! ICMPv6 Neighbor Discovery wire codec: Router Solicitation, Router
//! Advertisement (with PIO/RIO/RDNSS options) and Neighbor Solicitation,
//! per RFC 4861 (ND), RFC 4191 (RIO) and RFC 8106 (RDNSS).
//!
//! Hand-rolled with `Vec<u8>`/`push`/`extend_from_slice` rather than
//! pulled in from a packet-parsing crate, since BRM only ever needs this
//! one fixed set of message shapes.

use std::net::Ipv6Addr;

use crate::prefix::IPv6Prefix;

// ── ICMPv6 message types ─────────────────────────────────────────────────

pub const ICMP6_ROUTER_SOLICIT: u8 = 133;
pub const ICMP6_ROUTER_ADVERT: u8 = 134;
pub const ICMP6_NEIGHBOR_SOLICIT: u8 = 135;
pub const ICMP6_NEIGHBOR_ADVERT: u8 = 136;

// ── ND option types ───────────────────────────────────────────────────────

const OPT_PREFIX_INFORMATION: u8 = 3;
const OPT_ROUTE_INFORMATION: u8 = 24;
const OPT_RDNSS: u8 = 25;

// RA header flags
const FLAG_M: u8 = 0x80;
const FLAG_O: u8 = 0x40;
/// SNAC (Stub/Non-Advertising-Complete) router flag, Thread 1.4 extension,
/// encoded in the otherwise-reserved bit of the RA flags byte.
const FLAG_SNAC: u8 = 0x10;

/// Route preference, RFC 4191 §2.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Preference {
    Low,
    Medium,
    High,
}

impl Preference {
    fn to_bits(self) -> u8 {
        match self {
            Preference::High => 0b01,
            Preference::Medium => 0b00,
            Preference::Low => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Preference {
        match bits & 0b11 {
            0b01 => Preference::High,
            0b11 => Preference::Low,
            _ => Preference::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RaHeaderFlags {
    pub router_lifetime: u16,
    pub managed: bool,
    pub other_config: bool,
    pub snac: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PrefixInfoOption {
    pub prefix: IPv6Prefix,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteInfoOption {
    pub prefix: IPv6Prefix,
    pub preference: Preference,
    pub lifetime: u32,
}

#[derive(Debug, Clone)]
pub struct RdnssOptionData {
    pub lifetime: u32,
    pub addresses: Vec<Ipv6Addr>,
}

#[derive(Debug, Clone)]
pub struct ParsedRouterAdvertisement {
    pub flags: RaHeaderFlags,
    pub pios: Vec<PrefixInfoOption>,
    pub rios: Vec<RouteInfoOption>,
    pub rdnss: Vec<RdnssOptionData>,
}

// ── Building outbound messages ───────────────────────────────────────────

/// Builds a complete Router Advertisement. The ICMPv6 checksum field is
/// left zero; raw ICMPv6 sockets (`IPPROTO_ICMPV6`) have the kernel
/// compute it.
pub fn build_router_advertisement(
    flags: &RaHeaderFlags,
    pios: &[PrefixInfoOption],
    rios: &[RouteInfoOption],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + pios.len() * 32 + rios.len() * 24);

    buf.push(ICMP6_ROUTER_ADVERT);
    buf.push(0); // code
    buf.extend_from_slice(&[0, 0]); // checksum placeholder

    buf.push(64); // Cur Hop Limit
    let mut flag_byte = FLAG_SNAC; // BRM always sets its own SNAC flag
    if flags.managed {
        flag_byte |= FLAG_M;
    }
    if flags.other_config {
        flag_byte |= FLAG_O;
    }
    buf.push(flag_byte);
    buf.extend_from_slice(&flags.router_lifetime.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // Reachable Time
    buf.extend_from_slice(&0u32.to_be_bytes()); // Retrans Timer

    for pio in pios {
        append_pio(&mut buf, pio);
    }
    for rio in rios {
        append_rio(&mut buf, rio);
    }

    buf
}

fn append_pio(buf: &mut Vec<u8>, pio: &PrefixInfoOption) {
    buf.push(OPT_PREFIX_INFORMATION);
    buf.push(4); // length in units of 8 bytes = 32 bytes
    buf.push(pio.prefix.length());
    let mut flags = 0u8;
    if pio.on_link {
        flags |= 0x80;
    }
    if pio.autonomous {
        flags |= 0x40;
    }
    buf.push(flags);
    buf.extend_from_slice(&pio.valid_lifetime.to_be_bytes());
    buf.extend_from_slice(&pio.preferred_lifetime.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // reserved
    buf.extend_from_slice(&pio.prefix.octets());
}

fn append_rio(buf: &mut Vec<u8>, rio: &RouteInfoOption) {
    // RIO length depends on prefix length: 1 (0 bits), 2 (1-64), 3 (65-128).
    let len_units: u8 = match rio.prefix.length() {
        0 => 1,
        1..=64 => 2,
        _ => 3,
    };
    buf.push(OPT_ROUTE_INFORMATION);
    buf.push(len_units);
    buf.push(rio.prefix.length());
    buf.push(rio.preference.to_bits() << 3);
    buf.extend_from_slice(&rio.lifetime.to_be_bytes());
    let prefix_bytes = (len_units as usize - 1) * 8;
    buf.extend_from_slice(&rio.prefix.octets()[..prefix_bytes]);
}

/// Builds a Router Solicitation (no source-link-layer-address option —
/// BRM solicits from a stable address and doesn't require callers to
/// resolve its link-layer address from the RS alone).
pub fn build_router_solicitation() -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.push(ICMP6_ROUTER_SOLICIT);
    buf.push(0);
    buf.extend_from_slice(&[0, 0]); // checksum placeholder
    buf.extend_from_slice(&0u32.to_be_bytes()); // reserved
    buf
}

/// Builds a unicast Neighbor Solicitation targeting `target`.
pub fn build_neighbor_solicitation(target: Ipv6Addr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.push(ICMP6_NEIGHBOR_SOLICIT);
    buf.push(0);
    buf.extend_from_slice(&[0, 0]); // checksum placeholder
    buf.extend_from_slice(&0u32.to_be_bytes()); // reserved
    buf.extend_from_slice(&target.octets());
    buf
}

// ── Parsing inbound messages ─────────────────────────────────────────────

/// Parses a Router Advertisement. Returns `None` on any malformed option
/// (overflowing length, truncated header) — the whole message is dropped,
/// never partially applied.
pub fn parse_router_advertisement(bytes: &[u8]) -> Option<ParsedRouterAdvertisement> {
    if bytes.len() < 16 || bytes[0] != ICMP6_ROUTER_ADVERT {
        return None;
    }
    let flag_byte = bytes[5];
    let router_lifetime = u16::from_be_bytes([bytes[6], bytes[7]]);
    let flags = RaHeaderFlags {
        router_lifetime,
        managed: flag_byte & FLAG_M != 0,
        other_config: flag_byte & FLAG_O != 0,
        snac: flag_byte & FLAG_SNAC != 0,
    };

    let mut pios = Vec::new();
    let mut rios = Vec::new();
    let mut rdnss = Vec::new();

    let mut offset = 16;
    while offset + 2 <= bytes.len() {
        let opt_type = bytes[offset];
        let len_units = bytes[offset + 1] as usize;
        if len_units == 0 {
            return None; // zero-length option is malformed, abort whole message
        }
        let opt_len = len_units * 8;
        if offset + opt_len > bytes.len() {
            return None; // truncated option: drop the whole RA
        }
        let opt = &bytes[offset..offset + opt_len];

        match opt_type {
            OPT_PREFIX_INFORMATION => {
                if let Some(pio) = parse_pio(opt) {
                    pios.push(pio);
                } else {
                    return None;
                }
            }
            OPT_ROUTE_INFORMATION => {
                if let Some(rio) = parse_rio(opt) {
                    rios.push(rio);
                } else {
                    return None;
                }
            }
            OPT_RDNSS => {
                if let Some(r) = parse_rdnss(opt) {
                    rdnss.push(r);
                } else {
                    return None;
                }
            }
            _ => {} // unknown options are skipped, not fatal
        }

        offset += opt_len;
    }

    Some(ParsedRouterAdvertisement {
        flags,
        pios,
        rios,
        rdnss,
    })
}

fn parse_pio(opt: &[u8]) -> Option<PrefixInfoOption> {
    if opt.len() != 32 {
        return None;
    }
    let prefix_len = opt[2];
    let flag_byte = opt[3];
    let valid_lifetime = u32::from_be_bytes(opt[4..8].try_into().ok()?);
    let preferred_lifetime = u32::from_be_bytes(opt[8..12].try_into().ok()?);
    let mut addr_bytes = [0u8; 16];
    addr_bytes.copy_from_slice(&opt[16..32]);
    let prefix = IPv6Prefix::new(Ipv6Addr::from(addr_bytes), prefix_len)?;
    Some(PrefixInfoOption {
        prefix,
        on_link: flag_byte & 0x80 != 0,
        autonomous: flag_byte & 0x40 != 0,
        valid_lifetime,
        preferred_lifetime,
    })
}

fn parse_rio(opt: &[u8]) -> Option<RouteInfoOption> {
    if opt.len() < 8 {
        return None;
    }
    let prefix_len = opt[2];
    let preference = Preference::from_bits(opt[3] >> 3);
    let lifetime = u32::from_be_bytes(opt[4..8].try_into().ok()?);
    let prefix_bytes_len = opt.len() - 8;
    let mut addr_bytes = [0u8; 16];
    addr_bytes[..prefix_bytes_len.min(16)].copy_from_slice(&opt[8..8 + prefix_bytes_len.min(16)]);
    let prefix = IPv6Prefix::new(Ipv6Addr::from(addr_bytes), prefix_len)?;
    Some(RouteInfoOption {
        prefix,
        preference,
        lifetime,
    })
}

fn parse_rdnss(opt: &[u8]) -> Option<RdnssOptionData> {
    if opt.len() < 8 || (opt.len() - 8) % 16 != 0 {
        return None;
    }
    let lifetime = u32::from_be_bytes(opt[4..8].try_into().ok()?);
    let mut addresses = Vec::new();
    let mut offset = 8;
    while offset + 16 <= opt.len() {
        let mut a = [0u8; 16];
        a.copy_from_slice(&opt[offset..offset + 16]);
        addresses.push(Ipv6Addr::from(a));
        offset += 16;
    }
    Some(RdnssOptionData { lifetime, addresses })
}

/// Extracts the target address from a Neighbor Advertisement, used by the
/// NS-probe reachability check.
pub fn parse_neighbor_advertisement_target(bytes: &[u8]) -> Option<Ipv6Addr> {
    if bytes.len() < 24 || bytes[0] != ICMP6_NEIGHBOR_ADVERT {
        return None;
    }
    let mut a = [0u8; 16];
    a.copy_from_slice(&bytes[8..24]);
    Some(Ipv6Addr::from(a))
}
