//! Raw-socket `Platform` implementation, ported from `hr-ipv6`'s
//! `ra.rs`/`pd_client.rs` socket setup (`socket2` raw ICMPv6, bound to the
//! infra device, wrapped as a `tokio::net::UdpSocket` for async receive).

use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::path::{Path, PathBuf};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use brm::platform::{NetworkData, Platform, SettingsStore};
use brm::policy::OmrCandidate;
use brm::prefix::IPv6Prefix;
use brm::wire::Preference;

/// Opens the raw ICMPv6 socket used for both sending (via the blocking
/// `Platform::send_icmp6_nd`) and receiving (via the async loop in
/// `main.rs`). Binding to the device restricts traffic to the infra link,
/// matching `hr-ipv6::ra::run_ra_sender`'s socket setup.
pub fn open_icmp6_socket(interface: &str) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
    socket.set_multicast_hops_v6(255)?;
    socket.set_nonblocking(true)?;

    if !interface.is_empty() {
        #[cfg(target_os = "linux")]
        socket.bind_device(Some(interface.as_bytes()))?;
    }

    Ok(tokio::net::UdpSocket::from_std(socket.into())?)
}

/// Resolves a device name to a kernel interface index via
/// `if_nametoindex`, the way `hr-agent` looks up interfaces for routing.
pub fn if_nametoindex(name: &str) -> anyhow::Result<u32> {
    let cname = std::ffi::CString::new(name)?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        anyhow::bail!("no such interface: {name}");
    }
    Ok(idx)
}

/// `Platform` backed by the raw socket above, plus a `getifaddrs` scan for
/// `has_address`. Discovery of a NAT64 prefix is not wired to a real
/// PLAT-prefix discovery routine in this demonstration binary; it reports
/// "nothing found" immediately so BRM falls back to its own synthesized
/// prefix.
///
/// Holds an `Arc` over the same socket `main.rs`'s receive loop awaits on,
/// and sends through `try_send_to` (the socket is already non-blocking),
/// so `Platform::send_icmp6_nd` can stay a plain synchronous fn.
pub struct AgentPlatform {
    socket: std::sync::Arc<tokio::net::UdpSocket>,
    started_at: std::time::Instant,
}

impl AgentPlatform {
    pub fn new(socket: std::sync::Arc<tokio::net::UdpSocket>) -> Self {
        Self {
            socket,
            started_at: std::time::Instant::now(),
        }
    }
}

impl Platform for AgentPlatform {
    fn send_icmp6_nd(&mut self, _if_index: u32, dest: Ipv6Addr, bytes: &[u8]) {
        let addr = SocketAddrV6::new(dest, 0, 0, 0);
        if let Err(e) = self.socket.try_send_to(bytes, std::net::SocketAddr::V6(addr)) {
            warn!(%dest, error = %e, "failed to send ICMPv6 ND packet");
        }
    }

    fn has_address(&self, if_index: u32, addr: Ipv6Addr) -> bool {
        interface_has_address(if_index, addr).unwrap_or(false)
    }

    fn discover_nat64_prefix(&mut self, _if_index: u32) {
        // No PLAT-prefix discovery routine wired up in this demo binary;
        // the caller feeds `on_nat64_discovery_done(None, ...)` back
        // immediately from `main.rs`.
    }

    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

fn interface_has_address(if_index: u32, target: Ipv6Addr) -> anyhow::Result<bool> {
    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let mut found = false;
    let mut cur = addrs;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        let matches_index = unsafe { libc::if_nametoindex(ifa.ifa_name) } == if_index;
        if matches_index && !ifa.ifa_addr.is_null() {
            let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
            if family == libc::AF_INET6 {
                let sockaddr = ifa.ifa_addr as *const libc::sockaddr_in6;
                let octets = unsafe { (*sockaddr).sin6_addr.s6_addr };
                if Ipv6Addr::from(octets) == target {
                    found = true;
                    break;
                }
            }
        }
        cur = ifa.ifa_next;
    }
    unsafe { libc::freeifaddrs(addrs) };
    Ok(found)
}

/// `NetworkData` stub: this demo binary has no Thread Network Data stack
/// behind it, so publications/withdrawals are only logged. A real
/// integration replaces this with Thread Network Data RPC/IPC calls the
/// way `hr-ipc` wires `hr-netcore` to the rest of the workspace.
#[derive(Default)]
pub struct LoggingNetworkData;

impl NetworkData for LoggingNetworkData {
    fn read_external_omr_candidates(&self) -> Vec<OmrCandidate> {
        Vec::new()
    }

    fn publish_omr(&mut self, prefix: IPv6Prefix, preference: Preference) {
        tracing::info!(%prefix, ?preference, "publish OMR (network data stub)");
    }

    fn withdraw_omr(&mut self, prefix: IPv6Prefix) {
        tracing::info!(%prefix, "withdraw OMR (network data stub)");
    }

    fn publish_external_route(&mut self, prefix: IPv6Prefix, adv_pio: bool) {
        tracing::info!(%prefix, adv_pio, "publish external route (network data stub)");
    }

    fn withdraw_external_route(&mut self, prefix: IPv6Prefix) {
        tracing::info!(%prefix, "withdraw external route (network data stub)");
    }

    fn publish_nat64(&mut self, prefix: IPv6Prefix) {
        tracing::info!(%prefix, "publish NAT64 (network data stub)");
    }

    fn withdraw_nat64(&mut self, prefix: IPv6Prefix) {
        tracing::info!(%prefix, "withdraw NAT64 (network data stub)");
    }
}

/// File-backed `SettingsStore`: one file per key under `base_dir`, written
/// atomically via temp file + rename like `BrmConfig::save`.
pub struct FileSettingsStore {
    base_dir: PathBuf,
}

impl FileSettingsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized: String = key.chars().map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' }).collect();
        self.base_dir.join(sanitized)
    }
}

impl SettingsStore for FileSettingsStore {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path_for(key)).ok()
    }

    fn write(&mut self, key: &str, value: &[u8]) {
        let path = self.path_for(key);
        let tmp_path: PathBuf = path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp_path, value).and_then(|_| std::fs::rename(&tmp_path, &path)) {
            warn!(key, error = %e, "failed to persist setting");
        }
    }
}

pub fn default_state_dir() -> PathBuf {
    Path::new("/var/lib/brm-agent").to_path_buf()
}
