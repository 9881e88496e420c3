//! External collaborator interfaces.
//!
//! BRM's core never talks to a socket, a kernel route table, or Thread
//! Network Data directly — it calls through these traits, which the
//! `brm-agent` binary implements against real I/O. Keeping them as plain
//! traits (no `async fn`) is what lets `brm` stay synchronous while its
//! caller drives actual async I/O underneath.

use std::net::Ipv6Addr;

use crate::policy::OmrCandidate;
use crate::prefix::IPv6Prefix;

/// `platInfraIfSendIcmp6Nd` / `platInfraIfHasAddress` /
/// `platInfraIfDiscoverNat64Prefix` / `platAlarm*`.
///
/// Every method is required to return immediately; a failing send is
/// logged and retried at the next trickle fire rather than surfaced as an
/// error the caller must unwind.
pub trait Platform {
    fn send_icmp6_nd(&mut self, if_index: u32, dest: Ipv6Addr, bytes: &[u8]);
    fn has_address(&self, if_index: u32, addr: Ipv6Addr) -> bool;
    /// Kicks off asynchronous NAT64-prefix discovery; the result arrives
    /// later through `Nat64Adaptor::on_infra_discovery_done`, fed by the
    /// caller once the platform's discovery routine completes.
    fn discover_nat64_prefix(&mut self, if_index: u32);
    fn now_ms(&self) -> u64;
}

/// BRM's view of Thread Network Data: what it can read (external OMR
/// candidates it does not own) and what it can write (its own entries,
/// which it must be able to tell apart from everyone else's — Network
/// Data is shared, and BRM must never delete entries added by other
/// subsystems).
pub trait NetworkData {
    fn read_external_omr_candidates(&self) -> Vec<OmrCandidate>;

    fn publish_omr(&mut self, prefix: IPv6Prefix, preference: crate::wire::Preference);
    fn withdraw_omr(&mut self, prefix: IPv6Prefix);

    fn publish_external_route(&mut self, prefix: IPv6Prefix, adv_pio: bool);
    fn withdraw_external_route(&mut self, prefix: IPv6Prefix);

    fn publish_nat64(&mut self, prefix: IPv6Prefix);
    fn withdraw_nat64(&mut self, prefix: IPv6Prefix);
}

/// Settings read/write for persistence.
pub trait SettingsStore {
    fn read(&self, key: &str) -> Option<Vec<u8>>;
    fn write(&mut self, key: &str, value: &[u8]);
}
