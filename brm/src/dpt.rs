//! Discovered Prefix Table.
//!
//! Routers are stored in a flat arena (`Vec<Option<Router>>`) and referred
//! to by index rather than as owning nodes in a graph: a router record
//! exists iff some entry still points to it. `prune_empty_routers`
//! implements that derivation by removing arena slots left with no
//! entries and no recent activity.

use std::net::Ipv6Addr;
use std::time::Duration;

use tracing::debug;

use crate::lifetime::{Lifetime, INFINITE_LIFETIME};
use crate::prefix::IPv6Prefix;
use crate::wire::{ParsedRouterAdvertisement, Preference};

/// Router-active window: a router silent longer than this is NS-probed
///.
pub const ROUTER_ACTIVE_WINDOW: Duration = Duration::from_secs(180);
/// Total NS-probe budget: three attempts within this window.
pub const NS_PROBE_TOTAL_BUDGET: Duration = Duration::from_secs(10);
pub const NS_PROBE_ATTEMPTS: u8 = 3;

pub const DEFAULT_DPT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouterId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsProbeState {
    Idle,
    Probing { attempts_sent: u8, started_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct OnLinkEntry {
    pub prefix: IPv6Prefix,
    pub valid: Lifetime,
    pub preferred: Lifetime,
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub prefix: IPv6Prefix,
    pub lifetime: Lifetime,
    pub preference: Preference,
}

#[derive(Debug, Clone)]
pub struct RdnssAddrEntry {
    pub addr: Ipv6Addr,
    pub lifetime: Lifetime,
}

#[derive(Debug, Clone)]
pub struct Router {
    pub addr: Ipv6Addr,
    pub is_local_device: bool,
    pub m_flag: bool,
    pub o_flag: bool,
    pub s_flag: bool,
    pub last_heard_ms: u64,
    pub ns_probe: NsProbeState,
    pub on_link: Vec<OnLinkEntry>,
    pub routes: Vec<RouteEntry>,
    pub rdnss: Vec<RdnssAddrEntry>,
}

impl Router {
    fn is_empty(&self) -> bool {
        self.on_link.is_empty() && self.routes.is_empty() && self.rdnss.is_empty()
    }
}

/// Outcome of ingesting one received RA, reported back to the manager so
/// it can drive the RDNSS callback and `raHeaderLearned`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOutcome {
    pub rdnss_changed: bool,
    pub learned_router_lifetime: Option<u16>,
}

pub struct DiscoveredPrefixTable {
    routers: Vec<Option<Router>>,
    capacity: usize,
    generation: u64,
    evicted_on_link: u64,
    evicted_route: u64,
    evicted_rdnss: u64,
}

impl DiscoveredPrefixTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DPT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            routers: Vec::new(),
            capacity,
            generation: 0,
            evicted_on_link: 0,
            evicted_route: 0,
            evicted_rdnss: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn router(&self, id: RouterId) -> Option<&Router> {
        self.routers.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn find_router_id(&self, addr: Ipv6Addr) -> Option<RouterId> {
        self.routers
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|r| r.addr == addr))
            .map(RouterId)
    }

    fn total_on_link(&self) -> usize {
        self.routers.iter().flatten().map(|r| r.on_link.len()).sum()
    }

    fn total_route(&self) -> usize {
        self.routers.iter().flatten().map(|r| r.routes.len()).sum()
    }

    fn total_rdnss(&self) -> usize {
        self.routers.iter().flatten().map(|r| r.rdnss.len()).sum()
    }

    fn get_or_insert_router(&mut self, addr: Ipv6Addr, is_local_device: bool, now_ms: u64) -> RouterId {
        if let Some(id) = self.find_router_id(addr) {
            return id;
        }
        let router = Router {
            addr,
            is_local_device,
            m_flag: false,
            o_flag: false,
            s_flag: false,
            last_heard_ms: now_ms,
            ns_probe: NsProbeState::Idle,
            on_link: Vec::new(),
            routes: Vec::new(),
            rdnss: Vec::new(),
        };
        if let Some(free_slot) = self.routers.iter().position(|s| s.is_none()) {
            self.routers[free_slot] = Some(router);
            self.bump_generation();
            return RouterId(free_slot);
        }
        self.routers.push(Some(router));
        self.bump_generation();
        RouterId(self.routers.len() - 1)
    }

    /// Evicts the oldest on-link entry across the whole table, on overflow
    /// of the same entry class.
    fn evict_oldest_on_link(&mut self) {
        let mut oldest: Option<(usize, usize, u64)> = None; // (router_idx, entry_idx, last_update)
        for (ri, slot) in self.routers.iter().enumerate() {
            if let Some(r) = slot {
                for (ei, e) in r.on_link.iter().enumerate() {
                    if oldest.is_none_or(|(_, _, t)| e.valid.last_update_ms < t) {
                        oldest = Some((ri, ei, e.valid.last_update_ms));
                    }
                }
            }
        }
        if let Some((ri, ei, _)) = oldest {
            self.routers[ri].as_mut().unwrap().on_link.remove(ei);
            self.evicted_on_link += 1;
        }
    }

    fn evict_oldest_route(&mut self) {
        let mut oldest: Option<(usize, usize, u64)> = None;
        for (ri, slot) in self.routers.iter().enumerate() {
            if let Some(r) = slot {
                for (ei, e) in r.routes.iter().enumerate() {
                    if oldest.is_none_or(|(_, _, t)| e.lifetime.last_update_ms < t) {
                        oldest = Some((ri, ei, e.lifetime.last_update_ms));
                    }
                }
            }
        }
        if let Some((ri, ei, _)) = oldest {
            self.routers[ri].as_mut().unwrap().routes.remove(ei);
            self.evicted_route += 1;
        }
    }

    fn evict_oldest_rdnss(&mut self) {
        let mut oldest: Option<(usize, usize, u64)> = None;
        for (ri, slot) in self.routers.iter().enumerate() {
            if let Some(r) = slot {
                for (ei, e) in r.rdnss.iter().enumerate() {
                    if oldest.is_none_or(|(_, _, t)| e.lifetime.last_update_ms < t) {
                        oldest = Some((ri, ei, e.lifetime.last_update_ms));
                    }
                }
            }
        }
        if let Some((ri, ei, _)) = oldest {
            self.routers[ri].as_mut().unwrap().rdnss.remove(ei);
            self.evicted_rdnss += 1;
        }
    }

    /// Ingests one received, already-parsed RA from `source`.
    ///
    /// `local_on_link` is BRM's own advertised on-link prefix, needed for
    /// the conflict-resolution rule: a PIO matching it is dropped unless
    /// it would otherwise be our own reflection, and a RIO matching it
    /// never influences which on-link prefix BRM advertises.
    pub fn ingest_ra(
        &mut self,
        source: Ipv6Addr,
        is_local_device: bool,
        parsed: &ParsedRouterAdvertisement,
        local_on_link: Option<IPv6Prefix>,
        now_ms: u64,
    ) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();

        let router_id = self.get_or_insert_router(source, is_local_device, now_ms);
        let router = self.routers[router_id.0].as_mut().unwrap();
        router.last_heard_ms = now_ms;
        router.ns_probe = NsProbeState::Idle;

        let s_flag = parsed.flags.snac;
        router.s_flag = s_flag;
        // A stub/SNAC router's M flag must not contribute to upstream
        // M/O aggregation, but is still recorded.
        router.m_flag = parsed.flags.managed;
        router.o_flag = parsed.flags.other_config;

        if is_local_device {
            outcome.learned_router_lifetime = Some(parsed.flags.router_lifetime);
        }

        for pio in &parsed.pios {
            if pio.prefix.length() != 64 {
                continue;
            }
            if is_local_device {
                if let Some(local) = local_on_link {
                    if pio.prefix.same_network(&local) {
                        // Our own PIO reflected back: not a DPT entry.
                        continue;
                    }
                }
            }
            // A peer claiming our on-link prefix is transient and never
            // wins favored-on-link (policy.rs excludes it explicitly),
            // but the entry is still tracked here for stale-timer
            // accounting.
            self.upsert_on_link(router_id, pio.prefix, pio.valid_lifetime, pio.preferred_lifetime, now_ms);
        }

        for rio in &parsed.rios {
            // RIOs matching our own advertised on-link prefix are still
            // recorded (for stale-timer accounting) but must never
            // influence which on-link prefix BRM advertises; that
            // exclusion is enforced in policy.rs, not here.
            self.upsert_route(router_id, rio.prefix, rio.lifetime, rio.preference, now_ms);
        }

        for rdnss_opt in &parsed.rdnss {
            for addr in &rdnss_opt.addresses {
                if self.upsert_rdnss(router_id, *addr, rdnss_opt.lifetime, now_ms) {
                    outcome.rdnss_changed = true;
                }
            }
        }

        outcome
    }

    fn upsert_on_link(&mut self, router_id: RouterId, prefix: IPv6Prefix, valid: u32, preferred: u32, now_ms: u64) {
        // Invariant: preferred <= valid, infinite valid excepted.
        let preferred = if valid != INFINITE_LIFETIME && (preferred > valid || preferred == INFINITE_LIFETIME) {
            valid
        } else {
            preferred
        };
        if self.total_on_link() >= self.capacity
            && !self.routers[router_id.0]
                .as_ref()
                .unwrap()
                .on_link
                .iter()
                .any(|e| e.prefix.same_network(&prefix))
        {
            self.evict_oldest_on_link();
        }
        let router = self.routers[router_id.0].as_mut().unwrap();
        if let Some(existing) = router.on_link.iter_mut().find(|e| e.prefix.same_network(&prefix)) {
            existing.valid.refresh(valid, now_ms);
            existing.preferred.refresh(preferred, now_ms);
        } else {
            router.on_link.push(OnLinkEntry {
                prefix,
                valid: Lifetime::new(valid, now_ms),
                preferred: Lifetime::new(preferred, now_ms),
            });
            self.bump_generation();
        }
    }

    fn upsert_route(&mut self, router_id: RouterId, prefix: IPv6Prefix, lifetime: u32, preference: Preference, now_ms: u64) {
        if self.total_route() >= self.capacity
            && !self.routers[router_id.0]
                .as_ref()
                .unwrap()
                .routes
                .iter()
                .any(|e| e.prefix.same_network(&prefix))
        {
            self.evict_oldest_route();
        }
        let router = self.routers[router_id.0].as_mut().unwrap();
        if let Some(existing) = router.routes.iter_mut().find(|e| e.prefix.same_network(&prefix)) {
            existing.lifetime.refresh(lifetime, now_ms);
            existing.preference = preference;
        } else {
            router.routes.push(RouteEntry {
                prefix,
                lifetime: Lifetime::new(lifetime, now_ms),
                preference,
            });
            self.bump_generation();
        }
    }

    /// Returns `true` iff the set of addresses or router-ownership changed
    /// ("lifetime-only changes do not trigger the
    /// callback").
    fn upsert_rdnss(&mut self, router_id: RouterId, addr: Ipv6Addr, lifetime: u32, now_ms: u64) -> bool {
        if lifetime == 0 {
            let router = self.routers[router_id.0].as_mut().unwrap();
            let before = router.rdnss.len();
            router.rdnss.retain(|e| e.addr != addr);
            let changed = router.rdnss.len() != before;
            if changed {
                self.bump_generation();
            }
            return changed;
        }
        if self.total_rdnss() >= self.capacity
            && !self.routers[router_id.0]
                .as_ref()
                .unwrap()
                .rdnss
                .iter()
                .any(|e| e.addr == addr)
        {
            self.evict_oldest_rdnss();
        }
        let router = self.routers[router_id.0].as_mut().unwrap();
        if let Some(existing) = router.rdnss.iter_mut().find(|e| e.addr == addr) {
            existing.lifetime.refresh(lifetime, now_ms);
            false
        } else {
            router.rdnss.push(RdnssAddrEntry {
                addr,
                lifetime: Lifetime::new(lifetime, now_ms),
            });
            self.bump_generation();
            true
        }
    }

    /// Expiry sweep. Removes lifetime-expired entries and
    /// prunes routers left with no entries. Returns whether an RDNSS
    /// change occurred (an RDNSS entry expiring removes an address).
    pub fn expire(&mut self, now_ms: u64) -> bool {
        let mut rdnss_changed = false;
        let mut structural_change = false;
        for slot in self.routers.iter_mut() {
            if let Some(router) = slot {
                let before_on_link = router.on_link.len();
                router.on_link.retain(|e| !e.valid.has_expired(now_ms));
                if router.on_link.len() != before_on_link {
                    structural_change = true;
                }

                let before_routes = router.routes.len();
                router.routes.retain(|e| !e.lifetime.has_expired(now_ms));
                if router.routes.len() != before_routes {
                    structural_change = true;
                }

                let before_rdnss = router.rdnss.len();
                router.rdnss.retain(|e| !e.lifetime.has_expired(now_ms));
                if router.rdnss.len() != before_rdnss {
                    rdnss_changed = true;
                    structural_change = true;
                }
            }
        }
        self.prune_empty_routers(now_ms);
        if structural_change {
            self.bump_generation();
        }
        rdnss_changed
    }

    fn prune_empty_routers(&mut self, now_ms: u64) {
        for slot in self.routers.iter_mut() {
            let should_remove = match slot {
                Some(r) if !r.is_local_device && r.is_empty() => {
                    now_ms.saturating_sub(r.last_heard_ms) >= ROUTER_ACTIVE_WINDOW.as_millis() as u64
                }
                _ => false,
            };
            if should_remove {
                debug!("DPT: pruning empty router record");
                *slot = None;
            }
        }
    }

    /// Routers silent past the router-active window that aren't already
    /// mid-probe (and aren't the local device, which is never probed).
    /// Transitions them into `Probing` and returns their addresses so the
    /// caller can emit the unicast NS.
    pub fn routers_needing_probe(&mut self, now_ms: u64) -> Vec<Ipv6Addr> {
        let mut to_probe = Vec::new();
        for slot in self.routers.iter_mut() {
            if let Some(r) = slot {
                if r.is_local_device || r.is_empty() {
                    continue;
                }
                let silent_for = now_ms.saturating_sub(r.last_heard_ms);
                match r.ns_probe {
                    NsProbeState::Idle if silent_for >= ROUTER_ACTIVE_WINDOW.as_millis() as u64 => {
                        r.ns_probe = NsProbeState::Probing {
                            attempts_sent: 1,
                            started_ms: now_ms,
                        };
                        to_probe.push(r.addr);
                    }
                    NsProbeState::Probing { attempts_sent, started_ms } => {
                        let probe_gap =
                            NS_PROBE_TOTAL_BUDGET.as_millis() as u64 / NS_PROBE_ATTEMPTS as u64;
                        let next_attempt_due = started_ms + probe_gap * attempts_sent as u64;
                        if attempts_sent < NS_PROBE_ATTEMPTS && now_ms >= next_attempt_due {
                            r.ns_probe = NsProbeState::Probing {
                                attempts_sent: attempts_sent + 1,
                                started_ms,
                            };
                            to_probe.push(r.addr);
                        }
                    }
                    _ => {}
                }
            }
        }
        to_probe
    }

    /// Marks a router reachable again after a received NA, cancelling any
    /// in-flight probe.
    pub fn handle_neighbor_advertisement(&mut self, addr: Ipv6Addr, now_ms: u64) {
        if let Some(id) = self.find_router_id(addr) {
            let router = self.routers[id.0].as_mut().unwrap();
            router.last_heard_ms = now_ms;
            router.ns_probe = NsProbeState::Idle;
        }
    }

    /// Declares unreachable every router whose probe budget is exhausted,
    /// removing all of its entries. Returns the removed routers' addresses.
    pub fn sweep_unreachable(&mut self, now_ms: u64) -> Vec<Ipv6Addr> {
        let mut removed = Vec::new();
        for slot in self.routers.iter_mut() {
            let remove = match slot {
                Some(r) => match r.ns_probe {
                    NsProbeState::Probing { attempts_sent, started_ms }
                        if attempts_sent >= NS_PROBE_ATTEMPTS
                            && now_ms.saturating_sub(started_ms) >= NS_PROBE_TOTAL_BUDGET.as_millis() as u64 =>
                    {
                        Some(r.addr)
                    }
                    _ => None,
                },
                None => None,
            };
            if let Some(addr) = remove {
                removed.push(addr);
                *slot = None;
            }
        }
        if !removed.is_empty() {
            self.bump_generation();
        }
        removed
    }

    /// The per-prefix "stale time": for each distinct route prefix, the
    /// latest deadline across all routers currently advertising it (so a
    /// second router re-stating a shorter-lived RIO for the same prefix
    /// does not pull the deadline in). Returns the earliest such
    /// per-prefix deadline, i.e. the next moment some prefix would have
    /// no fresh advertiser left unless refreshed meanwhile. The caller
    /// solicits a fresh RA at this point rather than waiting for every
    /// advertiser to individually expire.
    pub fn stale_route_deadline_ms(&self) -> Option<u64> {
        let mut per_prefix: Vec<(IPv6Prefix, u64)> = Vec::new();
        for (_, e) in self.iter_routes() {
            let Some(deadline) = e.lifetime.deadline_ms() else { continue };
            if let Some(slot) = per_prefix.iter_mut().find(|(p, _)| p.same_network(&e.prefix)) {
                slot.1 = slot.1.max(deadline);
            } else {
                per_prefix.push((e.prefix, deadline));
            }
        }
        per_prefix.into_iter().map(|(_, d)| d).min()
    }

    /// Earliest absolute deadline (ms) at which a policy-relevant event
    /// (entry expiry or NS-probe step) is due, for the manager to arm its
    /// single timer against.
    pub fn next_deadline_ms(&self, now_ms: u64) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        let mut consider = |t: Option<u64>| {
            if let Some(t) = t {
                earliest = Some(earliest.map_or(t, |e| e.min(t)));
            }
        };
        for slot in &self.routers {
            if let Some(r) = slot {
                for e in &r.on_link {
                    consider(e.valid.deadline_ms());
                }
                for e in &r.routes {
                    consider(e.lifetime.deadline_ms());
                }
                for e in &r.rdnss {
                    consider(e.lifetime.deadline_ms());
                }
                if !r.is_local_device {
                    match r.ns_probe {
                        NsProbeState::Idle => {
                            consider(Some(r.last_heard_ms + ROUTER_ACTIVE_WINDOW.as_millis() as u64));
                        }
                        NsProbeState::Probing { started_ms, .. } => {
                            consider(Some(started_ms + NS_PROBE_TOTAL_BUDGET.as_millis() as u64));
                        }
                    }
                }
            }
        }
        earliest.filter(|t| *t >= now_ms).or(earliest)
    }

    pub fn iter_routers(&self) -> impl Iterator<Item = &Router> {
        self.routers.iter().flatten()
    }

    pub fn iter_on_link(&self) -> impl Iterator<Item = (&Router, &OnLinkEntry)> {
        self.routers.iter().flatten().flat_map(|r| r.on_link.iter().map(move |e| (r, e)))
    }

    pub fn iter_routes(&self) -> impl Iterator<Item = (&Router, &RouteEntry)> {
        self.routers.iter().flatten().flat_map(|r| r.routes.iter().map(move |e| (r, e)))
    }

    pub fn iter_rdnss(&self) -> impl Iterator<Item = (&Router, &RdnssAddrEntry)> {
        self.routers.iter().flatten().flat_map(|r| r.rdnss.iter().map(move |e| (r, e)))
    }

    #[cfg(test)]
    pub fn eviction_counters(&self) -> (u64, u64, u64) {
        (self.evicted_on_link, self.evicted_route, self.evicted_rdnss)
    }
}

impl Default for DiscoveredPrefixTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A stable iterator over the DPT's three tables
/// (`initPrefixIterator`/`nextPrefixEntry`/`nextRdnssEntry`/`nextRouterEntry`).
/// Invalidated by any structural table change; callers detect this by
/// comparing the generation captured at `init` time.
pub struct PrefixTableIterator {
    generation: u64,
    on_link_idx: usize,
    route_idx: usize,
    rdnss_idx: usize,
    router_idx: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum PrefixKind {
    OnLink,
    Route,
}

#[derive(Debug, Clone, Copy)]
pub struct PrefixEntry {
    pub kind: PrefixKind,
    pub prefix: IPv6Prefix,
    pub router: Ipv6Addr,
}

#[derive(Debug, Clone, Copy)]
pub struct RdnssEntry {
    pub addr: Ipv6Addr,
    pub router: Ipv6Addr,
}

#[derive(Debug, Clone, Copy)]
pub struct RouterEntry {
    pub addr: Ipv6Addr,
    pub is_local_device: bool,
    pub m_flag: bool,
    pub o_flag: bool,
    pub s_flag: bool,
}

impl DiscoveredPrefixTable {
    pub fn init_prefix_iterator(&self) -> PrefixTableIterator {
        PrefixTableIterator {
            generation: self.generation,
            on_link_idx: 0,
            route_idx: 0,
            rdnss_idx: 0,
            router_idx: 0,
        }
    }

    pub fn next_prefix_entry(&self, iter: &mut PrefixTableIterator) -> Option<PrefixEntry> {
        if iter.generation != self.generation {
            return None;
        }
        let on_link: Vec<_> = self.iter_on_link().collect();
        if iter.on_link_idx < on_link.len() {
            let (r, e) = on_link[iter.on_link_idx];
            iter.on_link_idx += 1;
            return Some(PrefixEntry {
                kind: PrefixKind::OnLink,
                prefix: e.prefix,
                router: r.addr,
            });
        }
        let routes: Vec<_> = self.iter_routes().collect();
        if iter.route_idx < routes.len() {
            let (r, e) = routes[iter.route_idx];
            iter.route_idx += 1;
            return Some(PrefixEntry {
                kind: PrefixKind::Route,
                prefix: e.prefix,
                router: r.addr,
            });
        }
        None
    }

    pub fn next_rdnss_entry(&self, iter: &mut PrefixTableIterator) -> Option<RdnssEntry> {
        if iter.generation != self.generation {
            return None;
        }
        let rdnss: Vec<_> = self.iter_rdnss().collect();
        if iter.rdnss_idx < rdnss.len() {
            let (r, e) = rdnss[iter.rdnss_idx];
            iter.rdnss_idx += 1;
            return Some(RdnssEntry {
                addr: e.addr,
                router: r.addr,
            });
        }
        None
    }

    pub fn next_router_entry(&self, iter: &mut PrefixTableIterator) -> Option<RouterEntry> {
        if iter.generation != self.generation {
            return None;
        }
        let routers: Vec<_> = self.iter_routers().collect();
        if iter.router_idx < routers.len() {
            let r = routers[iter.router_idx];
            iter.router_idx += 1;
            return Some(RouterEntry {
                addr: r.addr,
                is_local_device: r.is_local_device,
                m_flag: r.m_flag,
                o_flag: r.o_flag,
                s_flag: r.s_flag,
            });
        }
        None
    }
}
