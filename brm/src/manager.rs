//! Event loop glue and state machine.
//!
//! `BorderRoutingManager` owns every piece of local state and is the only
//! thing that ever mutates it; all mutation happens from this module's
//! dispatch of timer fires, inbound ND packets, or an API call, all of
//! which the caller is required to invoke from the same task — there are
//! no internal locks.

use std::net::Ipv6Addr;

use tracing::{debug, info, warn};

use crate::autoenable::AutoEnableBus;
use crate::config::BrmConfig;
use crate::dhcp6pd::Dhcp6PdAdaptor;
use crate::dpt::DiscoveredPrefixTable;
use crate::lifetime::Lifetime;
use crate::nat64::Nat64Adaptor;
use crate::persistence::{self, DeprecatingPrefix};
use crate::platform::{NetworkData, Platform, SettingsStore};
use crate::policy::{self, OmrConfig, PolicyDecision, PolicyInputs};
use crate::prefix::{self, IPv6Prefix};
use crate::ra::RaTransmitter;
use crate::wire::{self, ParsedRouterAdvertisement};

/// Bound on `deprecatingOnLinks[]` ("bounded (≥3), newest-wins on
/// overflow").
pub const DEPRECATING_ON_LINKS_CAPACITY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Disabled,
    Stopped,
    Running,
}

/// The gating conditions for `Stopped → Running` ("Transitions
/// are triggered by setEnabled, infra-if state, Thread attachment state,
/// and mesh role").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningPreconditions {
    pub infra_if_running: bool,
    pub thread_attached: bool,
    /// Only a router or leader advertises on-link/OMR prefixes; a
    /// child/REED defers to its parent.
    pub has_router_eligible_role: bool,
}

impl RunningPreconditions {
    pub fn all_met(&self) -> bool {
        self.infra_if_running && self.thread_attached && self.has_router_eligible_role
    }
}

pub struct BorderRoutingManager {
    pub(crate) config: BrmConfig,
    state: RunState,
    preconditions: RunningPreconditions,

    pub(crate) dpt: DiscoveredPrefixTable,
    pub(crate) ra_tx: RaTransmitter,
    pub(crate) autoenable: AutoEnableBus,
    pub(crate) nat64: Nat64Adaptor,
    pub(crate) dhcp6pd: Dhcp6PdAdaptor,

    pub(crate) local_on_link: IPv6Prefix,
    pub(crate) local_omr: IPv6Prefix,
    pub(crate) advertised_on_link: Option<IPv6Prefix>,
    pub(crate) deprecating_on_links: Vec<DeprecatingPrefix>,
    pub(crate) omr_config: OmrConfig,
    pub(crate) ra_header_learned: Option<u16>,
    pub(crate) last_decision: Option<PolicyDecision>,
    /// The stale-route deadline BRM has already solicited for, so it
    /// doesn't re-send an RS every tick while waiting for a reply to the
    /// one it already sent.
    last_handled_stale_deadline: Option<u64>,

    ext_pan_id: [u8; 8],
    mesh_local_prefix: [u8; 8],

    /// Registered by `setRdnssCallback`; invoked synchronously
    /// from within the inbound-RA handler and from the expiry sweep,
    /// whenever the RDNSS address set changes.
    rdnss_callback: Option<Box<dyn FnMut(&[Ipv6Addr])>>,
}

impl BorderRoutingManager {
    pub fn new(config: BrmConfig) -> Self {
        let ext_pan_id = [0u8; 8];
        let mesh_local_prefix = [0u8; 8];
        let local_on_link = prefix::derive_local_on_link_prefix(&ext_pan_id);
        let local_omr = prefix::derive_local_omr_prefix(&mesh_local_prefix);
        let local_nat64 = prefix::derive_local_nat64_prefix(&mesh_local_prefix);
        let nat64_enabled = config.nat64_enabled;
        let omr_config = config.runtime_omr_config().unwrap_or(OmrConfig::Auto);

        let mut nat64 = Nat64Adaptor::new(local_nat64);
        nat64.set_enabled(nat64_enabled);

        Self {
            dpt: DiscoveredPrefixTable::with_capacity(config.dpt_capacity),
            config,
            state: RunState::Disabled,
            preconditions: RunningPreconditions::default(),
            ra_tx: RaTransmitter::new(0),
            autoenable: AutoEnableBus::new(),
            nat64,
            dhcp6pd: Dhcp6PdAdaptor::new(),
            local_on_link,
            local_omr,
            advertised_on_link: None,
            deprecating_on_links: Vec::new(),
            omr_config,
            ra_header_learned: None,
            last_decision: None,
            last_handled_stale_deadline: None,
            ext_pan_id,
            mesh_local_prefix,
            rdnss_callback: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// `setRdnssCallback(fn, ctx)`. The callback is invoked
    /// synchronously with the current set of RDNSS addresses whenever it
    /// changes, whether the change came from a received RA or from the
    /// expiry sweep.
    pub fn set_rdnss_callback(&mut self, callback: Box<dyn FnMut(&[Ipv6Addr])>) {
        self.rdnss_callback = Some(callback);
    }

    fn invoke_rdnss_callback(&mut self) {
        if let Some(cb) = &mut self.rdnss_callback {
            let addrs: Vec<Ipv6Addr> = self.dpt.iter_rdnss().map(|(_, e)| e.addr).collect();
            cb(&addrs);
        }
    }

    /// `setEnabled(bool)`. `Disabled → Stopped` creates local
    /// state from Network Data/mesh identity; `Stopped/Running →
    /// Disabled` performs the same exit actions as `running → stopped`
    /// if currently running, then drops to `Disabled`.
    pub fn set_enabled(
        &mut self,
        enabled: bool,
        now_ms: u64,
        platform: &mut impl Platform,
        network_data: &mut impl NetworkData,
        settings: &mut impl SettingsStore,
    ) {
        match (enabled, self.state) {
            (true, RunState::Disabled) => {
                self.restore_deprecating_set(now_ms, settings);
                self.state = RunState::Stopped;
                self.ra_tx = RaTransmitter::new(now_ms);
                info!("BRM enabled");
                self.maybe_enter_running(now_ms, network_data);
                self.start_nat64_discovery(platform);
            }
            (false, RunState::Running) => {
                self.exit_running(now_ms, platform, network_data, settings);
                self.state = RunState::Disabled;
                info!("BRM disabled");
            }
            (false, RunState::Stopped) => {
                self.state = RunState::Disabled;
                info!("BRM disabled");
            }
            _ => {}
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state != RunState::Disabled
    }

    /// Updates the gating conditions and re-evaluates the `Stopped ↔
    /// Running` transition.
    pub fn set_preconditions(
        &mut self,
        preconditions: RunningPreconditions,
        now_ms: u64,
        platform: &mut impl Platform,
        network_data: &mut impl NetworkData,
        settings: &mut impl SettingsStore,
    ) {
        self.preconditions = preconditions;
        match self.state {
            RunState::Stopped => {
                self.maybe_enter_running(now_ms, network_data);
                self.start_nat64_discovery(platform);
            }
            RunState::Running if !preconditions.all_met() => {
                self.exit_running(now_ms, platform, network_data, settings);
                self.state = RunState::Stopped;
            }
            _ => {}
        }
    }

    fn maybe_enter_running(&mut self, now_ms: u64, network_data: &mut impl NetworkData) {
        if self.state == RunState::Stopped && self.preconditions.all_met() {
            self.state = RunState::Running;
            self.ra_tx = RaTransmitter::new(now_ms);
            self.ra_tx.start_rs_burst(now_ms);
            self.autoenable.on_entered_running();
            info!("BRM entering running state");
            self.reevaluate_policy(now_ms, network_data);
        }
    }

    /// Kicks off NAT64 prefix discovery on the infra link.
    /// The result is delivered later through `on_nat64_discovery_done`.
    pub fn start_nat64_discovery(&mut self, platform: &mut impl Platform) {
        if self.state == RunState::Running && self.nat64.enabled() {
            platform.discover_nat64_prefix(self.config.infra_if_index);
        }
    }

    /// Feeds back the result of a `Platform::discover_nat64_prefix` call
    ///; `None` means discovery found no NAT64 prefix on the
    /// infra link, so BRM falls back to its own synthesized one.
    pub fn on_nat64_discovery_done(&mut self, discovered: Option<IPv6Prefix>, now_ms: u64, network_data: &mut impl NetworkData) {
        self.nat64.on_infra_discovery_done(discovered);
        if self.state == RunState::Running {
            self.reevaluate_policy(now_ms, network_data);
        }
    }

    /// Exit actions from `Running`: emit final RA, persist
    /// the deprecating set, withdraw BRM-owned Network-Data entries.
    fn exit_running(
        &mut self,
        now_ms: u64,
        platform: &mut impl Platform,
        network_data: &mut impl NetworkData,
        settings: &mut impl SettingsStore,
    ) {
        let was_advertising_local = self.advertised_on_link == Some(self.local_on_link);
        let last_favored_omr = self.last_decision.as_ref().and_then(|d| d.favored_omr).map(|o| o.prefix);

        let bytes = self.ra_tx.build_final_ra(
            self.local_on_link,
            was_advertising_local,
            &self.deprecating_on_links,
            last_favored_omr,
            now_ms,
        );
        platform.send_icmp6_nd(self.config.infra_if_index, Ipv6Addr::UNSPECIFIED, &bytes);

        if was_advertising_local {
            self.move_to_deprecating(self.local_on_link, now_ms);
        }
        self.persist_deprecating_set(now_ms, settings);

        if let Some(decision) = &self.last_decision {
            if let Some(omr) = decision.favored_omr {
                network_data.withdraw_omr(omr.prefix);
            }
            if let Some(route) = decision.external_route {
                network_data.withdraw_external_route(route.prefix);
            }
            if let Some(nat64) = decision.nat64_prefix {
                network_data.withdraw_nat64(nat64);
            }
        }
        self.advertised_on_link = None;
        self.autoenable.on_left_running();
        info!("BRM left running state, exit actions complete");
    }

    fn move_to_deprecating(&mut self, prefix: IPv6Prefix, now_ms: u64) {
        if self.deprecating_on_links.iter().any(|d| d.prefix == prefix) {
            return;
        }
        if self.deprecating_on_links.len() >= DEPRECATING_ON_LINKS_CAPACITY {
            self.deprecating_on_links.remove(0); // oldest dropped, newest wins
        }
        self.deprecating_on_links.push(DeprecatingPrefix {
            prefix,
            valid: Lifetime::new(crate::ra::ADVERTISED_LIFETIME_SECS, now_ms),
        });
    }

    fn persist_deprecating_set(&self, now_ms: u64, settings: &mut impl SettingsStore) {
        let bytes = persistence::encode(&self.deprecating_on_links, now_ms);
        settings.write(persistence::SETTINGS_KEY, &bytes);
    }

    fn restore_deprecating_set(&mut self, now_ms: u64, settings: &mut impl SettingsStore) {
        let Some(bytes) = settings.read(persistence::SETTINGS_KEY) else {
            return;
        };
        match persistence::decode(&bytes, now_ms) {
            Ok(restored) => {
                debug!(count = restored.len(), "restored deprecating on-link prefixes");
                self.deprecating_on_links = restored;
            }
            Err(e) => warn!(error = %e, "discarding unreadable persisted deprecating set"),
        }
    }

    /// The Thread Extended PAN ID changed: re-derive `localOnLink`, move
    /// the old value into the deprecating queue, and re-evaluate policy
    /// under the new identity so `advertised_on_link` doesn't keep
    /// pointing at the prefix that was just retired.
    pub fn on_ext_pan_id_changed(
        &mut self,
        ext_pan_id: [u8; 8],
        now_ms: u64,
        settings: &mut impl SettingsStore,
        network_data: &mut impl NetworkData,
    ) {
        if ext_pan_id == self.ext_pan_id {
            return;
        }
        self.ext_pan_id = ext_pan_id;
        let old = self.local_on_link;
        self.local_on_link = prefix::derive_local_on_link_prefix(&ext_pan_id);
        if self.advertised_on_link == Some(old) {
            self.move_to_deprecating(old, now_ms);
            self.persist_deprecating_set(now_ms, settings);
        }
        self.ra_tx.trickle.reset_to_min(now_ms);
        if self.state == RunState::Running {
            self.reevaluate_policy(now_ms, network_data);
        }
    }

    pub fn on_mesh_local_prefix_changed(&mut self, mesh_local_prefix: [u8; 8]) {
        if mesh_local_prefix == self.mesh_local_prefix {
            return;
        }
        self.mesh_local_prefix = mesh_local_prefix;
        self.local_omr = prefix::derive_local_omr_prefix(&mesh_local_prefix);
        let new_nat64 = prefix::derive_local_nat64_prefix(&mesh_local_prefix);
        self.nat64.set_local(new_nat64);
    }

    /// Dispatches one inbound ND packet ("A received RA is fully
    /// applied to DPT before any policy re-evaluation or outbound RA
    /// emission derived from it").
    pub fn handle_received_packet(
        &mut self,
        source: Ipv6Addr,
        bytes: &[u8],
        now_ms: u64,
        platform: &mut impl Platform,
        network_data: &mut impl NetworkData,
    ) {
        if self.state != RunState::Running {
            return;
        }
        if bytes.is_empty() {
            return;
        }
        match bytes[0] {
            wire::ICMP6_ROUTER_ADVERT => self.handle_ra(source, bytes, now_ms, platform, network_data),
            wire::ICMP6_NEIGHBOR_ADVERT => {
                if let Some(target) = wire::parse_neighbor_advertisement_target(bytes) {
                    self.dpt.handle_neighbor_advertisement(target, now_ms);
                }
            }
            _ => {}
        }
    }

    fn handle_ra(
        &mut self,
        source: Ipv6Addr,
        bytes: &[u8],
        now_ms: u64,
        platform: &mut impl Platform,
        network_data: &mut impl NetworkData,
    ) {
        let Some(parsed) = wire::parse_router_advertisement(bytes) else {
            warn!("dropping malformed inbound RA");
            return;
        };
        let is_local_device = platform.has_address(self.config.infra_if_index, source);
        let generation_before = self.dpt.generation();

        let outcome = self
            .dpt
            .ingest_ra(source, is_local_device, &parsed, Some(self.local_on_link), now_ms);

        if let Some(learned) = outcome.learned_router_lifetime {
            self.ra_header_learned = Some(learned);
        }
        if outcome.rdnss_changed {
            self.invoke_rdnss_callback();
        }

        let is_inconsistent = self.ra_would_contradict(&parsed);
        if self.dpt.generation() != generation_before || is_inconsistent {
            self.reevaluate_policy(now_ms, network_data);
            if is_inconsistent {
                self.ra_tx.trickle.reset_to_min(now_ms);
            }
        }
    }

    fn ra_would_contradict(&self, parsed: &ParsedRouterAdvertisement) -> bool {
        parsed.pios.iter().any(|p| p.prefix.same_network(&self.local_on_link) && p.on_link && p.preferred_lifetime > 0)
    }

    /// Re-runs `policy::evaluate` and applies the resulting diffs to
    /// Network Data and the RA transmitter's withdrawal tracking.
    pub fn reevaluate_policy(&mut self, now_ms: u64, network_data: &mut impl NetworkData) {
        let dhcp6_pd_omr = self.dhcp6pd.current().map(|p| p.as_omr_candidate());
        let inputs = PolicyInputs {
            dpt: &self.dpt,
            now_ms,
            local_on_link: self.local_on_link,
            advertised_on_link: self.advertised_on_link,
            local_omr: self.local_omr,
            omr_config: self.omr_config,
            external_omr_candidates: &network_data.read_external_omr_candidates(),
            dhcp6_pd_omr,
            nat64_local: self.nat64.local(),
            nat64_infra: self.nat64.infra(),
            nat64_enabled: self.nat64.enabled(),
        };
        let decision = policy::evaluate(&inputs);

        self.advertised_on_link = if decision.advertise_local_on_link {
            Some(self.local_on_link)
        } else {
            if self.advertised_on_link == Some(self.local_on_link) {
                self.move_to_deprecating(self.local_on_link, now_ms);
            }
            None
        };

        self.ra_tx.note_published_omr(decision.favored_omr.map(|o| o.prefix), now_ms);

        let previous = self.last_decision.replace(decision);
        if previous.as_ref() != Some(&decision) {
            self.ra_tx.trickle.reset_to_min(now_ms);
        }
        apply_network_data_diff(previous.as_ref(), &decision, network_data);
        if let Some(pd) = &self.dhcp6pd.current() {
            if decision.favored_omr.map(|o| o.prefix) == Some(pd.prefix) {
                self.dhcp6pd.mark_published();
            }
        }
    }

    /// Timer fire: DPT expiry sweep, NS probes, trickle-driven RA.
    pub fn on_timer_fire(&mut self, now_ms: u64, platform: &mut impl Platform, network_data: &mut impl NetworkData) {
        if self.state != RunState::Running {
            return;
        }

        if self.dpt.expire(now_ms) {
            self.invoke_rdnss_callback();
        }
        self.deprecating_on_links.retain(|d| !d.valid.has_expired(now_ms));

        for addr in self.dpt.routers_needing_probe(now_ms) {
            let ns = crate::ra::build_ns_probe(addr);
            platform.send_icmp6_nd(self.config.infra_if_index, addr, &ns);
        }
        let newly_unreachable = self.dpt.sweep_unreachable(now_ms);
        if !newly_unreachable.is_empty() {
            self.reevaluate_policy(now_ms, network_data);
        }

        self.dhcp6pd.tick(now_ms);

        if self.ra_tx.try_fire_rs(now_ms) {
            let rs = crate::ra::build_rs();
            platform.send_icmp6_nd(self.config.infra_if_index, ALL_ROUTERS_MULTICAST, &rs);
        }

        // Per-prefix stale time: solicit a fresh RA
        // once every advertiser of some route prefix would otherwise go
        // stale, rather than waiting on each one's own NS-probe schedule.
        if let Some(deadline) = self.dpt.stale_route_deadline_ms() {
            if now_ms >= deadline && self.last_handled_stale_deadline != Some(deadline) {
                let rs = crate::ra::build_rs();
                platform.send_icmp6_nd(self.config.infra_if_index, ALL_ROUTERS_MULTICAST, &rs);
                self.last_handled_stale_deadline = Some(deadline);
            }
        }

        if now_ms >= self.ra_tx.trickle.next_fire_at_ms() {
            self.ra_tx.trickle.on_fire(now_ms);
            self.emit_ra(now_ms, platform);
        }
    }

    fn emit_ra(&mut self, now_ms: u64, platform: &mut impl Platform) {
        let decision = self.last_decision.unwrap_or_default();
        let bytes = self.ra_tx.build_ra(
            &decision,
            &self.dpt,
            self.local_on_link,
            &self.deprecating_on_links,
            self.ra_header_learned,
            now_ms,
        );
        platform.send_icmp6_nd(self.config.infra_if_index, ALL_NODES_MULTICAST, &bytes);
    }

    /// Explicit "re-advertise now" request.
    pub fn request_readvertise(&mut self, now_ms: u64) {
        self.ra_tx.trickle.reset_to_min(now_ms);
    }

    pub fn next_deadline_ms(&self, now_ms: u64) -> u64 {
        let dpt_deadline = self.dpt.next_deadline_ms(now_ms).unwrap_or(u64::MAX);
        let stale_deadline = self.dpt.stale_route_deadline_ms().unwrap_or(u64::MAX);
        dpt_deadline
            .min(stale_deadline)
            .min(self.ra_tx.trickle.next_fire_at_ms())
            .min(self.ra_tx.next_rs_due_ms())
    }
}

const ALL_NODES_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
const ALL_ROUTERS_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

fn apply_network_data_diff(previous: Option<&PolicyDecision>, decision: &PolicyDecision, network_data: &mut impl NetworkData) {
    let prev_omr = previous.and_then(|p| p.favored_omr);
    if prev_omr.map(|o| o.prefix) != decision.favored_omr.map(|o| o.prefix) {
        if let Some(old) = prev_omr {
            network_data.withdraw_omr(old.prefix);
        }
        if let Some(new) = decision.favored_omr {
            network_data.publish_omr(new.prefix, new.preference);
        }
    }

    let prev_route = previous.and_then(|p| p.external_route);
    if prev_route != decision.external_route {
        if let Some(old) = prev_route {
            network_data.withdraw_external_route(old.prefix);
        }
        if let Some(new) = decision.external_route {
            network_data.publish_external_route(new.prefix, new.adv_pio);
        }
    }

    let prev_nat64 = previous.and_then(|p| p.nat64_prefix);
    if prev_nat64 != decision.nat64_prefix {
        if let Some(old) = prev_nat64 {
            network_data.withdraw_nat64(old);
        }
        if let Some(new) = decision.nat64_prefix {
            network_data.publish_nat64(new);
        }
    }
}
