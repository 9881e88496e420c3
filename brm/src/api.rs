//! The public consumer-facing surface, layered as thin
//! delegations onto `BorderRoutingManager` and its sub-modules rather
//! than duplicating their logic.

use std::net::Ipv6Addr;

use crate::autoenable::AutoEnabledService;
use crate::dhcp6pd::PdPrefix;
use crate::dpt::{PrefixEntry, PrefixTableIterator, RdnssEntry, RouterEntry};
use crate::error::Result;
use crate::manager::BorderRoutingManager;
use crate::platform::NetworkData;
use crate::policy::OmrConfig;
use crate::prefix::IPv6Prefix;
use crate::wire::PrefixInfoOption;

impl BorderRoutingManager {
    /// `getOnLinkPrefix`: BRM's own, Ext-PAN-ID-derived on-link
    /// prefix, independent of whether it is currently advertised.
    pub fn get_on_link_prefix(&self) -> IPv6Prefix {
        self.local_on_link
    }

    /// `getFavoredOnLinkPrefix`: the numerically-favored on-link
    /// /64 across the whole DPT plus BRM's own, from the last policy run.
    pub fn get_favored_on_link_prefix(&self) -> Option<IPv6Prefix> {
        self.last_decision.and_then(|d| d.favored_on_link)
    }

    /// `getOmrPrefix`: BRM's own, mesh-identity-derived OMR
    /// prefix, independent of whether it is currently favored.
    pub fn get_omr_prefix(&self) -> IPv6Prefix {
        self.local_omr
    }

    /// `getFavoredOmrPrefix`: the prefix BRM is currently
    /// publishing into Network Data as the favored OMR, if any.
    pub fn get_favored_omr_prefix(&self) -> Option<IPv6Prefix> {
        self.last_decision.and_then(|d| d.favored_omr).map(|o| o.prefix)
    }

    /// `getNat64Prefix`: the prefix currently published for
    /// NAT64, if NAT64 is enabled and BRM is running.
    pub fn get_nat64_prefix(&self) -> Option<IPv6Prefix> {
        self.last_decision.and_then(|d| d.nat64_prefix)
    }

    /// `setNat64Enabled`.
    pub fn set_nat64_enabled(&mut self, enabled: bool, now_ms: u64, network_data: &mut impl NetworkData) {
        self.nat64.set_enabled(enabled);
        self.reevaluate_policy(now_ms, network_data);
    }

    pub fn nat64_enabled(&self) -> bool {
        self.nat64.enabled()
    }

    /// `setOmrConfig`: overrides the runtime Auto/Custom/
    /// Disabled OMR mode without touching the on-disk config until the
    /// caller separately persists it.
    pub fn set_omr_config(&mut self, omr_config: OmrConfig, now_ms: u64, network_data: &mut impl NetworkData) {
        self.omr_config = omr_config;
        self.reevaluate_policy(now_ms, network_data);
    }

    pub fn omr_config(&self) -> OmrConfig {
        self.omr_config
    }

    /// `setAutoEnable(service, on)`. `register` is called
    /// once per service to obtain its id; subsequent calls flip the flag.
    pub fn register_auto_enabled_service(&mut self, service: Box<dyn AutoEnabledService>, auto_enable: bool) -> usize {
        self.autoenable.register(service, auto_enable)
    }

    pub fn set_auto_enable(&mut self, service_id: usize, on: bool) {
        self.autoenable.set_auto_enable(service_id, on);
    }

    /// `setDhcp6PdEnabled`.
    pub fn set_dhcp6_pd_enabled(&mut self, enabled: bool) {
        self.dhcp6pd.set_enabled(enabled);
    }

    pub fn dhcp6_pd_enabled(&self) -> bool {
        self.dhcp6pd.enabled()
    }

    /// `processDhcp6PdReport`: ingests a platform-parsed
    /// DHCPv6-PD reply and re-evaluates policy if it changed anything.
    pub fn process_dhcp6_pd_report(&mut self, options: &[PrefixInfoOption], now_ms: u64, network_data: &mut impl NetworkData) -> Result<()> {
        self.dhcp6pd.process_report(options, now_ms)?;
        self.reevaluate_policy(now_ms, network_data);
        Ok(())
    }

    /// `getDhcp6PdOmrPrefix`.
    pub fn dhcp6_pd_omr_prefix(&self) -> Option<PdPrefix> {
        self.dhcp6pd.current()
    }

    /// `initPrefixIterator`.
    pub fn init_prefix_iterator(&self) -> PrefixTableIterator {
        self.dpt.init_prefix_iterator()
    }

    /// `nextPrefixEntry`.
    pub fn next_prefix_entry(&self, iter: &mut PrefixTableIterator) -> Option<PrefixEntry> {
        self.dpt.next_prefix_entry(iter)
    }

    /// `nextRdnssEntry`.
    pub fn next_rdnss_entry(&self, iter: &mut PrefixTableIterator) -> Option<RdnssEntry> {
        self.dpt.next_rdnss_entry(iter)
    }

    /// `nextRouterEntry`.
    pub fn next_router_entry(&self, iter: &mut PrefixTableIterator) -> Option<RouterEntry> {
        self.dpt.next_router_entry(iter)
    }

    /// Current RDNSS address set, for a caller that wants a snapshot
    /// rather than registering `setRdnssCallback`.
    pub fn rdnss_addresses(&self) -> Vec<Ipv6Addr> {
        self.dpt.iter_rdnss().map(|(_, e)| e.addr).collect()
    }
}
