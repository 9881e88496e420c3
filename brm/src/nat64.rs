//! NAT64 adaptor.
//!
//! The local /96 itself is derived in `prefix.rs` (a pure function of the
//! mesh identity); this module only tracks the externally-discovered
//! infra prefix and whether publication is enabled. The publish-or-not
//! decision lives in `policy.rs::nat64_decision`, which this state feeds.

use crate::prefix::IPv6Prefix;

pub struct Nat64Adaptor {
    enabled: bool,
    local: IPv6Prefix,
    infra: Option<IPv6Prefix>,
}

impl Nat64Adaptor {
    pub fn new(local: IPv6Prefix) -> Self {
        Self {
            enabled: false,
            local,
            infra: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn local(&self) -> IPv6Prefix {
        self.local
    }

    pub fn infra(&self) -> Option<IPv6Prefix> {
        self.infra
    }

    /// Called when `localOnLink`'s Ext-PAN-ID-derived mesh identity
    /// changes, so the local /96 is re-derived consistently with
    /// `localOnLink`/`localOmr`.
    pub fn set_local(&mut self, local: IPv6Prefix) {
        self.local = local;
    }

    /// Delivery callback for `platInfraIfDiscoverNat64PrefixDone`. An
    /// empty discovery result clears the infra prefix.
    pub fn on_infra_discovery_done(&mut self, discovered: Option<IPv6Prefix>) {
        self.infra = discovered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pfx(s: &str, len: u8) -> IPv6Prefix {
        IPv6Prefix::new(s.parse().unwrap(), len).unwrap()
    }

    #[test]
    fn discovery_result_replaces_infra_prefix() {
        let mut a = Nat64Adaptor::new(pfx("fd99::", 96));
        assert!(a.infra().is_none());
        a.on_infra_discovery_done(Some(pfx("64:ff9b::", 96)));
        assert_eq!(a.infra(), Some(pfx("64:ff9b::", 96)));
        a.on_infra_discovery_done(None);
        assert!(a.infra().is_none());
    }
}
