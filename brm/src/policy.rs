//! Routing Policy.
//!
//! A pure function over the Discovered Prefix Table, Network-Data-visible
//! OMR candidates, and BRM's own local state: it never mutates anything
//! and never touches the clock except through the `now_ms` it is handed,
//! so it can be exercised directly from unit tests without a fake timer.

use crate::dpt::DiscoveredPrefixTable;
use crate::prefix::IPv6Prefix;
use crate::wire::Preference;

/// Minimum `preferred` lifetime (seconds) an OnLinkEntry needs to be
/// eligible as the favored on-link prefix.
pub const FAVORED_ON_LINK_MIN_PREFERRED_SECS: u32 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OmrConfig {
    Auto,
    Custom { prefix: IPv6Prefix, preference: Preference },
    Disabled,
}

/// An OMR prefix visible from outside BRM's own local state: entries
/// already present in Network Data (domain prefixes included) or the
/// current DHCPv6-PD candidate.
#[derive(Debug, Clone, Copy)]
pub struct OmrCandidate {
    pub prefix: IPv6Prefix,
    pub preference: Preference,
    /// Domain prefixes (Backbone Router) and DHCPv6-PD prefixes count as
    /// infrastructure-derived for the default-route-vs-ULA decision.
    pub is_infra_derived: bool,
}

pub struct PolicyInputs<'a> {
    pub dpt: &'a DiscoveredPrefixTable,
    pub now_ms: u64,
    pub local_on_link: IPv6Prefix,
    /// `Some(local_on_link)` iff BRM is currently advertising its own
    /// on-link prefix; `None` while deferring to a peer's.
    pub advertised_on_link: Option<IPv6Prefix>,
    pub local_omr: IPv6Prefix,
    pub omr_config: OmrConfig,
    pub external_omr_candidates: &'a [OmrCandidate],
    pub dhcp6_pd_omr: Option<OmrCandidate>,
    pub nat64_local: IPv6Prefix,
    pub nat64_infra: Option<IPv6Prefix>,
    pub nat64_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalRoute {
    pub prefix: IPv6Prefix,
    /// Downstream consumer semantics for this flag aren't fully known;
    /// BRM exposes it verbatim rather than inferring meaning for it.
    pub adv_pio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FavoredOmr {
    pub prefix: IPv6Prefix,
    pub preference: Preference,
    pub is_infra_derived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyDecision {
    /// `true` iff BRM should be advertising `localOnLink` as a live PIO.
    pub advertise_local_on_link: bool,
    /// The numerically-favored on-link /64 across DPT + local, for
    /// informational/API purposes (`getFavoredOnLinkPrefix`).
    pub favored_on_link: Option<IPv6Prefix>,
    pub favored_omr: Option<FavoredOmr>,
    pub external_route: Option<ExternalRoute>,
    pub nat64_prefix: Option<IPv6Prefix>,
}

impl Default for FavoredOmr {
    fn default() -> Self {
        FavoredOmr {
            prefix: IPv6Prefix::UNSPECIFIED_ROUTE,
            preference: Preference::Medium,
            is_infra_derived: false,
        }
    }
}

/// Evaluates the full policy given a snapshot of inputs.
pub fn evaluate(inputs: &PolicyInputs<'_>) -> PolicyDecision {
    let favored_on_link = favored_on_link_prefix(inputs);
    let advertise_local_on_link = favored_on_link == Some(inputs.local_on_link);

    let favored_omr = favored_omr_prefix(inputs);

    let external_route = external_route_decision(inputs, favored_omr.as_ref(), advertise_local_on_link);

    let nat64_prefix = nat64_decision(inputs, favored_omr.as_ref());

    PolicyDecision {
        advertise_local_on_link,
        favored_on_link,
        favored_omr,
        external_route,
        nat64_prefix,
    }
}

/// The numerically smallest /64 among DPT entries with `preferred ≥
/// 1800s`, plus `localOnLink` itself — `localOnLink` is always a
/// candidate, not only while already advertised, so that once every
/// qualifying peer drops out BRM re-adopts it on the next evaluation
/// rather than staying silent forever.
fn favored_on_link_prefix(inputs: &PolicyInputs<'_>) -> Option<IPv6Prefix> {
    let candidates = inputs
        .dpt
        .iter_on_link()
        .filter(|(_, e)| e.preferred.remaining(inputs.now_ms) >= FAVORED_ON_LINK_MIN_PREFERRED_SECS)
        .map(|(_, e)| e.prefix)
        .chain(std::iter::once(inputs.local_on_link));
    candidates.min()
}

/// Picks the favored OMR prefix among Network Data candidates, the local
/// OMR, and a DHCPv6-PD candidate. `omr_config` can override
/// the whole selection.
fn favored_omr_prefix(inputs: &PolicyInputs<'_>) -> Option<FavoredOmr> {
    match inputs.omr_config {
        OmrConfig::Disabled => return None,
        OmrConfig::Custom { prefix, preference } => {
            return Some(FavoredOmr {
                prefix,
                preference,
                is_infra_derived: true,
            });
        }
        OmrConfig::Auto => {}
    }

    let mut candidates: Vec<OmrCandidate> = inputs.external_omr_candidates.to_vec();
    candidates.push(OmrCandidate {
        prefix: inputs.local_omr,
        preference: Preference::Medium,
        is_infra_derived: false,
    });
    if let Some(pd) = inputs.dhcp6_pd_omr {
        candidates.push(OmrCandidate {
            prefix: pd.prefix,
            preference: pd.preference,
            is_infra_derived: true,
        });
    }

    candidates
        .into_iter()
        .max_by(|a, b| a.preference.cmp(&b.preference).then(b.prefix.cmp(&a.prefix)))
        .map(|c| FavoredOmr {
            prefix: c.prefix,
            preference: c.preference,
            is_infra_derived: c.is_infra_derived,
        })
}

/// Default-route-vs-ULA-route decision.
fn external_route_decision(
    inputs: &PolicyInputs<'_>,
    favored_omr: Option<&FavoredOmr>,
    advertise_local_on_link: bool,
) -> Option<ExternalRoute> {
    let infra_derived_omr_present = favored_omr.is_some_and(|o| o.is_infra_derived);

    let dpt_has_default_or_non_ula_route = inputs
        .dpt
        .iter_routes()
        .any(|(_, e)| e.prefix.same_network(&IPv6Prefix::UNSPECIFIED_ROUTE) || !e.prefix.is_ula());

    let prefix = if infra_derived_omr_present && dpt_has_default_or_non_ula_route {
        IPv6Prefix::UNSPECIFIED_ROUTE
    } else {
        IPv6Prefix::ULA_ROUTE
    };

    Some(ExternalRoute {
        prefix,
        adv_pio: advertise_local_on_link,
    })
}

/// NAT64 publication rule: publish the local /96 unless an
/// infra NAT64 prefix is known AND an infrastructure-derived OMR is
/// present, in which case publish the discovered infra prefix.
fn nat64_decision(inputs: &PolicyInputs<'_>, favored_omr: Option<&FavoredOmr>) -> Option<IPv6Prefix> {
    if !inputs.nat64_enabled {
        return None;
    }
    let infra_derived_omr_present = favored_omr.is_some_and(|o| o.is_infra_derived);
    match inputs.nat64_infra {
        Some(infra) if infra_derived_omr_present => Some(infra),
        _ => Some(inputs.nat64_local),
    }
}
