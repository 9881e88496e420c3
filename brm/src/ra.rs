//! RA Transmitter / RS + NS emitter.
//!
//! Owns the trickle timer and the logic that turns a `PolicyDecision`
//! plus local state into the bytes the platform layer hands to
//! `platInfraIfSendIcmp6Nd`. The trickle state is a single absolute
//! deadline recomputed on each event rather than a running countdown, so
//! tests can replay events against a fake clock.

use std::net::Ipv6Addr;

use rand::Rng;

use crate::dpt::DiscoveredPrefixTable;
use crate::lifetime::Lifetime;
use crate::persistence::DeprecatingPrefix;
use crate::policy::PolicyDecision;
use crate::prefix::IPv6Prefix;
use crate::wire::{
    self, PrefixInfoOption, RaHeaderFlags, RouteInfoOption,
};

pub const TRICKLE_MIN: u64 = 16_000;
pub const TRICKLE_MAX: u64 = 196_000;

/// Lifetime BRM advertises for its own live on-link PIO and favored OMR
/// RIO.
pub const ADVERTISED_LIFETIME_SECS: u32 = 1800;
/// Lifetime/window for an OMR RIO that is being withdrawn.
pub const WITHDRAWN_OMR_LIFETIME_SECS: u32 = 300;

const INITIAL_RS_BURST_COUNT: u8 = 3;
const INITIAL_RS_JITTER_MS: u64 = 1000;

/// A monotonic deadline, recomputed on each external event rather than
/// mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trickle {
    current_interval_ms: u64,
    next_fire_at_ms: u64,
}

impl Trickle {
    pub fn new(now_ms: u64) -> Self {
        Self {
            current_interval_ms: TRICKLE_MIN,
            next_fire_at_ms: now_ms + TRICKLE_MIN,
        }
    }

    pub fn next_fire_at_ms(&self) -> u64 {
        self.next_fire_at_ms
    }

    /// Resets to the minimum interval: a policy decision change, an
    /// inconsistent received RA, or an explicit re-advertise request
    ///.
    pub fn reset_to_min(&mut self, now_ms: u64) {
        self.current_interval_ms = TRICKLE_MIN;
        self.next_fire_at_ms = now_ms + TRICKLE_MIN;
    }

    /// Call when the timer fires at `now_ms`; doubles the interval up to
    /// the maximum and arms the next deadline.
    pub fn on_fire(&mut self, now_ms: u64) {
        self.current_interval_ms = (self.current_interval_ms * 2).min(TRICKLE_MAX);
        self.next_fire_at_ms = now_ms + self.current_interval_ms;
    }
}

/// A previously-favored OMR prefix BRM is withdrawing: advertised with a
/// low-preference, short-lived RIO for up to `WITHDRAWN_OMR_LIFETIME_SECS`
///.
#[derive(Debug, Clone, Copy)]
struct WithdrawingOmr {
    prefix: IPv6Prefix,
    started_ms: u64,
}

pub struct RaTransmitter {
    pub trickle: Trickle,
    initial_rs_remaining: u8,
    next_rs_due_ms: u64,
    withdrawing_omr: Option<WithdrawingOmr>,
    last_published_omr: Option<IPv6Prefix>,
}

impl RaTransmitter {
    pub fn new(now_ms: u64) -> Self {
        Self {
            trickle: Trickle::new(now_ms),
            initial_rs_remaining: 0,
            next_rs_due_ms: u64::MAX,
            withdrawing_omr: None,
            last_published_omr: None,
        }
    }

    /// Arms the startup RS burst ("On enabled→running
    /// transition, send 3 RSes spaced by random jitter in [0,1]s"). The
    /// first RS fires immediately; later ones are spaced out by
    /// `next_rs_due_ms`.
    pub fn start_rs_burst(&mut self, now_ms: u64) {
        self.initial_rs_remaining = INITIAL_RS_BURST_COUNT;
        self.next_rs_due_ms = now_ms;
    }

    /// Any RA received during the burst cancels remaining retransmits.
    pub fn cancel_rs_burst(&mut self) {
        self.initial_rs_remaining = 0;
        self.next_rs_due_ms = u64::MAX;
    }

    pub fn rs_burst_active(&self) -> bool {
        self.initial_rs_remaining > 0
    }

    pub fn next_rs_due_ms(&self) -> u64 {
        self.next_rs_due_ms
    }

    /// Consumes one RS attempt from the burst if it is due at `now_ms`,
    /// arming the next one with a jittered delay in `[0, 1]s`.
    pub fn try_fire_rs(&mut self, now_ms: u64) -> bool {
        if self.initial_rs_remaining == 0 || now_ms < self.next_rs_due_ms {
            return false;
        }
        self.initial_rs_remaining -= 1;
        self.next_rs_due_ms = if self.initial_rs_remaining == 0 {
            u64::MAX
        } else {
            now_ms + rand::rng().random_range(0..=INITIAL_RS_JITTER_MS)
        };
        true
    }

    /// Records that `decision.favored_omr` changed from what BRM last
    /// published, starting the withdrawal clock for the one that fell out
    /// of favor (RIO at lifetime≤300, pref=low while
    /// withdrawing).
    pub fn note_published_omr(&mut self, new_omr: Option<IPv6Prefix>, now_ms: u64) {
        if new_omr == self.last_published_omr {
            return;
        }
        if let Some(old) = self.last_published_omr {
            if Some(old) != new_omr {
                self.withdrawing_omr = Some(WithdrawingOmr {
                    prefix: old,
                    started_ms: now_ms,
                });
            }
        }
        self.last_published_omr = new_omr;
    }

    fn withdrawing_omr_rio(&mut self, now_ms: u64) -> Option<RouteInfoOption> {
        let w = self.withdrawing_omr?;
        let elapsed = now_ms.saturating_sub(w.started_ms) / 1000;
        if elapsed >= WITHDRAWN_OMR_LIFETIME_SECS as u64 {
            self.withdrawing_omr = None;
            return None;
        }
        Some(RouteInfoOption {
            prefix: w.prefix,
            preference: wire::Preference::Low,
            lifetime: WITHDRAWN_OMR_LIFETIME_SECS - elapsed as u32,
        })
    }

    /// Builds the RA BRM should emit on a trickle fire or an explicit
    /// re-advertise.
    pub fn build_ra(
        &mut self,
        decision: &PolicyDecision,
        dpt: &DiscoveredPrefixTable,
        local_on_link: IPv6Prefix,
        deprecating_on_links: &[DeprecatingPrefix],
        ra_header_learned: Option<u16>,
        now_ms: u64,
    ) -> Vec<u8> {
        let (managed, other_config) = aggregate_m_o_flags(dpt);

        let flags = RaHeaderFlags {
            router_lifetime: ra_header_learned.unwrap_or(0),
            managed,
            other_config,
            snac: true,
        };

        let mut pios = Vec::new();
        if decision.advertise_local_on_link {
            pios.push(PrefixInfoOption {
                prefix: local_on_link,
                on_link: true,
                autonomous: false,
                valid_lifetime: ADVERTISED_LIFETIME_SECS,
                preferred_lifetime: ADVERTISED_LIFETIME_SECS,
            });
        }
        for dep in deprecating_on_links {
            pios.push(PrefixInfoOption {
                prefix: dep.prefix,
                on_link: true,
                autonomous: false,
                valid_lifetime: dep.valid.remaining(now_ms),
                preferred_lifetime: 0,
            });
        }

        let mut rios = Vec::new();
        if let Some(omr) = decision.favored_omr {
            rios.push(RouteInfoOption {
                prefix: omr.prefix,
                preference: wire::Preference::Medium,
                lifetime: ADVERTISED_LIFETIME_SECS,
            });
        }
        if let Some(withdrawing) = self.withdrawing_omr_rio(now_ms) {
            rios.push(withdrawing);
        }

        wire::build_router_advertisement(&flags, &pios, &rios)
    }

    /// Final RA on `running → stopped`: deprecating PIOs
    /// for everything BRM had published and zero-lifetime RIOs.
    pub fn build_final_ra(
        &self,
        local_on_link: IPv6Prefix,
        was_advertising_local: bool,
        deprecating_on_links: &[DeprecatingPrefix],
        last_favored_omr: Option<IPv6Prefix>,
        now_ms: u64,
    ) -> Vec<u8> {
        let flags = RaHeaderFlags {
            router_lifetime: 0,
            managed: false,
            other_config: false,
            snac: true,
        };

        let mut pios: Vec<PrefixInfoOption> = Vec::new();
        if was_advertising_local {
            pios.push(PrefixInfoOption {
                prefix: local_on_link,
                on_link: true,
                autonomous: false,
                valid_lifetime: ADVERTISED_LIFETIME_SECS,
                preferred_lifetime: 0,
            });
        }
        for dep in deprecating_on_links {
            pios.push(PrefixInfoOption {
                prefix: dep.prefix,
                on_link: true,
                autonomous: false,
                valid_lifetime: dep.valid.remaining(now_ms),
                preferred_lifetime: 0,
            });
        }

        let rios = last_favored_omr
            .map(|prefix| {
                vec![RouteInfoOption {
                    prefix,
                    preference: wire::Preference::Low,
                    lifetime: 0,
                }]
            })
            .unwrap_or_default();

        wire::build_router_advertisement(&flags, &pios, &rios)
    }
}

/// Logical OR, across all DPT routers whose S-flag is clear, of their M
/// and O flags.
fn aggregate_m_o_flags(dpt: &DiscoveredPrefixTable) -> (bool, bool) {
    let mut managed = false;
    let mut other_config = false;
    for r in dpt.iter_routers() {
        if r.s_flag {
            continue;
        }
        managed |= r.m_flag;
        other_config |= r.o_flag;
    }
    (managed, other_config)
}

/// Builds a Neighbor Solicitation to probe `target`.
pub fn build_ns_probe(target: Ipv6Addr) -> Vec<u8> {
    wire::build_neighbor_solicitation(target)
}

pub fn build_rs() -> Vec<u8> {
    wire::build_router_solicitation()
}
