//! DHCPv6-PD adaptor.
//!
//! Consumes an already-parsed, RA-shaped report of one or more delegated
//! PIOs; wire parsing of the report itself happens upstream, so this
//! module works directly on `PrefixInfoOption`s the platform layer hands
//! it, keeping its FSM logic separate from any socket/option codec.

use crate::error::{BrmError, Result};
use crate::policy::OmrCandidate;
use crate::prefix::IPv6Prefix;
use crate::wire::{Preference, PrefixInfoOption};

/// Hold-off before swapping to a newly-arrived PdPrefix while the old one
/// is still unpublished, to avoid flapping.
pub const SWAP_HOLD_OFF_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdPrefix {
    pub prefix: IPv6Prefix,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
}

impl PdPrefix {
    pub fn as_omr_candidate(&self) -> OmrCandidate {
        OmrCandidate {
            prefix: self.prefix,
            preference: Preference::Medium,
            is_infra_derived: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapState {
    Idle,
    WaitingToSwap { candidate: PdPrefix, since_ms: u64 },
}

pub struct Dhcp6PdAdaptor {
    enabled: bool,
    current: Option<PdPrefix>,
    published: bool,
    swap: SwapState,
}

impl Dhcp6PdAdaptor {
    pub fn new() -> Self {
        Self {
            enabled: false,
            current: None,
            published: false,
            swap: SwapState::Idle,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.current = None;
            self.published = false;
            self.swap = SwapState::Idle;
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn current(&self) -> Option<PdPrefix> {
        self.current
    }

    /// Marks the current PdPrefix as having been published into Network
    /// Data, which unlocks immediate swap on the next better report.
    pub fn mark_published(&mut self) {
        self.published = true;
    }

    /// Validates and ingests a report of delegated prefixes: option length
    /// must meet the minimum, and a prefix shorter than /64 is extended
    /// right-padded with zeros to /64. Selects the option with the
    /// longest preferred lifetime as the candidate PdPrefix.
    pub fn process_report(&mut self, options: &[PrefixInfoOption], now_ms: u64) -> Result<()> {
        if !self.enabled {
            return Err(BrmError::Disabled);
        }
        if options.is_empty() {
            return Err(BrmError::MalformedPdReport("report contains no delegated prefixes"));
        }

        let mut best: Option<PdPrefix> = None;
        for opt in options {
            if opt.prefix.length() > 64 {
                continue; // longer-than-/64 delegations are not representable as an OMR candidate
            }
            let candidate = widen_to_64(opt);
            if best.is_none_or(|b| candidate.preferred_lifetime > b.preferred_lifetime) {
                best = Some(candidate);
            }
        }
        let Some(candidate) = best else {
            return Err(BrmError::MalformedPdReport("no delegated prefix is representable as a /64"));
        };

        match self.current {
            None => {
                self.current = Some(candidate);
                self.published = false;
                self.swap = SwapState::Idle;
            }
            Some(existing) if existing.prefix == candidate.prefix => {
                self.current = Some(candidate); // refresh lifetimes
            }
            Some(_) if self.published => {
                self.current = Some(candidate);
                self.published = false;
                self.swap = SwapState::Idle;
            }
            Some(_) => {
                // Old PdPrefix is not yet published: hold off briefly
                // rather than flapping immediately.
                self.swap = SwapState::WaitingToSwap {
                    candidate,
                    since_ms: now_ms,
                };
            }
        }
        Ok(())
    }

    /// Call periodically (e.g. on timer tick) to complete a pending swap
    /// once the hold-off has elapsed.
    pub fn tick(&mut self, now_ms: u64) {
        if let SwapState::WaitingToSwap { candidate, since_ms } = self.swap {
            if now_ms.saturating_sub(since_ms) >= SWAP_HOLD_OFF_MS {
                self.current = Some(candidate);
                self.published = false;
                self.swap = SwapState::Idle;
            }
        }
    }
}

impl Default for Dhcp6PdAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

fn widen_to_64(opt: &PrefixInfoOption) -> PdPrefix {
    // Right-padded with zeros to /64; `addr()` already has the
    // host bits beyond the original length zeroed, so this never fails.
    let prefix = IPv6Prefix::new(opt.prefix.addr(), 64).unwrap();
    PdPrefix {
        prefix,
        preferred_lifetime: opt.preferred_lifetime,
        valid_lifetime: opt.valid_lifetime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pio(prefix: &str, len: u8, preferred: u32, valid: u32) -> PrefixInfoOption {
        PrefixInfoOption {
            prefix: IPv6Prefix::new(prefix.parse().unwrap(), len).unwrap(),
            on_link: false,
            autonomous: false,
            valid_lifetime: valid,
            preferred_lifetime: preferred,
        }
    }

    #[test]
    fn disabled_adaptor_rejects_reports() {
        let mut a = Dhcp6PdAdaptor::new();
        assert!(matches!(a.process_report(&[pio("2000::", 64, 100, 200)], 0), Err(BrmError::Disabled)));
    }

    #[test]
    fn picks_longest_preferred_lifetime() {
        let mut a = Dhcp6PdAdaptor::new();
        a.set_enabled(true);
        let options = vec![
            pio("2000:1::", 64, 100, 200),
            pio("2000:2::", 64, 500, 600),
        ];
        a.process_report(&options, 0).unwrap();
        assert_eq!(a.current().unwrap().prefix, IPv6Prefix::new("2000:2::".parse().unwrap(), 64).unwrap());
    }

    #[test]
    fn shorter_than_64_is_widened() {
        let mut a = Dhcp6PdAdaptor::new();
        a.set_enabled(true);
        a.process_report(&[pio("2000::", 56, 100, 200)], 0).unwrap();
        assert_eq!(a.current().unwrap().prefix.length(), 64);
    }

    #[test]
    fn longer_than_64_is_skipped() {
        let mut a = Dhcp6PdAdaptor::new();
        a.set_enabled(true);
        let err = a.process_report(&[pio("2000::", 80, 100, 200)], 0);
        assert!(err.is_err());
    }

    #[test]
    fn swap_holds_off_when_old_not_yet_published() {
        let mut a = Dhcp6PdAdaptor::new();
        a.set_enabled(true);
        a.process_report(&[pio("2000:1::", 64, 100, 200)], 0).unwrap();
        // old not yet marked published
        a.process_report(&[pio("2000:2::", 64, 900, 1000)], 10).unwrap();
        assert_eq!(a.current().unwrap().prefix, IPv6Prefix::new("2000:1::".parse().unwrap(), 64).unwrap());

        a.tick(10 + SWAP_HOLD_OFF_MS + 1);
        assert_eq!(a.current().unwrap().prefix, IPv6Prefix::new("2000:2::".parse().unwrap(), 64).unwrap());
    }

    #[test]
    fn swap_is_immediate_once_old_was_published() {
        let mut a = Dhcp6PdAdaptor::new();
        a.set_enabled(true);
        a.process_report(&[pio("2000:1::", 64, 100, 200)], 0).unwrap();
        a.mark_published();
        a.process_report(&[pio("2000:2::", 64, 900, 1000)], 10).unwrap();
        assert_eq!(a.current().unwrap().prefix, IPv6Prefix::new("2000:2::".parse().unwrap(), 64).unwrap());
    }
}
