//! Persistence.
//!
//! Stores the bounded set of on-link prefixes BRM has advertised, so they
//! can keep deprecating across a reboot. Binary layout, little detail
//! spared since it's a durable on-disk format: a 1-byte version tag, a
//! 4-byte record count, then records of `{16B prefix, 1B len, 4B
//! validAtSave, 4B savedAtMs}`, all big-endian.

use crate::error::{BrmError, Result};
use crate::lifetime::Lifetime;
use crate::prefix::IPv6Prefix;
use std::net::Ipv6Addr;

pub const SETTINGS_KEY: &str = "br.deprecatingPrefixes";

const FORMAT_VERSION: u8 = 1;
const RECORD_LEN: usize = 16 + 1 + 4 + 4;

/// A previously-advertised local on-link prefix still being deprecated,
/// one entry of the `deprecatingOnLinks` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeprecatingPrefix {
    pub prefix: IPv6Prefix,
    pub valid: Lifetime,
}

/// Encodes the deprecating set to the on-disk layout described above.
pub fn encode(entries: &[DeprecatingPrefix], now_ms: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 4 + entries.len() * RECORD_LEN);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for e in entries {
        buf.extend_from_slice(&e.prefix.octets());
        buf.push(e.prefix.length());
        buf.extend_from_slice(&e.valid.remaining(now_ms).to_be_bytes());
        buf.extend_from_slice(&now_ms.to_be_bytes()[4..8]); // lower 32 bits of the ms clock
    }
    buf
}

/// Decodes a previously-saved deprecating set ("restored
/// verbatim; entries whose remaining valid lifetime is ≤0 are dropped").
pub fn decode(bytes: &[u8], now_ms: u64) -> Result<Vec<DeprecatingPrefix>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if bytes[0] != FORMAT_VERSION {
        return Err(BrmError::MalformedRecord("unsupported persistence format version"));
    }
    if bytes.len() < 5 {
        return Err(BrmError::MalformedRecord("truncated record count"));
    }
    let count = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
    let mut offset = 5;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if offset + RECORD_LEN > bytes.len() {
            return Err(BrmError::MalformedRecord("truncated prefix record"));
        }
        let mut addr_bytes = [0u8; 16];
        addr_bytes.copy_from_slice(&bytes[offset..offset + 16]);
        let len = bytes[offset + 16];
        let valid_at_save = u32::from_be_bytes(bytes[offset + 17..offset + 21].try_into().unwrap());
        offset += RECORD_LEN;

        let Some(prefix) = IPv6Prefix::new(Ipv6Addr::from(addr_bytes), len) else {
            continue; // corrupt length in an otherwise well-formed record: skip, don't abort the whole load
        };
        if valid_at_save == 0 {
            continue;
        }
        out.push(DeprecatingPrefix {
            prefix,
            valid: Lifetime::new(valid_at_save, now_ms),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_entries() {
        let entries = vec![
            DeprecatingPrefix {
                prefix: IPv6Prefix::new("fd11::".parse().unwrap(), 64).unwrap(),
                valid: Lifetime::new(1200, 0),
            },
            DeprecatingPrefix {
                prefix: IPv6Prefix::new("fd22::".parse().unwrap(), 64).unwrap(),
                valid: Lifetime::new(600, 0),
            },
        ];
        let bytes = encode(&entries, 0);
        let decoded = decode(&bytes, 0).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].prefix, entries[0].prefix);
        assert_eq!(decoded[0].valid.remaining(0), 1200);
    }

    #[test]
    fn expired_entries_are_dropped_on_load() {
        let entries = vec![DeprecatingPrefix {
            prefix: IPv6Prefix::new("fd11::".parse().unwrap(), 64).unwrap(),
            valid: Lifetime::new(100, 0),
        }];
        let bytes = encode(&entries, 200); // saved at a time after its valid lifetime
        let decoded = decode(&bytes, 0).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn rejects_unknown_version() {
        let bytes = vec![99, 0, 0, 0, 0];
        assert!(decode(&bytes, 0).is_err());
    }

    #[test]
    fn empty_input_decodes_to_empty_set() {
        assert!(decode(&[], 0).unwrap().is_empty());
    }
}
