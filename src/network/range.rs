//! IPv4 address sequence generation
//!
//! Sequences increment the last octet and carry into higher octets on
//! overflow, so `10.0.0.255` is followed by `10.0.1.0`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;

/// Generator input: a first address bounded by a count or a last address
#[derive(Debug, Clone, Deserialize)]
pub struct AddressRange {
    /// First address emitted
    pub first: Ipv4Addr,
    /// Number of addresses to emit
    pub count: Option<usize>,
    /// Last address emitted (inclusive)
    pub last: Option<Ipv4Addr>,
}

impl AddressRange {
    /// Inclusive range from `first` through `last`
    pub fn bounded(first: Ipv4Addr, last: Ipv4Addr) -> Self {
        Self {
            first,
            count: None,
            last: Some(last),
        }
    }

    /// Materialize the sequence
    pub fn addresses(&self) -> Result<Vec<Ipv4Addr>> {
        generate_range(self.first, self.count, self.last)
    }
}

/// The address immediately after `ip`, carrying across octets
pub fn next_ip(ip: Ipv4Addr) -> Result<Ipv4Addr> {
    u32::from(ip)
        .checked_add(1)
        .map(Ipv4Addr::from)
        .ok_or_else(|| Error::InvalidAddress(format!("no address follows {}", ip)))
}

/// Generate an ordered address sequence
///
/// Exactly one of `count` and `last` must be given. A `last` below `first`
/// produces an empty sequence.
pub fn generate_range(
    first: Ipv4Addr,
    count: Option<usize>,
    last: Option<Ipv4Addr>,
) -> Result<Vec<Ipv4Addr>> {
    match (count, last) {
        (Some(count), None) => {
            let mut addrs = Vec::with_capacity(count);
            let mut current = first;
            for idx in 0..count {
                if idx > 0 {
                    current = next_ip(current)?;
                }
                addrs.push(current);
            }
            Ok(addrs)
        }
        (None, Some(last)) => {
            let (start, end) = (u32::from(first), u32::from(last));
            if end < start {
                return Ok(Vec::new());
            }
            Ok((start..=end).map(Ipv4Addr::from).collect())
        }
        (Some(_), Some(_)) => Err(Error::InvalidRequest(
            "address range takes either a count or a last address, not both".to_string(),
        )),
        (None, None) => Err(Error::InvalidRequest(
            "address range needs a count or a last address".to_string(),
        )),
    }
}
