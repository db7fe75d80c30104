//! IPv4 CIDR arithmetic
//!
//! Provides:
//! - Netmask, network, wildcard and broadcast derivation
//! - Membership tests for addresses against a CIDR block
//! - A `Cidr` value type usable directly in TOML rule tables

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Every possible 32-bit netmask, indexed by prefix length
const NETMASKS: [u32; 33] = build_netmasks();

const fn build_netmasks() -> [u32; 33] {
    let mut table = [0u32; 33];
    let mut len = 1;
    while len <= 32 {
        table[len] = u32::MAX << (32 - len);
        len += 1;
    }
    table
}

fn mask_bits(prefix_len: u8) -> Result<u32> {
    NETMASKS
        .get(prefix_len as usize)
        .copied()
        .ok_or_else(|| {
            Error::InvalidAddress(format!("prefix length /{} is out of range", prefix_len))
        })
}

/// Parse a dotted-quad IPv4 address
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("'{}' is not a dotted-quad IPv4 address", s)))
}

/// Netmask for a prefix length (e.g. 24 -> 255.255.255.0)
pub fn netmask(prefix_len: u8) -> Result<Ipv4Addr> {
    mask_bits(prefix_len).map(Ipv4Addr::from)
}

/// Network address of `ip` under `prefix_len`
pub fn network(ip: Ipv4Addr, prefix_len: u8) -> Result<Ipv4Addr> {
    Ok(Ipv4Addr::from(u32::from(ip) & mask_bits(prefix_len)?))
}

/// Host-bits mask, the complement of the netmask
pub fn wildcard(prefix_len: u8) -> Result<Ipv4Addr> {
    Ok(Ipv4Addr::from(!mask_bits(prefix_len)?))
}

/// Broadcast address from a network address and its wildcard
pub fn broadcast(network: Ipv4Addr, wildcard: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network) ^ u32::from(wildcard))
}

/// Test whether `ip` falls inside `cidr`
///
/// An absent or empty address is never inside any block.
pub fn within(ip: Option<&str>, cidr: &str) -> Result<bool> {
    let ip = match ip.map(str::trim) {
        None | Some("") => return Ok(false),
        Some(ip) => parse_ipv4(ip)?,
    };
    let cidr: Cidr = cidr.parse()?;
    Ok(cidr.contains(ip))
}

/// An IPv4 address with a prefix length
///
/// The address part is kept as written, so `192.168.1.130/26` remembers
/// `.130` while `network()` reports `.128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cidr(Ipv4Net);

impl Cidr {
    /// Address part as written
    pub fn addr(&self) -> Ipv4Addr {
        self.0.addr()
    }

    /// Prefix length (0-32)
    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    // Ipv4Net never holds a prefix above 32
    fn mask(&self) -> u32 {
        NETMASKS[usize::from(self.prefix_len())]
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    pub fn wildcard(&self) -> Ipv4Addr {
        Ipv4Addr::from(!self.mask())
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr()) & self.mask())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        broadcast(self.network(), self.wildcard())
    }

    /// Check `network <= ip <= broadcast` as unsigned integers
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        u32::from(self.network()) <= ip && ip <= u32::from(self.broadcast())
    }

    /// Whether `ip` can be given to a host
    ///
    /// The network and broadcast addresses are excluded, except on /31 and
    /// /32 blocks where every address is a host.
    pub fn is_host(&self, ip: Ipv4Addr) -> bool {
        if !self.contains(ip) {
            return false;
        }
        self.prefix_len() >= 31 || (ip != self.network() && ip != self.broadcast())
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<Ipv4Net>()
            .map(Self)
            .map_err(|_| Error::InvalidAddress(format!("'{}' is not an IPv4 CIDR block", s)))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
