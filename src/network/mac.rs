//! Deterministic MAC derivation
//!
//! Virtual NICs get a MAC built from a fixed locally-administered prefix
//! followed by the four octets of their IPv4 address. MACs also convert to
//! the decimal OID suffix used by ARP and bridge-table walks.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Locally-administered prefix for generated MACs
pub const DEFAULT_MAC_PREFIX: &str = "14:6E";

/// Encode an IPv4 address into a MAC under `prefix`
///
/// `10.0.0.1` with the default prefix becomes `14:6E:0A:00:00:01`.
pub fn ip_to_mac(ip: Ipv4Addr, prefix: &str) -> String {
    let octets: Vec<String> = ip.octets().iter().map(|o| format!("{:02X}", o)).collect();
    format!("{}:{}", prefix, octets.join(":"))
}

/// Convert a colon-delimited MAC to a dotted decimal OID suffix
pub fn mac_to_oid(mac: &str) -> Result<String> {
    let bytes = parse_mac_bytes(mac)?;
    let parts: Vec<String> = bytes.iter().map(u8::to_string).collect();
    Ok(parts.join("."))
}

/// Validate a MAC prefix such as `14:6E`
pub fn validate_prefix(prefix: &str) -> Result<()> {
    let bytes = parse_mac_bytes(prefix)?;
    if bytes.len() != 2 {
        return Err(Error::InvalidAddress(format!(
            "MAC prefix '{}' must be two bytes",
            prefix
        )));
    }
    Ok(())
}

fn parse_mac_bytes(mac: &str) -> Result<Vec<u8>> {
    mac.trim()
        .split(':')
        .map(|byte| {
            if byte.is_empty() || byte.len() > 2 {
                return Err(Error::InvalidAddress(format!("malformed MAC '{}'", mac)));
            }
            u8::from_str_radix(byte, 16)
                .map_err(|_| Error::InvalidAddress(format!("malformed MAC '{}'", mac)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_to_mac() {
        let mac = ip_to_mac("10.0.0.1".parse().unwrap(), DEFAULT_MAC_PREFIX);
        assert_eq!(mac, "14:6E:0A:00:00:01");

        let mac = ip_to_mac("192.168.254.17".parse().unwrap(), "02:AA");
        assert_eq!(mac, "02:AA:C0:A8:FE:11");
    }

    #[test]
    fn test_mac_to_oid() {
        assert_eq!(mac_to_oid("14:6E:0A:00:00:01").unwrap(), "20.110.10.0.0.1");
        assert_eq!(mac_to_oid("ff:ff:ff:ff:ff:ff").unwrap(), "255.255.255.255.255.255");
        assert_eq!(mac_to_oid("0:1b:2:c:d:e").unwrap(), "0.27.2.12.13.14");
    }

    #[test]
    fn test_mac_to_oid_rejects_garbage() {
        assert!(matches!(mac_to_oid("14:6E:ZZ"), Err(Error::InvalidAddress(_))));
        assert!(matches!(mac_to_oid("14::6E"), Err(Error::InvalidAddress(_))));
        assert!(matches!(mac_to_oid("146E"), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_prefix_validation() {
        assert!(validate_prefix(DEFAULT_MAC_PREFIX).is_ok());
        assert!(validate_prefix("14:6E:00").is_err());
    }
}
