use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Malformed port in endpoint")]
    BadPort,
}

/// An `IP[:PORT]` endpoint as it appears in a command path. `addr` is `None`
/// when the host part is absent or is not a valid dotted-quad (for example a
/// hostname), which callers treat as an unusable endpoint.
#[derive(Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: Option<Ipv4Addr>,
    pub port: Option<u16>,
}

pub fn extract_endpoint(s: &str) -> Result<Endpoint, EndpointError> {
    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) => {
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return Err(EndpointError::BadPort);
            }
            let port = port.parse::<u16>().map_err(|_| EndpointError::BadPort)?;
            (host, Some(port))
        }
        None => (s, None),
    };
    Ok(Endpoint {
        addr: Ipv4Addr::from_str(host).ok(),
        port,
    })
}

/// True iff `s` is a decimal netmask length in the accepted range. Masks
/// shorter than 9 would match enormous address blocks and are refused.
pub fn validate_mask_limit(s: &str) -> bool {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match s.parse::<u32>() {
        Ok(mask) => (9..=32).contains(&mask),
        Err(_) => false,
    }
}

// Numeric address range covered by an IP or CIDR string.
fn cidr_bounds(s: &str) -> Option<(u32, u32)> {
    let net = Ipv4Network::from_str(s).ok()?;
    Some((u32::from(net.network()), u32::from(net.broadcast())))
}

/// True iff the address range of `ip_or_cidr` overlaps any range in `list`.
/// A rule covering any whitelisted address counts as a conflict, so overlap
/// in either direction matters.
pub fn ip_in_list(ip_or_cidr: &str, list: &[Ipv4Network]) -> bool {
    let (a_lo, a_hi) = match cidr_bounds(ip_or_cidr) {
        Some(bounds) => bounds,
        None => return false,
    };
    list.iter().any(|net| {
        let b_lo = u32::from(net.network());
        let b_hi = u32::from(net.broadcast());
        a_lo <= b_hi && b_lo <= a_hi
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_bounds() {
        assert_eq!(cidr_bounds("1.2.3.4"), Some((16909060, 16909060)));
        assert_eq!(cidr_bounds("1.2.3.4/32"), Some((16909060, 16909060)));
        assert_eq!(cidr_bounds("1.2.3.4/31"), Some((16909060, 16909061)));
        assert_eq!(cidr_bounds("1.2.3.4/30"), Some((16909060, 16909063)));
        assert_eq!(cidr_bounds("1.2.3.4/0"), Some((0, 4294967295)));
        assert_eq!(cidr_bounds("129.2.3.129/28"), Some((2164392832, 2164392847)));
        assert_eq!(cidr_bounds("not-an-ip"), None);
    }

    #[test]
    fn test_ip_in_list() {
        assert!(ip_in_list("1.2.0.0/16", &[net("1.2.3.4")]));
        assert!(ip_in_list("1.2.3.4", &[net("1.2.0.0/16")]));
        assert!(!ip_in_list("2.2.2.2", &[net("1.2.0.0/16")]));
        assert!(ip_in_list("10.0.1.1", &[net("1.2.3.4"), net("10.0.0.0/8")]));
        assert!(!ip_in_list("garbage", &[net("1.2.3.4")]));
    }

    #[test]
    fn test_extract_endpoint() {
        assert_eq!(
            extract_endpoint("127.0.0.1:7865"),
            Ok(Endpoint {
                addr: Some(Ipv4Addr::new(127, 0, 0, 1)),
                port: Some(7865),
            })
        );
        assert_eq!(
            extract_endpoint("127.0.0.1"),
            Ok(Endpoint {
                addr: Some(Ipv4Addr::new(127, 0, 0, 1)),
                port: None,
            })
        );
        // invalid host still yields the port
        assert_eq!(
            extract_endpoint("5.c.7.6:6543"),
            Ok(Endpoint {
                addr: None,
                port: Some(6543),
            })
        );
        assert_eq!(extract_endpoint("1.2.3.4:"), Err(EndpointError::BadPort));
        assert_eq!(extract_endpoint("1.2.3.4:abc"), Err(EndpointError::BadPort));
        assert_eq!(extract_endpoint("1.2.3.4:99999"), Err(EndpointError::BadPort));
    }

    #[test]
    fn test_validate_mask_limit() {
        assert!(validate_mask_limit("9"));
        assert!(validate_mask_limit("24"));
        assert!(validate_mask_limit("32"));
        assert!(!validate_mask_limit("8"));
        assert!(!validate_mask_limit("33"));
        assert!(!validate_mask_limit("+24"));
        assert!(!validate_mask_limit(""));
        assert!(!validate_mask_limit("abc"));
    }
}
