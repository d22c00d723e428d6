//! Family-tagged subnet arithmetic.
//!
//! This file provides the address-range primitive used by the pool tree:
//! a network address paired with a prefix length, with containment checks
//! and the buddy split into two equal halves.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// IP address family of a subnet or pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    /// Maximum prefix length representable in this family.
    pub fn max_prefix_length(&self) -> u8 {
        match self {
            Family::Ipv4 => 32,
            Family::Ipv6 => 128,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Ipv4 => write!(f, "ipv4"),
            Family::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// A contiguous address range: network address plus prefix length.
///
/// The constructor masks host bits, so the stored address is always the
/// network address of the range. Serializes as `"addr/prefix"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpSubnet {
    network: IpAddr,
    prefix_length: u8,
}

impl Serialize for IpSubnet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IpSubnet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl IpSubnet {
    /// Create a subnet from an address and prefix length, masking any host
    /// bits. Fails if the prefix length exceeds the family maximum.
    pub fn new(addr: IpAddr, prefix_length: u8) -> Result<Self, PoolError> {
        let family = match addr {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        };
        if prefix_length > family.max_prefix_length() {
            return Err(PoolError::InvalidRequest(format!(
                "prefix length /{} out of range for {}",
                prefix_length, family
            )));
        }
        let network = match addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4) & mask_v4(prefix_length);
                IpAddr::V4(Ipv4Addr::from(bits))
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6) & mask_v6(prefix_length);
                IpAddr::V6(Ipv6Addr::from(bits))
            }
        };
        Ok(IpSubnet {
            network,
            prefix_length,
        })
    }

    /// Network address of this range.
    pub fn network(&self) -> IpAddr {
        self.network
    }

    /// Prefix length of this range.
    pub fn prefix_length(&self) -> u8 {
        self.prefix_length
    }

    /// Address family of this range.
    pub fn family(&self) -> Family {
        match self.network {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }

    /// Returns true if `other` is fully contained within this range.
    /// A range always contains itself. Ranges of different families are
    /// never contained in one another.
    pub fn contains(&self, other: &IpSubnet) -> bool {
        if other.prefix_length < self.prefix_length {
            return false;
        }
        match (self.network, other.network) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                u32::from(b) & mask_v4(self.prefix_length) == u32::from(a)
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                u128::from(b) & mask_v6(self.prefix_length) == u128::from(a)
            }
            _ => false,
        }
    }

    /// Split this range into its two buddy halves at prefix length + 1,
    /// returned as (lower, upper). Fails when the range is a single
    /// address and cannot be split further.
    pub fn split(&self) -> Result<(IpSubnet, IpSubnet), PoolError> {
        let child_prefix = self.prefix_length + 1;
        if child_prefix > self.family().max_prefix_length() {
            return Err(PoolError::InvalidRequest(format!(
                "cannot split single-address subnet {}",
                self
            )));
        }
        let (low, high) = match self.network {
            IpAddr::V4(v4) => {
                let base = u32::from(v4);
                let half = 1u32 << (32 - child_prefix);
                (
                    IpAddr::V4(Ipv4Addr::from(base)),
                    IpAddr::V4(Ipv4Addr::from(base + half)),
                )
            }
            IpAddr::V6(v6) => {
                let base = u128::from(v6);
                let half = 1u128 << (128 - child_prefix);
                (
                    IpAddr::V6(Ipv6Addr::from(base)),
                    IpAddr::V6(Ipv6Addr::from(base + half)),
                )
            }
        };
        Ok((
            IpSubnet {
                network: low,
                prefix_length: child_prefix,
            },
            IpSubnet {
                network: high,
                prefix_length: child_prefix,
            },
        ))
    }
}

/// Ordering by family, then ascending network address, then prefix length.
/// This is the deterministic child order the allocator traverses in.
impl Ord for IpSubnet {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.network, other.network) {
            (IpAddr::V4(a), IpAddr::V4(b)) => u32::from(a)
                .cmp(&u32::from(b))
                .then(self.prefix_length.cmp(&other.prefix_length)),
            (IpAddr::V6(a), IpAddr::V6(b)) => u128::from(a)
                .cmp(&u128::from(b))
                .then(self.prefix_length.cmp(&other.prefix_length)),
            (IpAddr::V4(_), IpAddr::V6(_)) => Ordering::Less,
            (IpAddr::V6(_), IpAddr::V4(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for IpSubnet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for IpSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_length)
    }
}

impl FromStr for IpSubnet {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = s.split_once('/').ok_or_else(|| {
            PoolError::InvalidRequest(format!("invalid subnet '{}': expected addr/prefix", s))
        })?;
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|e| PoolError::InvalidRequest(format!("invalid address '{}': {}", addr_part, e)))?;
        let prefix_length: u8 = prefix_part
            .parse()
            .map_err(|e| PoolError::InvalidRequest(format!("invalid prefix '{}': {}", prefix_part, e)))?;
        IpSubnet::new(addr, prefix_length)
    }
}

fn mask_v4(prefix_length: u8) -> u32 {
    if prefix_length == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_length))
    }
}

fn mask_v6(prefix_length: u8) -> u128 {
    if prefix_length == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_length))
    }
}
