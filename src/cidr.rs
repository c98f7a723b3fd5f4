use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StackError;

/// An IPv4 network in CIDR notation, always stored in canonical form
/// (host bits cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, StackError> {
        if prefix > 32 {
            return Err(StackError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        let raw = u32::from(addr);
        let network = raw & Self::mask_bits(prefix);
        if network != raw {
            // 10.0.0.1/16 is almost always a typo, refuse it instead of silently truncating
            return Err(StackError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { network, prefix })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses covered by the block
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn first(&self) -> u64 {
        u64::from(self.network)
    }

    fn last(&self) -> u64 {
        self.first() + self.size() - 1
    }

    /// Whether `other` lies entirely within this block
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.first() >= self.first() && other.last() <= self.last()
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StackError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Sequential allocator handing out aligned sub-blocks of a parent network.
///
/// Blocks are allocated lowest address first. A request whose mask differs
/// from the previous one is aligned up to its own boundary, so the result
/// never overlaps earlier allocations.
#[derive(Debug)]
pub struct CidrAllocator {
    block: Ipv4Cidr,
    next: u64,
}

impl CidrAllocator {
    pub fn new(block: Ipv4Cidr) -> Self {
        Self {
            next: block.first(),
            block,
        }
    }

    pub fn allocate(&mut self, name: &str, prefix: u8) -> Result<Ipv4Cidr, StackError> {
        if prefix <= self.block.prefix || prefix > 32 {
            return Err(StackError::SubnetMaskTooWide {
                name: name.to_string(),
                mask: prefix,
                block: self.block.to_string(),
            });
        }

        let size = 1u64 << (32 - u32::from(prefix));
        let start = self.next.div_ceil(size) * size;
        let end = start + size - 1;
        if end > self.block.last() {
            return Err(StackError::AddressSpaceExhausted {
                name: name.to_string(),
                mask: prefix,
                block: self.block.to_string(),
            });
        }

        self.next = end + 1;
        // start fits in u32 because end <= block.last()
        Ipv4Cidr::new(Ipv4Addr::from(start as u32), prefix)
    }
}
