use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid network range: {0}")]
    InvalidRange(String),
    #[error("prefix length {0} out of range")]
    InvalidPrefix(u8),
}

/// How a network range may be specified: CIDR notation or a
/// (first address, last address) span.
#[derive(Debug, Clone)]
pub enum RangeSpec {
    Cidr(String),
    Span(Ipv4Addr, Ipv4Addr),
}

impl RangeSpec {
    pub fn parse(s: &str) -> RangeSpec {
        RangeSpec::Cidr(s.to_owned())
    }
}

/// A derived private address space: base address, subnet mask and the
/// canonical CIDR string it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub base: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub prefix: u8,
    pub cidr: String,
}

impl Subnet {
    /// Derives base address and subnet mask from a range specification.
    /// A span (first, last) is re-expressed as CIDR using the bit length
    /// of the last-octet difference. Without a specification the range
    /// defaults to `192.168.1.0/24`.
    pub fn derive(spec: Option<RangeSpec>) -> Result<Subnet, AddrError> {
        let cidr = match spec {
            None => "192.168.1.0/24".to_owned(),
            Some(RangeSpec::Cidr(s)) => s,
            Some(RangeSpec::Span(first, last)) => {
                let lo = first.octets()[3];
                let hi = last.octets()[3];
                if hi < lo {
                    return Err(AddrError::InvalidRange(format!("{first}-{last}")));
                }
                let span = (hi - lo) as u32;
                let bits = u32::BITS - span.leading_zeros();
                format!("{}/{}", first, 32 - bits)
            }
        };

        let (base, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| AddrError::InvalidRange(cidr.clone()))?;
        let base: Ipv4Addr = base
            .parse()
            .map_err(|_| AddrError::InvalidRange(cidr.clone()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| AddrError::InvalidRange(cidr.clone()))?;

        Ok(Subnet {
            base,
            mask: subnet_mask(prefix)?,
            prefix,
            cidr,
        })
    }
}

/// Builds a dotted subnet mask from a prefix length, one bit per covered
/// position, most significant bit first within each octet.
pub fn subnet_mask(prefix: u8) -> Result<Ipv4Addr, AddrError> {
    if prefix > 32 {
        return Err(AddrError::InvalidPrefix(prefix));
    }

    let mut mask = [0u8; 4];
    for i in 0..prefix as usize {
        mask[i / 8] |= 1 << (7 - (i % 8));
    }
    Ok(Ipv4Addr::from(mask))
}

/// Returns the address `n` positions after `base`: `n` is added to the
/// last octet and any overflow carries leftward, each octet reduced
/// modulo 256.
pub fn nth_address(base: Ipv4Addr, n: u32) -> Ipv4Addr {
    let octets = base.octets();
    let mut value = [
        octets[0] as u32,
        octets[1] as u32,
        octets[2] as u32,
        octets[3] as u32 + n,
    ];

    for i in (1..4).rev() {
        value[i - 1] += value[i] / 256;
        value[i] %= 256;
    }
    value[0] %= 256;

    Ipv4Addr::new(
        value[0] as u8,
        value[1] as u8,
        value[2] as u8,
        value[3] as u8,
    )
}

/// Scans `nth_address(base, i)` for `i` in `[0, capacity)` in ascending
/// order and returns the first address for which `in_use` is false.
/// Holds no allocation state itself: the caller owns the binding map.
pub fn first_free_address<F>(base: Ipv4Addr, capacity: u32, in_use: F) -> Option<Ipv4Addr>
where
    F: Fn(Ipv4Addr) -> bool,
{
    (0..capacity)
        .map(|i| nth_address(base, i))
        .find(|addr| !in_use(*addr))
}
