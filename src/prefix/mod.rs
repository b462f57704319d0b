mod pool;

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

pub use pool::*;

/// An IPv4 address block, network address plus netmask.
pub type Prefix = Ipv4Network;

pub trait Add {
    fn add(self, n: u32) -> Self;
}

pub trait Sub {
    fn sub(self, n: u32) -> Self;
}

impl Add for Ipv4Addr {
    fn add(self, n: u32) -> Self {
        Ipv4Addr::from(u32::from(self).wrapping_add(n))
    }
}

impl Sub for Ipv4Addr {
    fn sub(self, n: u32) -> Self {
        Ipv4Addr::from(u32::from(self).wrapping_sub(n))
    }
}

pub trait Ipv4NetworkIterator {
    fn next_network(&self) -> Option<Ipv4Network>;
}

// 10.0.0.0/24 -> 10.0.1.0/24
impl Ipv4NetworkIterator for Ipv4Network {
    fn next_network(&self) -> Option<Ipv4Network> {
        if self.prefix() == 0 || self.prefix() > 32 {
            return None;
        }
        let next_ip = u32::from(self.network()).checked_add(1 << (32 - self.prefix()))?;
        Ipv4Network::new(Ipv4Addr::from(next_ip), self.prefix()).ok()
    }
}

/// Drops host bits, "10.0.0.1/24" becomes "10.0.0.0/24".
pub fn normalize(p: Prefix) -> Prefix {
    Ipv4Network::new(p.network(), p.prefix()).unwrap_or(p)
}

/// Every prefix of `list` that overlaps at least one prefix of `other`.
pub fn overlapping(list: &[Prefix], other: &[Prefix]) -> Vec<Prefix> {
    list.iter()
        .filter(|p| other.iter().any(|o| p.overlaps(*o)))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_network() {
        let n: Ipv4Network = "10.0.255.0/24".parse().unwrap();
        assert_eq!(n.next_network(), Some("10.1.0.0/24".parse().unwrap()));

        let last: Ipv4Network = "255.255.255.0/24".parse().unwrap();
        assert_eq!(last.next_network(), None);
    }

    #[test]
    fn test_addr_arith() {
        let ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        assert_eq!(ip.add(49), Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(ip.sub(1), Ipv4Addr::new(10, 0, 0, 0));
    }

    #[test]
    fn test_overlapping() {
        let a: Vec<Prefix> = vec!["10.0.0.0/24".parse().unwrap(), "192.168.1.0/24".parse().unwrap()];
        let b: Vec<Prefix> = vec!["10.0.0.128/25".parse().unwrap()];
        assert_eq!(overlapping(&a, &b), vec![a[0]]);
        assert!(overlapping(&b, &[]).is_empty());
        assert_eq!(normalize("10.0.0.1/24".parse().unwrap()), a[0]);
    }
}
