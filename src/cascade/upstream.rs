use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use tracing::warn;

use crate::cascade::RouterMap;
use crate::host::apply_nat_ip;
use crate::prelude::*;

/// One ancestor as seen from this router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHop {
    pub id: String,
    /// Address the ancestor is reached at.
    pub ip: Ipv4Addr,
    /// Our own end of the link towards it.
    pub local_ip: Ipv4Addr,
    pub hostname: Option<String>,
}

/// Ancestors from the nearest to the root, following `parent` links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamChain {
    pub hops: Vec<ChainHop>,
}

impl UpstreamChain {
    /// Starts at the peer of the current session. Stops at the first router
    /// without a parent, at an unknown router, or when a router repeats.
    pub fn walk(routers: &RouterMap, peer_id: &str, peer_ip: Ipv4Addr, local_ip: Ipv4Addr) -> Self {
        let mut hops = vec![];
        let mut seen = BTreeSet::new();
        let mut cur = Some((peer_id.to_string(), peer_ip, local_ip));
        while let Some((id, ip, local_ip)) = cur.take() {
            if !seen.insert(id.clone()) {
                warn!(router = %id, "upstream chain loops");
                break;
            }
            let Some(data) = routers.get(&id) else {
                warn!(router = %id, "upstream router unknown");
                break;
            };
            hops.push(ChainHop {
                id,
                ip,
                local_ip,
                hostname: data.hostname.clone(),
            });
            if let (Some(parent), Some(link)) = (&data.parent, &data.cascade_vpn) {
                cur = Some((parent.clone(), link.remote_ip, link.local_ip));
            }
        }
        Self { hops }
    }

    pub fn local_ips(&self) -> Vec<Ipv4Addr> {
        self.hops.iter().map(|it| it.local_ip).collect()
    }

    /// The synthetic host set of the "upstream-vpn" source: every ancestor
    /// under its reachable address, then every client of every upstream
    /// router except our own relay addresses, keyed by nat-ip where given.
    pub fn aggregate(&self, routers: &RouterMap) -> IpDataMap {
        let mut ip_map = IpDataMap::new();
        for hop in &self.hops {
            let data = HostData {
                hostname: hop.hostname.clone(),
                ..Default::default()
            };
            ip_map.insert(hop.ip, data);
        }

        let local_ips = self.local_ips();
        for router in routers.values() {
            let clients = router
                .client_list
                .iter()
                .filter(|(ip, _)| !local_ips.contains(ip))
                .map(|(ip, data)| (*ip, data.clone()))
                .collect::<IpDataMap>();
            ip_map.extend(apply_nat_ip(&clients));
        }
        ip_map
    }
}
