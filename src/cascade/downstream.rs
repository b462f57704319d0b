use std::net::Ipv4Addr;

use crate::cascade::{RouterInfo, RouterMap};
use crate::host::apply_nat_ip;
use crate::prelude::*;

pub fn downstream_source(router_id: &str) -> String {
    format!("downstream-{}", router_id)
}

/// Routers announced over one downstream session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownstreamPeer {
    peer: String,
    routers: RouterMap,
}

impl DownstreamPeer {
    pub fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
            routers: RouterMap::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn router_ids(&self) -> Vec<String> {
        self.routers.keys().cloned().collect()
    }

    pub fn router(&self, router_id: &str) -> Option<&RouterInfo> {
        self.routers.get(router_id)
    }

    /// Stores the routers, returns the ids that were not known before.
    pub fn add_routers(&mut self, routers: RouterMap) -> Vec<String> {
        let mut fresh = vec![];
        for (id, info) in routers {
            if self.routers.insert(id.clone(), info).is_none() {
                fresh.push(id);
            }
        }
        fresh
    }

    /// Returns the ids that were actually present.
    pub fn remove_routers(&mut self, router_ids: &[String]) -> Vec<String> {
        router_ids
            .iter()
            .filter(|id| self.routers.remove(*id).is_some())
            .cloned()
            .collect()
    }

    pub fn client_add_or_change(&mut self, router_id: &str, clients: &IpDataMap) -> Res<()> {
        let router = self.routers.get_mut(router_id).ok_or(anyhow!(
            "router {} unknown on peer {}",
            router_id,
            self.peer
        ))?;
        router.client_list.extend(clients.iter().map(|(ip, d)| (*ip, d.clone())));
        Ok(())
    }

    pub fn client_remove(&mut self, router_id: &str, ips: &[Ipv4Addr]) -> Res<()> {
        let router = self.routers.get_mut(router_id).ok_or(anyhow!(
            "router {} unknown on peer {}",
            router_id,
            self.peer
        ))?;
        for ip in ips {
            router.client_list.remove(ip);
        }
        Ok(())
    }

    /// Host set of one router's source, clients keyed by nat-ip where given.
    pub fn host_map(&self, router_id: &str) -> Option<IpDataMap> {
        self.routers
            .get(router_id)
            .map(|it| apply_nat_ip(&it.client_list))
    }
}
