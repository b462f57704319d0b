use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::daemon::EventSender;
use crate::prelude::*;

/// The tunnel a router uses to reach its own parent.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeVpnLink {
    #[serde(rename = "remote-ip")]
    pub remote_ip: Ipv4Addr,

    #[serde(rename = "local-ip")]
    pub local_ip: Ipv4Addr,
}

/// What a router announces about itself to the rest of the tree.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RouterInfo {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hostname: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<String>,

    #[serde(rename = "cascade-vpn", skip_serializing_if = "Option::is_none", default)]
    pub cascade_vpn: Option<CascadeVpnLink>,

    #[serde(rename = "client-list", default)]
    pub client_list: IpDataMap,

    #[serde(rename = "lan-prefix-list", default)]
    pub lan_prefix_list: Vec<Prefix>,

    #[serde(rename = "wan-prefix-list", default)]
    pub wan_prefix_list: Vec<Prefix>,
}

pub type RouterMap = BTreeMap<String, RouterInfo>;

/// Reply to a successful connect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CascadeInit {
    /// Nearest ancestor first.
    pub upstream: Vec<(String, RouterInfo)>,

    #[serde(rename = "subhost-start")]
    pub subhost_start: Ipv4Addr,

    #[serde(rename = "subhost-end")]
    pub subhost_end: Ipv4Addr,
}

/// Notifications from the session with the upstream router.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    RouterAdd(RouterMap),
    RouterRemove(Vec<String>),
    ClientAddOrChange { router_id: String, clients: IpDataMap },
    ClientRemove { router_id: String, ips: Vec<Ipv4Addr> },
    /// Full replacement of every upstream router.
    Refresh(RouterMap),
}

/// Notifications from sessions opened by downstream routers, keyed by the
/// peer that carries them.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamEvent {
    Up { peer: String, routers: RouterMap },
    Down { peer: String },
    RouterAdd { peer: String, routers: RouterMap },
    RouterRemove { peer: String, router_ids: Vec<String> },
    ClientAddOrChange { peer: String, router_id: String, clients: IpDataMap },
    ClientRemove { peer: String, router_id: String, ips: Vec<Ipv4Addr> },
}

/// An established control session with the upstream router.
pub trait CascadeApiClient {
    fn peer_id(&self) -> &str;
    fn peer_ip(&self) -> Ipv4Addr;
    fn add_subhost(&mut self, ip_map: &IpDataMap) -> Void;
    fn remove_subhost(&mut self, ip_list: &[Ipv4Addr]) -> Void;
    fn report_prefix_conflict(&mut self, prefixes: &[Prefix]) -> Void;
    fn dispose(&mut self);
}

/// Opens control sessions. Ongoing upstream notifications are posted as
/// `Event::Upstream` on `tx`.
pub trait CascadeConnector {
    fn connect(
        &mut self,
        remote: Ipv4Addr,
        port: u16,
        tx: EventSender,
    ) -> Res<(Box<dyn CascadeApiClient>, CascadeInit)>;
}
