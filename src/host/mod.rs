use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Attributes announced for one client address. A record without a hostname
/// is present but unnamed: it counts as reachable but is never resolvable.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HostData {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hostname: Option<String>,

    #[serde(rename = "wakeup-mac", skip_serializing_if = "Option::is_none", default)]
    pub wakeup_mac: Option<MacAddr6>,

    /// Address the client is reachable under from this side of a cascade link.
    #[serde(rename = "nat-ip", skip_serializing_if = "Option::is_none", default)]
    pub nat_ip: Option<Ipv4Addr>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl HostData {
    pub fn named(hostname: &str) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            ..Default::default()
        }
    }
}

pub type IpDataMap = BTreeMap<Ipv4Addr, HostData>;

/// Keys every client by the address it is reachable under locally: an entry
/// carrying a nat-ip override is stored under that address with the
/// override stripped, the original address is dropped.
pub fn apply_nat_ip(client_list: &IpDataMap) -> IpDataMap {
    client_list
        .iter()
        .map(|(ip, data)| match data.nat_ip {
            Some(nat_ip) => (
                nat_ip,
                HostData {
                    nat_ip: None,
                    ..data.clone()
                },
            ),
            None => (*ip, data.clone()),
        })
        .collect()
}
