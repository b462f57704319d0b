use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::cascade::CascadeConnector;
use crate::config::InstanceInfo;
use crate::daemon::EventSender;
use crate::prelude::*;

/// Puts local interfaces (wired ports, access points) onto a bridge.
pub trait LanInterface {
    fn full_name(&self) -> &str;
    fn start(&mut self, bridge: &str) -> Void;
    fn stop(&mut self);
}

/// Terminates client tunnels on a bridge of its own.
pub trait VpnServer {
    fn full_name(&self) -> &str;
    fn start(&mut self, bridge: &str, prefix: Prefix) -> Void;
    fn stop(&mut self);
}

/// The internet connection. Posts `Event::WanUp` / `Event::WanDown`.
pub trait WanConnection {
    fn name(&self) -> &str;
    fn start(&mut self, tx: EventSender) -> Void;
    fn stop(&mut self);
    fn is_alive(&self) -> bool;
    fn interface(&self) -> Option<String>;
    fn prefix_list(&self) -> Vec<Prefix>;
}

/// The tunnel to the upstream router. Posts `Event::VpnUp` / `Event::VpnDown`.
pub trait VpnClient {
    fn name(&self) -> &str;
    fn start(&mut self, tx: EventSender) -> Void;
    fn stop(&mut self);
    fn interface(&self) -> String;
    fn prefix_list(&self) -> Vec<Prefix>;
    fn remote_ip(&self) -> Ipv4Addr;
    fn local_ip(&self) -> Ipv4Addr;
}

pub type Factory<T> = Box<dyn Fn(&InstanceInfo) -> Res<Box<T>>>;

/// Named constructors of one plugin family.
pub struct Family<T: ?Sized> {
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Default for Family<T> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<T: ?Sized> Family<T> {
    pub fn register(&mut self, name: &str, factory: Factory<T>) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn create(&self, name: &str, info: &InstanceInfo) -> Res<Box<T>> {
        let factory = self
            .factories
            .get(name)
            .ok_or(anyhow!("plugin \"{}\" not found", name))?;
        factory(info).with_context(|| format!("creating plugin \"{}\"", info.full_name()))
    }
}

/// Every plugin the daemon can instantiate, selected by config.
#[derive(Default)]
pub struct PluginHub {
    pub lan_interfaces: Family<dyn LanInterface>,
    pub vpn_servers: Family<dyn VpnServer>,
    pub wan_connections: Family<dyn WanConnection>,
    pub vpn_clients: Family<dyn VpnClient>,
    pub cascade: Option<Box<dyn Fn() -> Box<dyn CascadeConnector>>>,
}

impl PluginHub {
    pub fn cascade_connector(&self) -> Option<Box<dyn CascadeConnector>> {
        self.cascade.as_ref().map(|f| f())
    }
}
