use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::daemon::LoopThread;
use crate::prelude::*;

/// Consumer of host events that originate on local bridges.
pub trait HostListener {
    fn on_host_appear(&mut self, origin: &str, ip_map: &IpDataMap) -> Void;
    fn on_host_disappear(&mut self, origin: &str, ip_list: &[Ipv4Addr]) -> Void;
}

/// Routes host events between all bridges. Every bridge knows every other
/// bridge as a source plus the cascade sources registered here; an event is
/// never delivered back to the bridge it came from.
#[derive(Debug)]
pub struct HostFabric {
    bridges: Vec<Bridge>,
    sources: Vec<String>,
    thread: LoopThread,
}

impl HostFabric {
    pub fn new(thread: LoopThread) -> Self {
        Self {
            bridges: vec![],
            sources: vec![],
            thread,
        }
    }

    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }

    pub fn bridge(&self, id: &str) -> Option<&Bridge> {
        self.bridges.iter().find(|it| it.id() == id)
    }

    pub fn is_bridge(&self, id: &str) -> bool {
        self.bridge(id).is_some()
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Cross-registers `bridge` with every bridge already present and with
    /// every extra source.
    pub fn add_bridge(&mut self, mut bridge: Bridge) -> Void {
        self.thread.check();
        let id = bridge.id();
        if self.is_bridge(&id) {
            bail!("bridge {} already present", id)
        }
        for other in self.bridges.iter_mut() {
            other.add_source(&id)?;
            bridge.add_source(&other.id())?;
        }
        for source in &self.sources {
            bridge.add_source(source)?;
        }
        debug!(bridge = %id, "bridge joined");
        self.bridges.push(bridge);
        Ok(())
    }

    /// Takes a bridge out of the fabric. The caller disposes it.
    pub fn remove_bridge(&mut self, id: &str) -> Option<Bridge> {
        self.thread.check();
        let idx = self.bridges.iter().position(|it| it.id() == id)?;
        let bridge = self.bridges.remove(idx);
        for other in self.bridges.iter_mut() {
            if let Err(err) = other.remove_source(id) {
                warn!(bridge = %other.id(), source = id, error = %err, "remove source failed");
            }
        }
        Some(bridge)
    }

    pub fn take_bridges(&mut self) -> Vec<Bridge> {
        self.thread.check();
        std::mem::take(&mut self.bridges)
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.iter().any(|it| it == source)
    }

    /// Registers a non-bridge source on every bridge.
    pub fn add_source(&mut self, source: &str) {
        self.thread.check();
        if !self.has_source(source) {
            self.sources.push(source.to_string());
        }
        for bridge in self.bridges.iter_mut() {
            if let Err(err) = bridge.add_source(source) {
                warn!(bridge = %bridge.id(), source, error = %err, "add source failed");
            }
        }
    }

    pub fn remove_source(&mut self, source: &str) {
        self.thread.check();
        self.sources.retain(|it| it != source);
        for bridge in self.bridges.iter_mut() {
            if let Err(err) = bridge.remove_source(source) {
                warn!(bridge = %bridge.id(), source, error = %err, "remove source failed");
            }
        }
    }

    pub fn on_client_add_or_change(&mut self, origin: &str, ip_map: &IpDataMap) {
        self.thread.check();
        if ip_map.is_empty() {
            return;
        }
        for bridge in self.bridges.iter_mut() {
            if bridge.id() == origin {
                continue;
            }
            if let Err(err) = bridge.add_or_change_host(origin, ip_map) {
                warn!(bridge = %bridge.id(), source = origin, error = %err, "host update failed");
            }
        }
    }

    pub fn on_client_remove(&mut self, origin: &str, ip_list: &[Ipv4Addr]) {
        self.thread.check();
        if ip_list.is_empty() {
            return;
        }
        for bridge in self.bridges.iter_mut() {
            if bridge.id() == origin {
                continue;
            }
            if let Err(err) = bridge.remove_host(origin, ip_list) {
                warn!(bridge = %bridge.id(), source = origin, error = %err, "host removal failed");
            }
        }
    }

    /// Replaces the host set of `source` on every bridge.
    pub fn refresh(&mut self, source: &str, ip_map: &IpDataMap) {
        self.thread.check();
        for bridge in self.bridges.iter_mut() {
            if let Err(err) = bridge.refresh_host(source, ip_map) {
                warn!(bridge = %bridge.id(), source, error = %err, "host refresh failed");
            }
        }
    }

    /// Rescans the lease file of `bridge_id`, records the result on that
    /// bridge first, then fans it out to the other bridges and `listener`.
    pub fn on_lease_changed(&mut self, bridge_id: &str, listener: &mut dyn HostListener) -> Void {
        self.thread.check();
        let bridge = self
            .bridges
            .iter_mut()
            .find(|it| it.id() == bridge_id)
            .ok_or(anyhow!("unknown bridge {}", bridge_id))?;
        let diff = bridge.lease_changed()?;

        let appeared = diff.appeared();
        let disappeared = diff.disappeared();
        if !appeared.is_empty() {
            self.on_client_add_or_change(bridge_id, &appeared);
        }
        if !disappeared.is_empty() {
            self.on_client_remove(bridge_id, &disappeared);
        }

        // both listener calls run, the first error is returned
        let mut res = Ok(());
        if !appeared.is_empty() {
            res = listener.on_host_appear(bridge_id, &appeared);
        }
        if !disappeared.is_empty() {
            let removed = listener.on_host_disappear(bridge_id, &disappeared);
            if res.is_ok() {
                res = removed;
            }
        }
        res
    }
}
