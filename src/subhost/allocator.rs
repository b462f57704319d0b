use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use std::rc::Rc;

use ipnetwork::Ipv4Network;
use tracing::{info, warn};

use crate::error::Exhausted;
use crate::firewall::Firewall;
use crate::netconf::NetConf;
use crate::prefix::Add;
use crate::prelude::*;
use crate::subhost::{install_subhost_nat, remove_subhost_nat};

const MAX_POOL_SIZE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Bound(Ipv4Addr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubhostSlot {
    pub local: Ipv4Addr,
    pub state: SlotState,
}

/// Spare local addresses on a VPN interface, each one standing in for a
/// foreign client address behind a DNAT/SNAT rule pair.
pub struct SubhostAllocator {
    iface: String,
    slots: Vec<SubhostSlot>,
    firewall: Box<dyn Firewall>,
    net: Rc<dyn NetConf>,
}

impl Debug for SubhostAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubhostAllocator")
            .field("iface", &self.iface)
            .field("slots", &self.slots)
            .finish()
    }
}

fn host_addr(ip: Ipv4Addr) -> Prefix {
    Ipv4Network::from(ip)
}

impl SubhostAllocator {
    /// `start..=end` in address order is also the bind order.
    pub fn new(
        iface: &str,
        start: Ipv4Addr,
        end: Ipv4Addr,
        firewall: Box<dyn Firewall>,
        net: Rc<dyn NetConf>,
    ) -> Res<Self> {
        let (s, e) = (u32::from(start), u32::from(end));
        if e < s {
            bail!("invalid subhost range: end ({}) must be >= start ({})", end, start)
        }
        if e - s >= MAX_POOL_SIZE {
            bail!("subhost range {}-{} is too large", start, end)
        }
        let slots = (0..=e - s)
            .map(|i| SubhostSlot {
                local: start.add(i),
                state: SlotState::Free,
            })
            .collect();
        Ok(Self {
            iface: iface.to_string(),
            slots,
            firewall,
            net,
        })
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn slots(&self) -> &[SubhostSlot] {
        &self.slots
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn bound_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|it| it.state != SlotState::Free)
            .count()
    }

    pub fn local_of(&self, foreign: Ipv4Addr) -> Option<Ipv4Addr> {
        self.slots
            .iter()
            .find(|it| it.state == SlotState::Bound(foreign))
            .map(|it| it.local)
    }

    /// Binds `foreign` to the first free slot. A foreign address that is
    /// already bound keeps its slot. Fails with [`Exhausted::Subhost`] when
    /// every slot is taken, leaving existing bindings untouched.
    pub fn bind(&mut self, foreign: Ipv4Addr) -> Res<Ipv4Addr> {
        if let Some(local) = self.local_of(foreign) {
            return Ok(local);
        }
        let idx = self
            .slots
            .iter()
            .position(|it| it.state == SlotState::Free)
            .ok_or(Exhausted::Subhost)?;
        let local = self.slots[idx].local;

        self.net.add_addr(&self.iface, host_addr(local))?;
        if let Err(err) = install_subhost_nat(self.firewall.as_mut(), &self.iface, foreign, local) {
            // leave nothing half-installed behind
            remove_subhost_nat(self.firewall.as_mut(), &self.iface, foreign, local);
            if let Err(err) = self.net.del_addr(&self.iface, host_addr(local)) {
                warn!(%local, iface = %self.iface, error = %err, "subhost address removal failed");
            }
            return Err(err);
        }
        self.slots[idx].state = SlotState::Bound(foreign);
        info!(%foreign, %local, iface = %self.iface, "subhost bound");
        Ok(local)
    }

    /// Frees the slot of `local` and returns the foreign address it held.
    /// Firewall or address removal failures are logged only; the slot is
    /// freed regardless.
    pub fn unbind(&mut self, local: Ipv4Addr) -> Option<Ipv4Addr> {
        let slot = self.slots.iter_mut().find(|it| it.local == local)?;
        let SlotState::Bound(foreign) = slot.state else {
            return None;
        };
        slot.state = SlotState::Free;

        remove_subhost_nat(self.firewall.as_mut(), &self.iface, foreign, local);
        if let Err(err) = self.net.del_addr(&self.iface, host_addr(local)) {
            warn!(%local, iface = %self.iface, error = %err, "subhost address removal failed");
        }
        info!(%foreign, %local, iface = %self.iface, "subhost released");
        Some(foreign)
    }

    /// Same as [`Self::unbind`], looked up by the foreign address.
    pub fn unbind_foreign(&mut self, foreign: Ipv4Addr) -> Option<Ipv4Addr> {
        let local = self.local_of(foreign)?;
        self.unbind(local);
        Some(local)
    }

    /// Releases every bound slot, returning their local addresses.
    pub fn release_all(&mut self) -> Vec<Ipv4Addr> {
        let bound = self
            .slots
            .iter()
            .filter(|it| it.state != SlotState::Free)
            .map(|it| it.local)
            .collect::<Vec<_>>();
        for local in &bound {
            self.unbind(*local);
        }
        bound
    }
}
