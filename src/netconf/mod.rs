mod iproute;

pub use iproute::*;

use crate::prelude::*;

/// OS network configuration used for bridge lifecycle and subhost address
/// binding.
pub trait NetConf {
    fn create_bridge(&self, name: &str) -> Void;
    fn delete_link(&self, name: &str) -> Void;
    fn set_link_up(&self, name: &str, up: bool) -> Void;
    /// Adds `addr` (address plus prefix length) with its broadcast address.
    fn add_addr(&self, name: &str, addr: Prefix) -> Void;
    fn del_addr(&self, name: &str, addr: Prefix) -> Void;
    fn set_ip_forward(&self, enable: bool) -> Void;
}
