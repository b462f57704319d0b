use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::netconf::NetConf;
use crate::prelude::*;
use crate::util::execute;

const IP: &str = "/sbin/ip";
const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

/// Linux links and addresses through iproute2.
#[derive(Debug, Clone)]
pub struct IpRoute {
    program: String,
    ip_forward: PathBuf,
}

impl Default for IpRoute {
    fn default() -> Self {
        Self {
            program: IP.to_string(),
            ip_forward: PathBuf::from(IP_FORWARD),
        }
    }
}

impl IpRoute {
    fn ip(&self, args: &[&str]) -> Void {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        debug!(?args, "ip");
        execute(&mut cmd)?;
        Ok(())
    }
}

fn addr_arg(addr: Prefix) -> String {
    format!("{}/{}", addr.ip(), addr.prefix())
}

impl NetConf for IpRoute {
    fn create_bridge(&self, name: &str) -> Void {
        self.ip(&["link", "add", "name", name, "type", "bridge"])
    }

    fn delete_link(&self, name: &str) -> Void {
        self.ip(&["link", "del", "dev", name])
    }

    fn set_link_up(&self, name: &str, up: bool) -> Void {
        self.ip(&["link", "set", "dev", name, if up { "up" } else { "down" }])
    }

    fn add_addr(&self, name: &str, addr: Prefix) -> Void {
        let broadcast = addr.broadcast().to_string();
        self.ip(&["addr", "add", &addr_arg(addr), "broadcast", &broadcast, "dev", name])
    }

    fn del_addr(&self, name: &str, addr: Prefix) -> Void {
        self.ip(&["addr", "del", &addr_arg(addr), "dev", name])
    }

    fn set_ip_forward(&self, enable: bool) -> Void {
        std::fs::write(&self.ip_forward, if enable { "1" } else { "0" })
            .with_context(|| format!("writing {}", self.ip_forward.display()))
    }
}
