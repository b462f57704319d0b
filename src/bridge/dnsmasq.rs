use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::prelude::*;

const DNSMASQ: &str = "/usr/sbin/dnsmasq";
const LEASE_TIME_SECS: u32 = 360;
// dnsmasq defaults T1 to 165s, RFC 2131 wants half the lease time
const RENEWAL_T1_SECS: u32 = 180;

/// The DHCP/DNS service driven by a bridge. It must pick up changed host
/// files on `reload` without dropping its leases.
pub trait HostService {
    fn reload(&mut self) -> Void;
    fn stop(&mut self) -> Void;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsmasqConfig {
    pub interface: String,
    pub dhcp_range: (Ipv4Addr, Ipv4Addr),
    pub netmask: Ipv4Addr,
    pub lease_file: PathBuf,
    pub upstream_dns_port: u16,
    pub hosts_dir: PathBuf,
    pub myhostname_file: PathBuf,
}

impl DnsmasqConfig {
    pub fn render(&self) -> String {
        let lines = [
            "strict-order".to_string(),
            "bind-interfaces".to_string(),
            format!("interface=lo,{}", self.interface),
            "user=root".to_string(),
            "group=root".to_string(),
            String::new(),
            "dhcp-authoritative".to_string(),
            format!(
                "dhcp-range={},{},{},{}",
                self.dhcp_range.0, self.dhcp_range.1, self.netmask, LEASE_TIME_SECS
            ),
            format!("dhcp-option=option:T1,{}", RENEWAL_T1_SECS),
            format!("dhcp-leasefile={}", self.lease_file.display()),
            String::new(),
            "domain-needed".to_string(),
            "bogus-priv".to_string(),
            "no-hosts".to_string(),
            format!("server=127.0.0.1#{}", self.upstream_dns_port),
            // addn-hosts instead of hostsdir: hostsdir never drops records
            format!("addn-hosts={}", self.hosts_dir.display()),
            format!("addn-hosts={}", self.myhostname_file.display()),
        ];
        let mut buf = String::new();
        for line in lines {
            buf.push_str(&line);
            buf.push('\n');
        }
        buf
    }
}

/// Starts the service for a bridge once its config file is written.
pub trait ServiceLauncher {
    fn launch(&self, conf_file: &Path, pid_file: &Path) -> Res<Box<dyn HostService>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DnsmasqLauncher;

impl ServiceLauncher for DnsmasqLauncher {
    fn launch(&self, conf_file: &Path, pid_file: &Path) -> Res<Box<dyn HostService>> {
        Ok(Box::new(Dnsmasq::start(conf_file, pid_file)?))
    }
}

/// A running dnsmasq in the foreground, reloaded with SIGHUP.
#[derive(Debug)]
pub struct Dnsmasq {
    child: Option<Child>,
}

impl Dnsmasq {
    pub fn start(conf_file: &Path, pid_file: &Path) -> Res<Self> {
        let child = Command::new(DNSMASQ)
            .arg("--keep-in-foreground")
            .arg(format!("--conf-file={}", conf_file.display()))
            .arg(format!("--pid-file={}", pid_file.display()))
            .spawn()
            .with_context(|| format!("spawning {}", DNSMASQ))?;
        info!(pid = child.id(), conf = %conf_file.display(), "dnsmasq started");
        Ok(Self { child: Some(child) })
    }

    fn signal(&self, sig: Signal) -> Void {
        let child = self.child.as_ref().ok_or(anyhow!("dnsmasq is not running"))?;
        kill(Pid::from_raw(child.id() as i32), sig)?;
        Ok(())
    }
}

impl HostService for Dnsmasq {
    fn reload(&mut self) -> Void {
        self.signal(Signal::SIGHUP)
    }

    fn stop(&mut self) -> Void {
        if self.child.is_none() {
            return Ok(());
        }
        if let Err(err) = self.signal(Signal::SIGTERM) {
            warn!(error = %err, "terminating dnsmasq failed");
        }
        if let Some(mut child) = self.child.take() {
            child.wait()?;
        }
        Ok(())
    }
}
