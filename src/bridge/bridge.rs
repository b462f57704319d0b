use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use tracing::{error, info, warn};

use crate::bridge::{
    read_host_file, write_host_file, DnsmasqConfig, HostService, HostSet, ServiceLauncher,
};
use crate::daemon::LoopThread;
use crate::lease::{LeaseDiff, LeaseReconciler};
use crate::netconf::NetConf;
use crate::prefix::{normalize, Add};
use crate::prelude::*;
use crate::util::{ensure_dir, force_delete, write_atomic};

/// Source holding the bridge's own DHCP clients.
pub const LOCAL_SOURCE: &str = "dnsmasq";

const BRIDGE_MASK_LEN: u8 = 24;
const DHCP_POOL_SIZE: u32 = 49;
const SUBHOST_BLOCK_OFFSET: u32 = 51;
const SUBHOST_BLOCK_SIZE: u32 = 50;

#[derive(Debug, Clone)]
pub struct BridgeParams {
    pub name: String,
    pub prefix: Prefix,
    pub l2_dns_port: u16,
    pub tmp_dir: PathBuf,
}

impl BridgeParams {
    fn hosts_dir(&self) -> PathBuf {
        self.tmp_dir.join("hosts.d")
    }

    fn lease_file(&self) -> PathBuf {
        self.tmp_dir.join("dnsmasq.leases")
    }

    fn myhostname_file(&self) -> PathBuf {
        self.tmp_dir.join("dnsmasq.myhostname")
    }

    fn pid_file(&self) -> PathBuf {
        self.tmp_dir.join("dnsmasq.pid")
    }

    fn conf_file(&self) -> PathBuf {
        self.tmp_dir.join("dnsmasq.conf")
    }
}

/// One local network segment: a bridge interface, its DHCP/DNS service and
/// one host file per source.
pub struct Bridge {
    params: BridgeParams,
    ip: Ipv4Addr,
    service: Box<dyn HostService>,
    reconciler: LeaseReconciler,
    thread: LoopThread,
}

impl Debug for Bridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.params.name)
            .field("prefix", &self.params.prefix)
            .finish()
    }
}

fn source_file_name(source: &str) -> Res<&str> {
    if source.is_empty() || source.starts_with('.') || source.contains('/') {
        bail!("invalid source id \"{}\"", source)
    }
    Ok(source)
}

impl Bridge {
    /// Builds the bridge state around an already running service. The
    /// hosts directory is created and the local lease source registered.
    pub fn with_service(
        mut params: BridgeParams,
        service: Box<dyn HostService>,
        thread: LoopThread,
    ) -> Res<Self> {
        if params.prefix.prefix() != BRIDGE_MASK_LEN {
            bail!("bridge prefix {} must be a /{}", params.prefix, BRIDGE_MASK_LEN)
        }
        params.prefix = normalize(params.prefix);
        ensure_dir(&params.hosts_dir())?;
        let ip = params.prefix.network().add(1);
        let reconciler = LeaseReconciler::new(&params.lease_file());
        let mut bridge = Self {
            params,
            ip,
            service,
            reconciler,
            thread,
        };
        bridge.add_source(LOCAL_SOURCE)?;
        Ok(bridge)
    }

    /// Creates the interface, writes the dnsmasq artifacts and starts it.
    pub fn start(
        params: BridgeParams,
        net: &dyn NetConf,
        launcher: &dyn ServiceLauncher,
        thread: LoopThread,
    ) -> Res<Self> {
        thread.check();
        if params.prefix.prefix() != BRIDGE_MASK_LEN {
            bail!("bridge prefix {} must be a /{}", params.prefix, BRIDGE_MASK_LEN)
        }
        let network = normalize(params.prefix);
        let ip = network.network().add(1);

        net.create_bridge(&params.name)?;
        let res = Self::start_inner(params.clone(), network, ip, net, launcher, thread);
        if res.is_err() {
            if let Err(err) = net.delete_link(&params.name) {
                warn!(bridge = %params.name, error = %err, "deleting bridge link failed");
            }
            if let Err(err) = Self::remove_artifacts(&params) {
                warn!(bridge = %params.name, error = %err, "removing dnsmasq artifacts failed");
            }
        }
        res
    }

    fn start_inner(
        params: BridgeParams,
        network: Ipv4Network,
        ip: Ipv4Addr,
        net: &dyn NetConf,
        launcher: &dyn ServiceLauncher,
        thread: LoopThread,
    ) -> Res<Self> {
        net.set_link_up(&params.name, true)?;
        net.add_addr(&params.name, Ipv4Network::new(ip, network.prefix())?)?;

        let hostname = nix::unistd::gethostname()?;
        write_atomic(
            &params.myhostname_file(),
            &format!("{} {}\n", ip, hostname.to_string_lossy()),
        )?;
        ensure_dir(&params.hosts_dir())?;
        std::fs::write(params.lease_file(), "")?;

        let cfg = DnsmasqConfig {
            interface: params.name.clone(),
            dhcp_range: (ip.add(1), ip.add(DHCP_POOL_SIZE)),
            netmask: network.mask(),
            lease_file: params.lease_file(),
            upstream_dns_port: params.l2_dns_port,
            hosts_dir: params.hosts_dir(),
            myhostname_file: params.myhostname_file(),
        };
        write_atomic(&params.conf_file(), &cfg.render())?;
        let service = launcher.launch(&params.conf_file(), &params.pid_file())?;

        let bridge = Self::with_service(params, service, thread)?;
        info!(name = %bridge.params.name, prefix = %bridge.params.prefix, "bridge started");
        Ok(bridge)
    }

    fn remove_artifacts(params: &BridgeParams) -> Void {
        force_delete(&params.pid_file())?;
        force_delete(&params.lease_file())?;
        force_delete(&params.hosts_dir())?;
        force_delete(&params.myhostname_file())?;
        force_delete(&params.conf_file())?;
        Ok(())
    }

    /// Stops the service, removes every generated file and the interface.
    /// Each step runs even when an earlier one failed.
    pub fn dispose(mut self, net: &dyn NetConf) {
        self.thread.check();
        if let Err(err) = self.service.stop() {
            warn!(name = %self.params.name, error = %err, "stopping dns service failed");
        }
        if let Err(err) = Self::remove_artifacts(&self.params) {
            warn!(name = %self.params.name, error = %err, "removing bridge files failed");
        }
        if let Err(err) = net.set_link_up(&self.params.name, false) {
            warn!(name = %self.params.name, error = %err, "bringing bridge down failed");
        }
        if let Err(err) = net.delete_link(&self.params.name) {
            warn!(name = %self.params.name, error = %err, "deleting bridge failed");
        }
        info!(name = %self.params.name, "bridge destroyed");
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn id(&self) -> String {
        format!("bridge-{}", self.ip)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn prefix(&self) -> Prefix {
        self.params.prefix
    }

    pub fn lease_file(&self) -> PathBuf {
        self.params.lease_file()
    }

    pub fn dhcp_range(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.ip.add(1), self.ip.add(DHCP_POOL_SIZE))
    }

    /// Blocks of 50 addresses above the DHCP range, handed to downstream
    /// routers for their subhosts.
    pub fn subhost_ip_ranges(&self) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        let mut ranges = vec![];
        let mut i = SUBHOST_BLOCK_OFFSET;
        while i + SUBHOST_BLOCK_SIZE - 1 < 255 {
            ranges.push((self.ip.add(i), self.ip.add(i + SUBHOST_BLOCK_SIZE - 1)));
            i += SUBHOST_BLOCK_SIZE;
        }
        ranges
    }

    fn source_path(&self, source: &str) -> Res<PathBuf> {
        Ok(self.params.hosts_dir().join(source_file_name(source)?))
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.source_path(source).map(|it| it.exists()).unwrap_or(false)
    }

    pub fn host_set(&self, source: &str) -> Res<HostSet> {
        read_host_file(&self.source_path(source)?)
    }

    /// Creates an empty host file for `source`. An existing one is kept.
    pub fn add_source(&mut self, source: &str) -> Void {
        self.thread.check();
        let path = self.source_path(source)?;
        if path.exists() {
            return Ok(());
        }
        write_host_file(&path, &HostSet::new())
    }

    /// Deletes the host file of `source`; reloads only if it held hosts.
    pub fn remove_source(&mut self, source: &str) -> Void {
        self.thread.check();
        let path = self.source_path(source)?;
        let had_hosts = match read_host_file(&path) {
            Ok(set) => !set.is_empty(),
            Err(_) if !path.exists() => return Ok(()),
            Err(_) => true,
        };
        force_delete(&path)?;
        if had_hosts {
            self.service.reload()?;
        }
        Ok(())
    }

    /// Applies `f` to the host set of `source`; the file is rewritten and
    /// the service reloaded only when the set really changed.
    fn update<F>(&mut self, source: &str, f: F) -> Res<bool>
    where
        F: FnOnce(&mut HostSet),
    {
        let path = self.source_path(source)?;
        let cur = read_host_file(&path)?;
        let mut next = cur.clone();
        f(&mut next);
        if next == cur {
            return Ok(false);
        }
        write_host_file(&path, &next)?;
        self.service.reload()?;
        Ok(true)
    }

    /// Merges `ip_map` into the source's set. Only the hostname is kept;
    /// an entry without one replaces any previous name with an unnamed
    /// entry. Addresses not in `ip_map` are left alone.
    pub fn add_or_change_host(&mut self, source: &str, ip_map: &IpDataMap) -> Res<bool> {
        self.thread.check();
        self.update(source, |set| {
            for (ip, data) in ip_map {
                set.insert(*ip, data.hostname.clone());
            }
        })
    }

    pub fn remove_host(&mut self, source: &str, ip_list: &[Ipv4Addr]) -> Res<bool> {
        self.thread.check();
        self.update(source, |set| {
            for ip in ip_list {
                set.remove(ip);
            }
        })
    }

    /// Replaces the whole set of `source` with the named entries of `ip_map`.
    pub fn refresh_host(&mut self, source: &str, ip_map: &IpDataMap) -> Res<bool> {
        self.thread.check();
        self.update(source, |set| {
            *set = ip_map
                .iter()
                .filter_map(|(ip, data)| data.hostname.clone().map(|h| (*ip, Some(h))))
                .collect();
        })
    }

    /// Rescans the lease file and records the result in the local source.
    /// The returned diff is what the other bridges still have to learn.
    pub fn lease_changed(&mut self) -> Res<LeaseDiff> {
        self.thread.check();
        let diff = self.reconciler.scan()?;
        let appeared = diff.appeared();
        if !appeared.is_empty() {
            if let Err(err) = self.add_or_change_host(LOCAL_SOURCE, &appeared) {
                error!(bridge = %self.id(), error = %err, "recording leases failed");
            }
        }
        let disappeared = diff.disappeared();
        if !disappeared.is_empty() {
            if let Err(err) = self.remove_host(LOCAL_SOURCE, &disappeared) {
                error!(bridge = %self.id(), error = %err, "recording leases failed");
            }
        }
        Ok(diff)
    }

    pub fn lease_path(&self) -> &Path {
        self.reconciler.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_bridge, FakeLauncher, FakeNetConf, NetOp};

    fn named(entries: &[(&str, &str)]) -> IpDataMap {
        entries
            .iter()
            .map(|(ip, h)| (ip.parse().unwrap(), HostData::named(h)))
            .collect()
    }

    #[test]
    fn test_addressing() {
        let (_dir, bridge, _reloads) = test_bridge("10.0.0.0/24");
        assert_eq!(bridge.id(), "bridge-10.0.0.1");
        assert_eq!(bridge.ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            bridge.dhcp_range(),
            (Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 50))
        );
        assert_eq!(
            bridge.subhost_ip_ranges(),
            vec![
                (Ipv4Addr::new(10, 0, 0, 52), Ipv4Addr::new(10, 0, 0, 101)),
                (Ipv4Addr::new(10, 0, 0, 102), Ipv4Addr::new(10, 0, 0, 151)),
                (Ipv4Addr::new(10, 0, 0, 152), Ipv4Addr::new(10, 0, 0, 201)),
                (Ipv4Addr::new(10, 0, 0, 202), Ipv4Addr::new(10, 0, 0, 251)),
            ]
        );
    }

    fn params(dir: &Path) -> BridgeParams {
        BridgeParams {
            name: "wrtd-br".into(),
            prefix: "10.0.3.0/24".parse().unwrap(),
            l2_dns_port: 5353,
            tmp_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_start_writes_artifacts() -> Void {
        let dir = tempfile::tempdir()?;
        let net = FakeNetConf::default();
        let launcher = FakeLauncher::default();
        let bridge = Bridge::start(params(dir.path()), &net, &launcher, LoopThread::current())?;
        assert_eq!(
            net.ops(),
            vec![
                NetOp::CreateBridge("wrtd-br".into()),
                NetOp::LinkUp("wrtd-br".into(), true),
                NetOp::AddAddr("wrtd-br".into(), "10.0.3.1/24".parse()?),
            ]
        );
        let conf = std::fs::read_to_string(dir.path().join("dnsmasq.conf"))?;
        assert!(conf.contains("interface=lo,wrtd-br\n"));
        assert!(conf.contains("dhcp-range=10.0.3.2,10.0.3.50,255.255.255.0,360\n"));
        let myhostname = std::fs::read_to_string(dir.path().join("dnsmasq.myhostname"))?;
        assert!(myhostname.starts_with("10.0.3.1 "));
        assert!(bridge.lease_file().exists());
        assert_eq!(launcher.launched(), 1);
        Ok(())
    }

    #[test]
    fn test_start_failure_rolls_back() -> Void {
        let dir = tempfile::tempdir()?;
        let net = FakeNetConf::default();
        let launcher = FakeLauncher::failing();
        assert!(Bridge::start(params(dir.path()), &net, &launcher, LoopThread::current()).is_err());
        assert_eq!(net.ops().last(), Some(&NetOp::DeleteLink("wrtd-br".into())));
        assert!(!dir.path().join("dnsmasq.conf").exists());
        assert!(!dir.path().join("hosts.d").exists());
        Ok(())
    }

    #[test]
    fn test_rejects_non_24() {
        let dir = tempfile::tempdir().unwrap();
        let params = BridgeParams {
            name: "br0".into(),
            prefix: "10.0.0.0/16".parse().unwrap(),
            l2_dns_port: 5353,
            tmp_dir: dir.path().to_path_buf(),
        };
        let service = crate::testutil::FakeService::default();
        assert!(Bridge::with_service(params, Box::new(service), LoopThread::current()).is_err());
    }

    #[test]
    fn test_source_lifecycle() -> Void {
        let (_dir, mut bridge, reloads) = test_bridge("10.0.0.0/24");
        assert!(bridge.has_source(LOCAL_SOURCE));
        bridge.add_source("bridge-10.0.1.1")?;
        bridge.add_or_change_host("bridge-10.0.1.1", &named(&[("10.0.1.5", "tv")]))?;
        // a second add keeps the content
        bridge.add_source("bridge-10.0.1.1")?;
        assert_eq!(bridge.host_set("bridge-10.0.1.1")?.len(), 1);
        assert_eq!(reloads.get(), 1);

        bridge.remove_source("bridge-10.0.1.1")?;
        assert!(!bridge.has_source("bridge-10.0.1.1"));
        assert_eq!(reloads.get(), 2);
        // double remove is harmless and empty removal does not reload
        bridge.remove_source("bridge-10.0.1.1")?;
        bridge.add_source("upstream-vpn")?;
        bridge.remove_source("upstream-vpn")?;
        assert_eq!(reloads.get(), 2);

        assert!(bridge.add_source("../etc").is_err());
        assert!(bridge.add_or_change_host("unknown", &named(&[("10.0.1.5", "tv")])).is_err());
        Ok(())
    }

    #[test]
    fn test_merge_idempotent() -> Void {
        let (_dir, mut bridge, reloads) = test_bridge("10.0.0.0/24");
        bridge.add_source("s")?;
        let m = named(&[("10.0.1.5", "tv")]);
        assert!(bridge.add_or_change_host("s", &m)?);
        assert!(!bridge.add_or_change_host("s", &m)?);
        assert!(!bridge.add_or_change_host("s", &m)?);
        assert_eq!(reloads.get(), 1);

        // other entries survive a merge
        bridge.add_or_change_host("s", &named(&[("10.0.1.6", "nas")]))?;
        assert_eq!(bridge.host_set("s")?.len(), 2);

        // losing the hostname keeps the host, unnamed
        let mut unnamed = IpDataMap::new();
        unnamed.insert("10.0.1.5".parse().unwrap(), HostData::default());
        assert!(bridge.add_or_change_host("s", &unnamed)?);
        assert_eq!(bridge.host_set("s")?[&"10.0.1.5".parse().unwrap()], None);
        assert_eq!(reloads.get(), 3);
        Ok(())
    }

    #[test]
    fn test_remove_host() -> Void {
        let (_dir, mut bridge, reloads) = test_bridge("10.0.0.0/24");
        bridge.add_source("s")?;
        bridge.add_or_change_host("s", &named(&[("10.0.1.5", "tv"), ("10.0.1.6", "nas")]))?;
        assert!(bridge.remove_host("s", &["10.0.1.5".parse().unwrap()])?);
        assert!(!bridge.remove_host("s", &["10.0.1.99".parse().unwrap()])?);
        assert_eq!(reloads.get(), 2);
        assert_eq!(bridge.host_set("s")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_refresh_replaces() -> Void {
        let (_dir, mut bridge, reloads) = test_bridge("10.0.0.0/24");
        bridge.add_source("upstream-vpn")?;
        bridge.add_or_change_host("upstream-vpn", &named(&[("10.9.9.9", "stale")]))?;

        let mut m = named(&[("10.2.2.9", "phone")]);
        m.insert("10.2.2.10".parse().unwrap(), HostData::default());
        assert!(bridge.refresh_host("upstream-vpn", &m)?);
        assert!(!bridge.refresh_host("upstream-vpn", &m)?);
        assert_eq!(reloads.get(), 2);

        let set = bridge.host_set("upstream-vpn")?;
        assert_eq!(set.len(), 1);
        assert_eq!(set[&"10.2.2.9".parse().unwrap()].as_deref(), Some("phone"));
        Ok(())
    }

    #[test]
    fn test_lease_scenario() -> Void {
        let (_dir, mut bridge, reloads) = test_bridge("10.0.0.0/24");
        let ip: Ipv4Addr = "10.0.0.51".parse().unwrap();

        std::fs::write(bridge.lease_path(), "1700000000 aa:bb 10.0.0.51 laptop *\n")?;
        let d = bridge.lease_changed()?;
        assert_eq!(d.added.len(), 1);
        assert_eq!(bridge.host_set(LOCAL_SOURCE)?[&ip].as_deref(), Some("laptop"));
        assert_eq!(reloads.get(), 1);

        let d = bridge.lease_changed()?;
        assert!(d.is_empty());
        assert_eq!(reloads.get(), 1);

        std::fs::write(bridge.lease_path(), "")?;
        let d = bridge.lease_changed()?;
        assert_eq!(d.disappeared(), vec![ip]);
        assert!(bridge.host_set(LOCAL_SOURCE)?.is_empty());
        assert_eq!(reloads.get(), 2);
        Ok(())
    }

    #[test]
    fn test_failed_reload_is_reported() -> Void {
        let (_dir, mut bridge, reloads) = test_bridge("10.0.0.0/24");
        bridge.add_source("s")?;
        reloads.fail_next();
        assert!(bridge.add_or_change_host("s", &named(&[("10.0.1.5", "tv")])).is_err());
        // the file was durably written before the reload was attempted
        assert_eq!(bridge.host_set("s")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_dispose_cleans_up() -> Void {
        let (dir, bridge, reloads) = test_bridge("10.0.0.0/24");
        let net = FakeNetConf::default();
        let hosts_dir = dir.path().join("hosts.d");
        assert!(hosts_dir.exists());
        bridge.dispose(&net);
        assert!(!hosts_dir.exists());
        assert!(reloads.stopped());
        assert_eq!(
            net.ops(),
            vec![
                NetOp::LinkUp("br-test".into(), false),
                NetOp::DeleteLink("br-test".into()),
            ]
        );
        Ok(())
    }
}
