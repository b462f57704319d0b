//! Recording stand-ins for the collaborators the daemon drives.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tempfile::TempDir;

use crate::bridge::{Bridge, BridgeParams, HostService, ServiceLauncher};
use crate::cascade::{CascadeApiClient, CascadeConnector, CascadeInit};
use crate::config::Params;
use crate::daemon::{Context, EventSender, LoopThread};
use crate::fabric::HostListener;
use crate::firewall::Firewall;
use crate::netconf::NetConf;
use crate::plugin::{LanInterface, VpnClient, VpnServer, WanConnection};
use crate::prefix::PrefixPool;
use crate::prelude::*;

#[derive(Debug, Default)]
struct FirewallState {
    rules: Vec<(String, String, u64)>,
    next_handle: u64,
    reject: Option<String>,
}

/// Keeps rules in memory and lists them the way `nft -a` prints them.
#[derive(Debug, Default, Clone)]
pub struct FakeFirewall {
    state: Rc<RefCell<FirewallState>>,
}

fn nft_style(rule: &str) -> String {
    let mut out = vec![];
    let mut quote_next = false;
    for tok in rule.split_whitespace() {
        if quote_next {
            out.push(format!("\"{}\"", tok));
            quote_next = false;
            continue;
        }
        match tok {
            "iif" | "oif" => {
                out.push(tok.to_string());
                quote_next = true;
            }
            "dnat" | "snat" => out.push(format!("{} to", tok)),
            _ => out.push(tok.to_string()),
        }
    }
    out.join(" ")
}

impl FakeFirewall {
    pub fn rules(&self) -> Vec<(String, String)> {
        self.state
            .borrow()
            .rules
            .iter()
            .map(|(chain, rule, _)| (chain.clone(), rule.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.state.borrow_mut().rules.clear();
    }

    /// Every later `add_rule` whose text contains `pattern` fails.
    pub fn fail_rules_matching(&self, pattern: &str) {
        self.state.borrow_mut().reject = Some(pattern.to_string());
    }
}

impl Firewall for FakeFirewall {
    fn add_rule(&mut self, chain: &str, rule: &str) -> Void {
        let mut state = self.state.borrow_mut();
        if matches!(&state.reject, Some(p) if rule.contains(p.as_str())) {
            bail!("rule rejected: {}", rule)
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.rules.push((chain.to_string(), rule.to_string(), handle));
        Ok(())
    }

    fn list_rules(&mut self) -> Res<String> {
        let state = self.state.borrow();
        let mut chains: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (chain, rule, handle) in &state.rules {
            chains
                .entry(chain.as_str())
                .or_default()
                .push(format!("\t\t{} # handle {}", nft_style(rule), handle));
        }
        let mut out = String::from("table ip wrtd {\n");
        for (chain, lines) in chains {
            out.push_str(&format!("\tchain {} {{\n", chain));
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
            out.push_str("\t}\n");
        }
        out.push_str("}\n");
        Ok(out)
    }

    fn delete_rule(&mut self, chain: &str, handle: u64) -> Void {
        let mut state = self.state.borrow_mut();
        let before = state.rules.len();
        state.rules.retain(|(c, _, h)| !(c == chain && *h == handle));
        if state.rules.len() == before {
            bail!("no rule {} in chain {}", handle, chain)
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetOp {
    CreateBridge(String),
    DeleteLink(String),
    LinkUp(String, bool),
    AddAddr(String, Prefix),
    DelAddr(String, Prefix),
    IpForward(bool),
}

#[derive(Debug, Default)]
pub struct FakeNetConf {
    ops: RefCell<Vec<NetOp>>,
    addrs: RefCell<BTreeMap<String, Vec<Prefix>>>,
}

impl FakeNetConf {
    pub fn ops(&self) -> Vec<NetOp> {
        self.ops.borrow().clone()
    }

    pub fn addrs(&self, iface: &str) -> Vec<Prefix> {
        self.addrs.borrow().get(iface).cloned().unwrap_or_default()
    }
}

impl NetConf for FakeNetConf {
    fn create_bridge(&self, name: &str) -> Void {
        self.ops.borrow_mut().push(NetOp::CreateBridge(name.into()));
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Void {
        self.ops.borrow_mut().push(NetOp::DeleteLink(name.into()));
        self.addrs.borrow_mut().remove(name);
        Ok(())
    }

    fn set_link_up(&self, name: &str, up: bool) -> Void {
        self.ops.borrow_mut().push(NetOp::LinkUp(name.into(), up));
        Ok(())
    }

    fn add_addr(&self, name: &str, addr: Prefix) -> Void {
        self.ops.borrow_mut().push(NetOp::AddAddr(name.into(), addr));
        self.addrs.borrow_mut().entry(name.into()).or_default().push(addr);
        Ok(())
    }

    fn del_addr(&self, name: &str, addr: Prefix) -> Void {
        self.ops.borrow_mut().push(NetOp::DelAddr(name.into(), addr));
        if let Some(list) = self.addrs.borrow_mut().get_mut(name) {
            list.retain(|it| *it != addr);
        }
        Ok(())
    }

    fn set_ip_forward(&self, enable: bool) -> Void {
        self.ops.borrow_mut().push(NetOp::IpForward(enable));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    reloads: Cell<usize>,
    fail_next: Cell<bool>,
    stopped: Cell<bool>,
}

/// Counts reloads instead of signalling a process.
#[derive(Debug, Default, Clone)]
pub struct FakeService {
    state: Rc<ServiceState>,
}

impl FakeService {
    pub fn get(&self) -> usize {
        self.state.reloads.get()
    }

    pub fn fail_next(&self) {
        self.state.fail_next.set(true);
    }

    pub fn stopped(&self) -> bool {
        self.state.stopped.get()
    }
}

impl HostService for FakeService {
    fn reload(&mut self) -> Void {
        if self.state.fail_next.replace(false) {
            bail!("signal delivery failed")
        }
        self.state.reloads.set(self.state.reloads.get() + 1);
        Ok(())
    }

    fn stop(&mut self) -> Void {
        self.state.stopped.set(true);
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeLauncher {
    launched: Rc<Cell<usize>>,
    fail: bool,
}

impl FakeLauncher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn launched(&self) -> usize {
        self.launched.get()
    }
}

impl ServiceLauncher for FakeLauncher {
    fn launch(&self, _conf_file: &Path, _pid_file: &Path) -> Res<Box<dyn HostService>> {
        if self.fail {
            bail!("dnsmasq not installed")
        }
        self.launched.set(self.launched.get() + 1);
        Ok(Box::new(FakeService::default()))
    }
}

/// A bridge over a temporary directory whose service only counts reloads.
pub fn test_bridge(prefix: &str) -> (TempDir, Bridge, FakeService) {
    let dir = tempfile::tempdir().unwrap();
    let params = BridgeParams {
        name: "br-test".into(),
        prefix: prefix.parse().unwrap(),
        l2_dns_port: 5353,
        tmp_dir: dir.path().to_path_buf(),
    };
    let service = FakeService::default();
    let bridge =
        Bridge::with_service(params, Box::new(service.clone()), LoopThread::current()).unwrap();
    (dir, bridge, service)
}

fn params_in(dir: &Path) -> Params {
    Params {
        etc_dir: dir.join("etc"),
        tmp_dir: dir.join("tmp"),
        var_dir: dir.join("var"),
        uuid: "test-router".into(),
        cascade_api_port: 2220,
        l2_nameserver_port: 5353,
        resolv_conf: dir.join("resolv.conf"),
    }
}

pub fn test_context() -> Context {
    test_context_in(&PathBuf::from("/nonexistent"))
}

pub fn test_context_in(dir: &Path) -> Context {
    Context::new(
        params_in(dir),
        PrefixPool::default(),
        Rc::new(FakeNetConf::default()),
        Rc::new(FakeLauncher::default()),
    )
}

/// Records every call. A failing listener records and then errors, like an
/// upstream that dropped the request.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub appeared: Vec<(String, IpDataMap)>,
    pub disappeared: Vec<(String, Vec<Ipv4Addr>)>,
    fail: bool,
}

impl RecordingListener {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

impl HostListener for RecordingListener {
    fn on_host_appear(&mut self, origin: &str, ip_map: &IpDataMap) -> Void {
        self.appeared.push((origin.to_string(), ip_map.clone()));
        if self.fail {
            bail!("upstream rejected add_subhost")
        }
        Ok(())
    }

    fn on_host_disappear(&mut self, origin: &str, ip_list: &[Ipv4Addr]) -> Void {
        self.disappeared.push((origin.to_string(), ip_list.to_vec()));
        if self.fail {
            bail!("upstream rejected remove_subhost")
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LanState {
    bridge: Option<String>,
    stopped: bool,
}

#[derive(Debug, Clone)]
pub struct FakeLanInterface {
    name: String,
    state: Rc<RefCell<LanState>>,
}

impl FakeLanInterface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Default::default(),
        }
    }

    pub fn bridge(&self) -> Option<String> {
        self.state.borrow().bridge.clone()
    }

    pub fn stopped(&self) -> bool {
        self.state.borrow().stopped
    }
}

impl LanInterface for FakeLanInterface {
    fn full_name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, bridge: &str) -> Void {
        self.state.borrow_mut().bridge = Some(bridge.to_string());
        Ok(())
    }

    fn stop(&mut self) {
        self.state.borrow_mut().stopped = true;
    }
}

#[derive(Debug, Default)]
struct VpnServerState {
    started: Vec<(String, String, Prefix)>,
    stopped: usize,
}

/// Hands out instances that all record into one log.
#[derive(Debug, Default, Clone)]
pub struct FakeVpnServer {
    state: Rc<RefCell<VpnServerState>>,
}

impl FakeVpnServer {
    pub fn instance(&self, full_name: &str) -> FakeVpnServerInstance {
        FakeVpnServerInstance {
            name: full_name.to_string(),
            state: self.state.clone(),
        }
    }

    /// (instance, bridge name) in start order.
    pub fn started(&self) -> Vec<(String, String)> {
        self.state
            .borrow()
            .started
            .iter()
            .map(|(n, b, _)| (n.clone(), b.clone()))
            .collect()
    }

    pub fn stopped(&self) -> usize {
        self.state.borrow().stopped
    }
}

#[derive(Debug)]
pub struct FakeVpnServerInstance {
    name: String,
    state: Rc<RefCell<VpnServerState>>,
}

impl VpnServer for FakeVpnServerInstance {
    fn full_name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, bridge: &str, prefix: Prefix) -> Void {
        self.state
            .borrow_mut()
            .started
            .push((self.name.clone(), bridge.to_string(), prefix));
        Ok(())
    }

    fn stop(&mut self) {
        self.state.borrow_mut().stopped += 1;
    }
}

#[derive(Debug, Default)]
struct WanState {
    alive: Cell<bool>,
    stopped: Cell<bool>,
}

#[derive(Debug, Clone)]
pub struct FakeWanConnection {
    prefixes: Vec<Prefix>,
    state: Rc<WanState>,
}

impl FakeWanConnection {
    pub fn new(prefixes: Vec<Prefix>) -> Self {
        Self {
            prefixes,
            state: Default::default(),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.state.alive.set(alive);
    }

    pub fn stopped(&self) -> bool {
        self.state.stopped.get()
    }
}

impl WanConnection for FakeWanConnection {
    fn name(&self) -> &str {
        "fake-wan"
    }

    fn start(&mut self, _tx: EventSender) -> Void {
        Ok(())
    }

    fn stop(&mut self) {
        self.state.stopped.set(true);
    }

    fn is_alive(&self) -> bool {
        self.state.alive.get()
    }

    fn interface(&self) -> Option<String> {
        Some("eth0".into())
    }

    fn prefix_list(&self) -> Vec<Prefix> {
        self.prefixes.clone()
    }
}

#[derive(Debug, Clone)]
pub struct FakeVpnClient {
    iface: String,
    remote: Ipv4Addr,
    local: Ipv4Addr,
    prefixes: Vec<Prefix>,
    starts: Rc<Cell<usize>>,
    stops: Rc<Cell<usize>>,
}

impl FakeVpnClient {
    pub fn new(iface: &str, remote: Ipv4Addr, local: Ipv4Addr, prefixes: Vec<Prefix>) -> Self {
        Self {
            iface: iface.to_string(),
            remote,
            local,
            prefixes,
            starts: Default::default(),
            stops: Default::default(),
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.get()
    }

    pub fn stops(&self) -> usize {
        self.stops.get()
    }
}

impl VpnClient for FakeVpnClient {
    fn name(&self) -> &str {
        "fake-vpn"
    }

    fn start(&mut self, _tx: EventSender) -> Void {
        self.starts.set(self.starts.get() + 1);
        Ok(())
    }

    fn stop(&mut self) {
        self.stops.set(self.stops.get() + 1);
    }

    fn interface(&self) -> String {
        self.iface.clone()
    }

    fn prefix_list(&self) -> Vec<Prefix> {
        self.prefixes.clone()
    }

    fn remote_ip(&self) -> Ipv4Addr {
        self.remote
    }

    fn local_ip(&self) -> Ipv4Addr {
        self.local
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    AddSubhost(IpDataMap),
    RemoveSubhost(Vec<Ipv4Addr>),
    PrefixConflict(Vec<Prefix>),
    Dispose,
}

#[derive(Debug)]
pub struct FakeApiClient {
    peer_id: String,
    peer_ip: Ipv4Addr,
    calls: Rc<RefCell<Vec<ApiCall>>>,
}

impl CascadeApiClient for FakeApiClient {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn peer_ip(&self) -> Ipv4Addr {
        self.peer_ip
    }

    fn add_subhost(&mut self, ip_map: &IpDataMap) -> Void {
        self.calls.borrow_mut().push(ApiCall::AddSubhost(ip_map.clone()));
        Ok(())
    }

    fn remove_subhost(&mut self, ip_list: &[Ipv4Addr]) -> Void {
        self.calls.borrow_mut().push(ApiCall::RemoveSubhost(ip_list.to_vec()));
        Ok(())
    }

    fn report_prefix_conflict(&mut self, prefixes: &[Prefix]) -> Void {
        self.calls.borrow_mut().push(ApiCall::PrefixConflict(prefixes.to_vec()));
        Ok(())
    }

    fn dispose(&mut self) {
        self.calls.borrow_mut().push(ApiCall::Dispose);
    }
}

/// Answers every connect with the same init payload.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    peer_id: String,
    peer_ip: Ipv4Addr,
    init: CascadeInit,
    fail: Rc<Cell<bool>>,
    calls: Rc<RefCell<Vec<ApiCall>>>,
}

impl FakeConnector {
    pub fn new(peer_id: &str, peer_ip: Ipv4Addr, init: CascadeInit) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            peer_ip,
            init,
            fail: Default::default(),
            calls: Default::default(),
        }
    }

    pub fn fail_next(&self) {
        self.fail.set(true);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.borrow().clone()
    }
}

impl CascadeConnector for FakeConnector {
    fn connect(
        &mut self,
        _remote: Ipv4Addr,
        _port: u16,
        _tx: EventSender,
    ) -> Res<(Box<dyn CascadeApiClient>, CascadeInit)> {
        if self.fail.replace(false) {
            bail!("connection refused")
        }
        let client = FakeApiClient {
            peer_id: self.peer_id.clone(),
            peer_ip: self.peer_ip,
            calls: self.calls.clone(),
        };
        Ok((Box::new(client), self.init.clone()))
    }
}
