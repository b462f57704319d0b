use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tracing::{debug, error, info, warn};

use crate::cascade::{
    downstream_source, CascadeApiClient, CascadeConnector, CascadeInit, DownstreamEvent,
    DownstreamPeer, RouterMap, UpstreamChain, UpstreamEvent,
};
use crate::daemon::{Context, EventSender, LoopThread};
use crate::error::{Exhausted, FatalTopologyConflict};
use crate::fabric::{HostFabric, HostListener};
use crate::firewall::Firewall;
use crate::plugin::VpnClient;
use crate::prefix::{overlapping, PrefixPool};
use crate::prelude::*;
use crate::subhost::SubhostAllocator;
use crate::wan::WanView;

pub const UPSTREAM_SOURCE: &str = "upstream-vpn";

const EXCLUDE_VPN: &str = "vpn";
const EXCLUDE_UPSTREAM_WAN: &str = "upstream-wan";
const EXCLUDE_UPSTREAM_LAN: &str = "upstream-lan";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeState {
    Disconnected,
    Connecting,
    Connected,
}

pub type FirewallFactory = Box<dyn Fn() -> Box<dyn Firewall>>;

struct Session {
    api: Box<dyn CascadeApiClient>,
    upstream: RouterMap,
    subhosts: SubhostAllocator,
}

/// Drives the uplink to the parent router and turns tree membership, both
/// upstream and downstream, into host-set refreshes on the fabric.
pub struct CascadeManager {
    uuid: String,
    api_port: u16,
    state: CascadeState,
    vpn: Option<Box<dyn VpnClient>>,
    connector: Option<Box<dyn CascadeConnector>>,
    make_firewall: FirewallFactory,
    session: Option<Session>,
    downstream: BTreeMap<String, DownstreamPeer>,
    tx: Option<EventSender>,
    thread: LoopThread,
}

fn collision(uuid: &str, init: &CascadeInit) -> Void {
    if init.upstream.iter().any(|(id, _)| id == uuid) {
        return Err(FatalTopologyConflict::IdentityCollision(uuid.to_string()).into());
    }
    Ok(())
}

fn upstream_prefixes(routers: &RouterMap) -> Vec<Prefix> {
    routers
        .values()
        .flat_map(|it| it.lan_prefix_list.iter().chain(it.wan_prefix_list.iter()))
        .copied()
        .collect()
}

impl CascadeManager {
    pub fn new(
        ctx: &Context,
        vpn: Option<Box<dyn VpnClient>>,
        connector: Option<Box<dyn CascadeConnector>>,
        make_firewall: FirewallFactory,
    ) -> Self {
        Self {
            uuid: ctx.params.uuid.clone(),
            api_port: ctx.params.cascade_api_port,
            state: CascadeState::Disconnected,
            vpn,
            connector,
            make_firewall,
            session: None,
            downstream: BTreeMap::new(),
            tx: None,
            thread: ctx.thread,
        }
    }

    pub fn state(&self) -> CascadeState {
        self.state
    }

    pub fn upstream(&self) -> Option<&RouterMap> {
        self.session.as_ref().map(|it| &it.upstream)
    }

    pub fn subhosts(&self) -> Option<&SubhostAllocator> {
        self.session.as_ref().map(|it| &it.subhosts)
    }

    pub fn downstream_peer(&self, peer: &str) -> Option<&DownstreamPeer> {
        self.downstream.get(peer)
    }

    pub fn start(&mut self, tx: EventSender) -> Void {
        self.thread.check();
        self.tx = Some(tx.clone());
        match self.vpn.as_mut() {
            Some(vpn) => {
                vpn.start(tx)?;
                info!(plugin = vpn.name(), "vpn activated");
            }
            None => info!("no vpn configured"),
        }
        Ok(())
    }

    /// The tunnel is up: claim its prefixes, open the session, validate the
    /// upstream tree and only then commit it. A session failure restarts
    /// the tunnel; a topology conflict is returned as fatal.
    pub fn on_vpn_up(&mut self, ctx: &mut Context, fabric: &mut HostFabric, wan: &WanView) -> Void {
        self.thread.check();
        // a repeated up replaces the session
        self.end_session();
        let Some(vpn) = self.vpn.as_mut() else {
            bail!("vpn up without a vpn plugin")
        };
        self.state = CascadeState::Connecting;

        let vpn_prefixes = vpn.prefix_list();
        if ctx.pool.set_exclude_list(EXCLUDE_VPN, &vpn_prefixes) {
            error!("bridge prefix overlaps the vpn link, restarting");
            return Err(FatalTopologyConflict::BridgePrefixOverlap {
                claimant: EXCLUDE_VPN.to_string(),
                prefixes: ctx.pool.conflicts_with_allocated(&vpn_prefixes),
            }
            .into());
        }

        let Some(connector) = self.connector.as_mut() else {
            info!("no cascade transport, uplink stays unmanaged");
            self.state = CascadeState::Disconnected;
            return Ok(());
        };
        let tx = self.tx.clone().ok_or(anyhow!("cascade manager not started"))?;
        let res = connector.connect(vpn.remote_ip(), self.api_port, tx.clone());
        let (mut api, init) = match res {
            Ok(it) => it,
            Err(err) => {
                error!(error = %err, "cascade session failed, restarting vpn plugin");
                vpn.stop();
                self.state = CascadeState::Disconnected;
                return vpn.start(tx);
            }
        };

        if let Err(err) = validate(&self.uuid, &mut ctx.pool, &init, &mut *api, wan) {
            api.dispose();
            return Err(err);
        }

        let subhosts = SubhostAllocator::new(
            &vpn.interface(),
            init.subhost_start,
            init.subhost_end,
            (self.make_firewall)(),
            ctx.net.clone(),
        );
        let subhosts = match subhosts {
            Ok(it) => it,
            Err(err) => {
                api.dispose();
                return Err(err);
            }
        };
        let local_ip = vpn.local_ip();
        info!(peer = api.peer_id(), remote = %api.peer_ip(), "cascade connected");
        self.session = Some(Session {
            api,
            upstream: init.upstream.into_iter().collect(),
            subhosts,
        });
        self.state = CascadeState::Connected;

        fabric.add_source(UPSTREAM_SOURCE);
        self.refresh_upstream(fabric, local_ip);
        Ok(())
    }

    /// Re-checks the upstream tree against an internet connection that
    /// came up while the cascade was already connected.
    pub fn check_internet_overlap(&mut self, wan: &WanView) -> Void {
        self.thread.check();
        match self.session.as_mut() {
            Some(session) if self.state == CascadeState::Connected => {
                internet_overlap(&session.upstream, &mut *session.api, wan)
            }
            _ => Ok(()),
        }
    }

    /// Releases everything the session held. Safe to call in any state.
    pub fn on_vpn_down(&mut self, ctx: &mut Context, fabric: &mut HostFabric) {
        self.thread.check();
        self.end_session();
        ctx.pool.remove_exclude_list(EXCLUDE_UPSTREAM_LAN);
        ctx.pool.remove_exclude_list(EXCLUDE_UPSTREAM_WAN);
        ctx.pool.remove_exclude_list(EXCLUDE_VPN);
        if fabric.has_source(UPSTREAM_SOURCE) {
            fabric.remove_source(UPSTREAM_SOURCE);
        }
        self.state = CascadeState::Disconnected;
    }

    fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            let released = session.subhosts.release_all();
            debug!(count = released.len(), "subhosts released");
            session.api.dispose();
            info!("cascade disconnected");
        }
    }

    pub fn on_upstream(&mut self, event: UpstreamEvent, fabric: &mut HostFabric) -> Void {
        self.thread.check();
        let Some(session) = self.session.as_mut() else {
            debug!(?event, "upstream event without a session");
            return Ok(());
        };
        match event {
            UpstreamEvent::RouterAdd(routers) => {
                if routers.contains_key(&self.uuid) {
                    error!("router id duplicates with upstream, restarting");
                    return Err(FatalTopologyConflict::IdentityCollision(self.uuid.clone()).into());
                }
                session.upstream.extend(routers);
            }
            UpstreamEvent::RouterRemove(ids) => {
                for id in ids {
                    session.upstream.remove(&id);
                }
            }
            UpstreamEvent::ClientAddOrChange { router_id, clients } => {
                match session.upstream.get_mut(&router_id) {
                    Some(router) => router.client_list.extend(clients),
                    None => warn!(router = %router_id, "client change for unknown upstream router"),
                }
            }
            UpstreamEvent::ClientRemove { router_id, ips } => {
                match session.upstream.get_mut(&router_id) {
                    Some(router) => ips.iter().for_each(|ip| {
                        router.client_list.remove(ip);
                    }),
                    None => warn!(router = %router_id, "client removal for unknown upstream router"),
                }
            }
            UpstreamEvent::Refresh(routers) => {
                if routers.contains_key(&self.uuid) {
                    error!("router id duplicates with upstream, restarting");
                    return Err(FatalTopologyConflict::IdentityCollision(self.uuid.clone()).into());
                }
                session.upstream = routers;
            }
        }
        let local_ip = match self.vpn.as_ref() {
            Some(vpn) => vpn.local_ip(),
            None => return Ok(()),
        };
        self.refresh_upstream(fabric, local_ip);
        Ok(())
    }

    fn refresh_upstream(&self, fabric: &mut HostFabric, local_ip: Ipv4Addr) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let chain = UpstreamChain::walk(
            &session.upstream,
            session.api.peer_id(),
            session.api.peer_ip(),
            local_ip,
        );
        let ip_map = chain.aggregate(&session.upstream);
        fabric.refresh(UPSTREAM_SOURCE, &ip_map);
    }

    pub fn on_downstream(&mut self, event: DownstreamEvent, fabric: &mut HostFabric) -> Void {
        self.thread.check();
        match event {
            DownstreamEvent::Up { peer, routers } => {
                info!(%peer, "downstream router connected");
                self.downstream.insert(peer.clone(), DownstreamPeer::new(&peer));
                self.router_add(&peer, routers, fabric)
            }
            DownstreamEvent::Down { peer } => {
                let Some(p) = self.downstream.remove(&peer) else {
                    return Ok(());
                };
                for id in p.router_ids() {
                    fabric.remove_source(&downstream_source(&id));
                }
                info!(%peer, "downstream router disconnected");
                Ok(())
            }
            DownstreamEvent::RouterAdd { peer, routers } => self.router_add(&peer, routers, fabric),
            DownstreamEvent::RouterRemove { peer, router_ids } => {
                let p = self.peer_mut(&peer)?;
                for id in p.remove_routers(&router_ids) {
                    fabric.remove_source(&downstream_source(&id));
                }
                Ok(())
            }
            DownstreamEvent::ClientAddOrChange {
                peer,
                router_id,
                clients,
            } => {
                let p = self.peer_mut(&peer)?;
                p.client_add_or_change(&router_id, &clients)?;
                refresh_downstream(p, &router_id, fabric);
                Ok(())
            }
            DownstreamEvent::ClientRemove {
                peer,
                router_id,
                ips,
            } => {
                let p = self.peer_mut(&peer)?;
                p.client_remove(&router_id, &ips)?;
                refresh_downstream(p, &router_id, fabric);
                Ok(())
            }
        }
    }

    fn peer_mut(&mut self, peer: &str) -> Res<&mut DownstreamPeer> {
        self.downstream
            .get_mut(peer)
            .ok_or(anyhow!("downstream peer {} unknown", peer))
    }

    fn router_add(&mut self, peer: &str, routers: RouterMap, fabric: &mut HostFabric) -> Void {
        let ids = routers.keys().cloned().collect::<Vec<_>>();
        let p = self.peer_mut(peer)?;
        p.add_routers(routers);
        for id in ids {
            fabric.add_source(&downstream_source(&id));
            refresh_downstream(p, &id, fabric);
        }
        Ok(())
    }

    pub fn dispose(&mut self, ctx: &mut Context, fabric: &mut HostFabric) {
        self.thread.check();
        self.on_vpn_down(ctx, fabric);
        for (_, p) in std::mem::take(&mut self.downstream) {
            for id in p.router_ids() {
                fabric.remove_source(&downstream_source(&id));
            }
        }
        if let Some(mut vpn) = self.vpn.take() {
            vpn.stop();
            info!(plugin = vpn.name(), "vpn deactivated");
        }
    }
}

/// Runs the connect-time checks in priority order. Each failure is fatal.
fn validate(
    uuid: &str,
    pool: &mut PrefixPool,
    init: &CascadeInit,
    api: &mut dyn CascadeApiClient,
    wan: &WanView,
) -> Void {
    if let Err(err) = collision(uuid, init) {
        error!("router id duplicates with upstream, restarting");
        return Err(err);
    }

    let wan_list = init
        .upstream
        .iter()
        .flat_map(|(_, it)| it.wan_prefix_list.iter())
        .copied()
        .collect::<Vec<_>>();
    let on_wan = pool
        .exclude_list("wan")
        .map(|it| overlapping(&wan_list, it))
        .unwrap_or_default();
    if pool.set_exclude_list(EXCLUDE_UPSTREAM_WAN, &wan_list) || !on_wan.is_empty() {
        error!("upstream wan prefixes collide, restarting");
        let mut prefixes = pool.conflicts_with_allocated(&wan_list);
        prefixes.extend(on_wan);
        return Err(FatalTopologyConflict::UpstreamWanOverlap(prefixes).into());
    }

    let lan_list = init
        .upstream
        .iter()
        .flat_map(|(_, it)| it.lan_prefix_list.iter())
        .copied()
        .collect::<Vec<_>>();
    if pool.set_exclude_list(EXCLUDE_UPSTREAM_LAN, &lan_list) {
        error!("bridge prefix duplicates with upstream, restarting");
        return Err(FatalTopologyConflict::BridgePrefixOverlap {
            claimant: EXCLUDE_UPSTREAM_LAN.to_string(),
            prefixes: pool.conflicts_with_allocated(&lan_list),
        }
        .into());
    }

    let routers: RouterMap = init.upstream.iter().cloned().collect();
    internet_overlap(&routers, api, wan)
}

fn refresh_downstream(peer: &DownstreamPeer, router_id: &str, fabric: &mut HostFabric) {
    if let Some(ip_map) = peer.host_map(router_id) {
        fabric.refresh(&downstream_source(router_id), &ip_map);
    }
}

/// When the internet connection is alive no upstream prefix may overlap
/// it. The upstream is told before the conflict is raised.
fn internet_overlap(routers: &RouterMap, api: &mut dyn CascadeApiClient, wan: &WanView) -> Void {
    if !wan.alive {
        return Ok(());
    }
    let conflict = overlapping(&upstream_prefixes(routers), &wan.prefixes);
    if conflict.is_empty() {
        return Ok(());
    }
    error!(prefixes = ?conflict, "upstream prefix duplicates with internet connection, restarting");
    if let Err(err) = api.report_prefix_conflict(&conflict) {
        warn!(error = %err, "reporting prefix conflict failed");
    }
    Err(FatalTopologyConflict::UpstreamInternetOverlap(conflict).into())
}

impl HostListener for CascadeManager {
    /// Local clients get a subhost address on the tunnel and are announced
    /// upstream under it.
    fn on_host_appear(&mut self, origin: &str, ip_map: &IpDataMap) -> Void {
        self.thread.check();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let mut announce = IpDataMap::new();
        for (ip, data) in ip_map {
            match session.subhosts.bind(*ip) {
                Ok(local) => {
                    announce.insert(local, data.clone());
                }
                Err(err) if err.downcast_ref::<Exhausted>().is_some() => {
                    warn!(%ip, origin, "no subhost address left");
                }
                Err(err) => warn!(%ip, origin, error = %err, "subhost binding failed"),
            }
        }
        if announce.is_empty() {
            return Ok(());
        }
        session.api.add_subhost(&announce)
    }

    fn on_host_disappear(&mut self, _origin: &str, ip_list: &[Ipv4Addr]) -> Void {
        self.thread.check();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let released = ip_list
            .iter()
            .filter_map(|ip| session.subhosts.unbind_foreign(*ip))
            .collect::<Vec<_>>();
        if released.is_empty() {
            return Ok(());
        }
        session.api.remove_subhost(&released)
    }
}
