mod context;

pub use context::*;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use crate::cascade::{CascadeManager, DownstreamEvent, FirewallFactory, UpstreamEvent};
use crate::config::{load_optional, InstanceInfo, WAN_CONNECTION_FILE, WAN_VPN_FILE};
use crate::error::is_fatal;
use crate::fabric::HostFabric;
use crate::lan::LanManager;
use crate::plugin::PluginHub;
use crate::prelude::*;
use crate::util::ensure_dir;
use crate::wan::WanManager;

pub type EventSender = UnboundedSender<Event>;

/// Everything that can happen to the router, delivered to the loop thread.
#[derive(Debug, Clone)]
pub enum Event {
    /// The lease file of this bridge id moved.
    LeaseChanged(String),
    WanUp,
    WanDown,
    VpnUp,
    VpnDown,
    Upstream(UpstreamEvent),
    Downstream(DownstreamEvent),
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Restart,
    Exit,
}

pub struct Daemon {
    ctx: Context,
    fabric: HostFabric,
    lan: Option<LanManager>,
    wan: WanManager,
    cascade: CascadeManager,
    tx: EventSender,
    rx: UnboundedReceiver<Event>,
}

fn single_instance(ctx: &Context, plugin_prefix: &str, plugin: &str, config: serde_json::Value) -> Res<InstanceInfo> {
    let dir_name = format!("{}-{}", plugin_prefix, plugin);
    let info = InstanceInfo {
        name: plugin.to_string(),
        instance: String::new(),
        config,
        tmp_dir: ctx.params.tmp_dir.join(&dir_name),
        var_dir: ctx.params.var_dir.join(&dir_name),
    };
    ensure_dir(&info.tmp_dir)?;
    ensure_dir(&info.var_dir)?;
    Ok(info)
}

impl Daemon {
    /// Brings up the LAN side, then the internet connection and the uplink.
    pub fn start(mut ctx: Context, hub: &PluginHub, make_firewall: FirewallFactory) -> Res<Self> {
        ctx.thread.check();
        ensure_dir(&ctx.params.tmp_dir)?;
        ensure_dir(&ctx.params.var_dir)?;
        let (tx, rx) = unbounded_channel();

        let wan_conn = match load_optional(&ctx.params.etc_dir.join(WAN_CONNECTION_FILE))? {
            Some((plugin, config)) => {
                let info = single_instance(&ctx, "wconn", &plugin, config)?;
                Some(hub.wan_connections.create(&plugin, &info)?)
            }
            None => None,
        };
        let vpn = match load_optional(&ctx.params.etc_dir.join(WAN_VPN_FILE))? {
            Some((plugin, config)) => {
                let info = single_instance(&ctx, "wvpn", &plugin, config)?;
                Some(hub.vpn_clients.create(&plugin, &info)?)
            }
            None => None,
        };

        let mut fabric = HostFabric::new(ctx.thread);
        let wan = WanManager::new(wan_conn, ctx.net.clone(), ctx.thread);
        let cascade = CascadeManager::new(&ctx, vpn, hub.cascade_connector(), make_firewall);
        let lan = LanManager::start(&mut ctx, hub, &mut fabric, &tx)?;

        let mut daemon = Self {
            ctx,
            fabric,
            lan: Some(lan),
            wan,
            cascade,
            tx,
            rx,
        };
        let res = daemon
            .wan
            .start(daemon.tx.clone())
            .and_then(|_| daemon.cascade.start(daemon.tx.clone()));
        if let Err(err) = res {
            daemon.dispose();
            return Err(err);
        }
        info!(uuid = %daemon.ctx.params.uuid, "started");
        Ok(daemon)
    }

    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn fabric(&self) -> &HostFabric {
        &self.fabric
    }

    pub fn cascade(&self) -> &CascadeManager {
        &self.cascade
    }

    /// Handles one event. `Some` ends the loop.
    pub fn handle(&mut self, event: Event) -> Res<Option<Outcome>> {
        self.ctx.thread.check();
        match event {
            Event::LeaseChanged(bridge_id) => {
                self.fabric.on_lease_changed(&bridge_id, &mut self.cascade)?;
            }
            Event::WanUp => {
                self.wan.on_up(&mut self.ctx.pool)?;
                self.cascade.check_internet_overlap(&self.wan.view())?;
            }
            Event::WanDown => self.wan.on_down(&mut self.ctx.pool),
            Event::VpnUp => {
                let view = self.wan.view();
                self.cascade.on_vpn_up(&mut self.ctx, &mut self.fabric, &view)?;
            }
            Event::VpnDown => self.cascade.on_vpn_down(&mut self.ctx, &mut self.fabric),
            Event::Upstream(ev) => self.cascade.on_upstream(ev, &mut self.fabric)?,
            Event::Downstream(ev) => self.cascade.on_downstream(ev, &mut self.fabric)?,
            Event::Restart => return Ok(Some(Outcome::Restart)),
            Event::Shutdown => return Ok(Some(Outcome::Exit)),
        }
        Ok(None)
    }

    /// Runs until a restart or shutdown is requested or a topology conflict
    /// is raised, then tears everything down.
    pub async fn run(mut self) -> Outcome {
        let outcome = loop {
            let Some(event) = self.rx.recv().await else {
                break Outcome::Exit;
            };
            match self.handle(event) {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {}
                Err(err) if is_fatal(&err) => {
                    error!(error = %err, "topology conflict");
                    break Outcome::Restart;
                }
                Err(err) => warn!("event dropped: {:#}", err),
            }
        };
        self.dispose();
        outcome
    }

    pub fn dispose(mut self) {
        self.ctx.thread.check();
        self.cascade.dispose(&mut self.ctx, &mut self.fabric);
        self.wan.dispose();
        if let Some(mut lan) = self.lan.take() {
            lan.dispose(&mut self.ctx, &mut self.fabric);
        }
        info!("terminated");
    }
}
