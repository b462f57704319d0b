use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::{Bridge, BridgeParams};
use crate::config::instances_from_etc_dir;
use crate::daemon::{Context, Event, EventSender};
use crate::fabric::HostFabric;
use crate::lease::watch_lease_file;
use crate::plugin::{LanInterface, PluginHub, VpnServer};
use crate::prelude::*;
use crate::util::{ensure_dir, write_atomic};

pub const DEFAULT_BRIDGE: &str = "wrtd-br";
const VPN_SERVER_BRIDGE_PREFIX: &str = "wrtd-vs";
const LEASE_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Builds the local segments: the default bridge, one bridge per VPN server
/// instance, and the LAN interface plugins feeding the default bridge.
pub struct LanManager {
    lifs: Vec<Box<dyn LanInterface>>,
    vpn_servers: Vec<Box<dyn VpnServer>>,
    watchers: Vec<JoinHandle<()>>,
    resolv_conf: PathBuf,
}

impl LanManager {
    /// Everything started so far is torn down again when a step fails.
    pub fn start(
        ctx: &mut Context,
        hub: &PluginHub,
        fabric: &mut HostFabric,
        tx: &EventSender,
    ) -> Res<Self> {
        ctx.thread.check();
        let mut lan = Self {
            lifs: vec![],
            vpn_servers: vec![],
            watchers: vec![],
            resolv_conf: ctx.params.resolv_conf.clone(),
        };
        if let Err(err) = lan.start_inner(ctx, hub, fabric, tx) {
            lan.dispose(ctx, fabric);
            return Err(err);
        }
        Ok(lan)
    }

    fn start_inner(
        &mut self,
        ctx: &mut Context,
        hub: &PluginHub,
        fabric: &mut HostFabric,
        tx: &EventSender,
    ) -> Void {
        let tmp_dir = ctx.params.tmp_dir.join("bridge-default");
        ensure_dir(&ctx.params.var_dir.join("bridge-default"))?;
        self.add_bridge(ctx, fabric, tx, DEFAULT_BRIDGE, tmp_dir)?;
        info!("default bridge started");

        write_atomic(&self.resolv_conf, "# Generated by wrtd\nnameserver 127.0.0.1\n")?;

        for name in hub.lan_interfaces.names() {
            for info in instances_from_etc_dir(&ctx.params, "lif", "lan-interface", &name)? {
                ensure_dir(&info.tmp_dir)?;
                ensure_dir(&info.var_dir)?;
                let mut p = hub.lan_interfaces.create(&name, &info)?;
                p.start(DEFAULT_BRIDGE)?;
                info!(plugin = p.full_name(), "lan interface plugin activated");
                self.lifs.push(p);
            }
        }

        for name in hub.vpn_servers.names() {
            for info in instances_from_etc_dir(&ctx.params, "vpns", "vpn-server", &name)? {
                ensure_dir(&info.tmp_dir)?;
                ensure_dir(&info.var_dir)?;
                let mut p = hub.vpn_servers.create(&name, &info)?;
                let bridge_name = format!("{}{}", VPN_SERVER_BRIDGE_PREFIX, self.vpn_servers.len());
                let prefix =
                    self.add_bridge(ctx, fabric, tx, &bridge_name, info.tmp_dir.join("bridge"))?;
                p.start(&bridge_name, prefix)?;
                info!(plugin = p.full_name(), bridge = %bridge_name, "vpn server plugin activated");
                self.vpn_servers.push(p);
            }
        }
        Ok(())
    }

    fn add_bridge(
        &mut self,
        ctx: &mut Context,
        fabric: &mut HostFabric,
        tx: &EventSender,
        name: &str,
        tmp_dir: PathBuf,
    ) -> Res<Prefix> {
        let prefix = ctx.pool.allocate()?;
        let params = BridgeParams {
            name: name.to_string(),
            prefix,
            l2_dns_port: ctx.params.l2_nameserver_port,
            tmp_dir,
        };
        let bridge = match Bridge::start(params, &*ctx.net, &*ctx.launcher, ctx.thread) {
            Ok(bridge) => bridge,
            Err(err) => {
                ctx.pool.release(prefix);
                return Err(err);
            }
        };
        let id = bridge.id();
        let lease_file = bridge.lease_file();
        if let Err(err) = fabric.add_bridge(bridge) {
            ctx.pool.release(prefix);
            return Err(err);
        }
        self.watchers.push(watch_lease_file(
            lease_file,
            LEASE_POLL_PERIOD,
            tx.clone(),
            Event::LeaseChanged(id),
        ));
        Ok(prefix)
    }

    /// Stops plugins, then every bridge, and clears the resolver file.
    pub fn dispose(&mut self, ctx: &mut Context, fabric: &mut HostFabric) {
        ctx.thread.check();
        for w in self.watchers.drain(..) {
            w.abort();
        }
        for mut p in self.vpn_servers.drain(..) {
            p.stop();
            info!(plugin = p.full_name(), "vpn server plugin deactivated");
        }
        for mut p in self.lifs.drain(..) {
            p.stop();
            info!(plugin = p.full_name(), "lan interface plugin deactivated");
        }
        for bridge in fabric.take_bridges() {
            ctx.pool.release(bridge.prefix());
            bridge.dispose(&*ctx.net);
        }
        if let Err(err) = write_atomic(&self.resolv_conf, "") {
            warn!(error = %err, "clearing resolver file failed");
        }
    }
}
