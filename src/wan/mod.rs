use std::rc::Rc;

use tracing::{error, info, warn};

use crate::daemon::{EventSender, LoopThread};
use crate::error::FatalTopologyConflict;
use crate::netconf::NetConf;
use crate::plugin::WanConnection;
use crate::prefix::PrefixPool;
use crate::prelude::*;

const EXCLUDE_WAN: &str = "wan";

/// Snapshot of the internet connection used by the cascade checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WanView {
    pub alive: bool,
    pub prefixes: Vec<Prefix>,
}

/// Owns the internet connection plugin and IPv4 forwarding.
pub struct WanManager {
    conn: Option<Box<dyn WanConnection>>,
    net: Rc<dyn NetConf>,
    thread: LoopThread,
}

impl WanManager {
    pub fn new(conn: Option<Box<dyn WanConnection>>, net: Rc<dyn NetConf>, thread: LoopThread) -> Self {
        Self { conn, net, thread }
    }

    pub fn start(&mut self, tx: EventSender) -> Void {
        self.thread.check();
        let Some(conn) = self.conn.as_mut() else {
            info!("no internet connection configured");
            return Ok(());
        };
        conn.start(tx)?;
        info!(plugin = conn.name(), "internet connection activated");
        self.net.set_ip_forward(true)?;
        info!("ip forwarding enabled");
        Ok(())
    }

    pub fn view(&self) -> WanView {
        match self.conn.as_ref() {
            Some(conn) => WanView {
                alive: conn.is_alive(),
                prefixes: conn.prefix_list(),
            },
            None => WanView::default(),
        }
    }

    /// Claims the connection's prefixes. Overlap with a bridge is fatal.
    pub fn on_up(&mut self, pool: &mut PrefixPool) -> Void {
        self.thread.check();
        let Some(conn) = self.conn.as_ref() else {
            return Ok(());
        };
        let prefixes = conn.prefix_list();
        if pool.set_exclude_list(EXCLUDE_WAN, &prefixes) {
            error!("bridge prefix duplicates with internet connection, restarting");
            return Err(FatalTopologyConflict::BridgePrefixOverlap {
                claimant: EXCLUDE_WAN.to_string(),
                prefixes: pool.conflicts_with_allocated(&prefixes),
            }
            .into());
        }
        match conn.interface() {
            Some(iface) => info!(%iface, ?prefixes, "internet connection up"),
            None => info!(?prefixes, "internet connection up"),
        }
        Ok(())
    }

    pub fn on_down(&mut self, pool: &mut PrefixPool) {
        self.thread.check();
        pool.remove_exclude_list(EXCLUDE_WAN);
        info!("internet connection down");
    }

    pub fn dispose(&mut self) {
        self.thread.check();
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if let Err(err) = self.net.set_ip_forward(false) {
            warn!(error = %err, "disabling ip forwarding failed");
        }
        conn.stop();
        info!(plugin = conn.name(), "internet connection deactivated");
    }
}
