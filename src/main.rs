use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::bridge::DnsmasqLauncher;
use crate::config::{Params, PoolConfig};
use crate::daemon::{Context, Daemon, Event, EventSender, Outcome};
use crate::firewall::{Firewall, Nft};
use crate::netconf::IpRoute;
use crate::plugin::PluginHub;
use crate::prelude::*;

mod bridge;
mod cascade;
mod config;
mod daemon;
mod error;
mod fabric;
mod firewall;
mod host;
mod lan;
mod lease;
mod netconf;
mod plugin;
mod prefix;
mod prelude;
mod subhost;
#[cfg(test)]
mod testutil;
mod util;
mod wan;

#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
struct Args {
    /// Directory holding the pool and plugin configuration files
    #[clap(long, default_value = "/etc/wrtd")]
    etc_dir: PathBuf,

    /// Directory for runtime artifacts, wiped by a reboot
    #[clap(long, default_value = "/run/wrtd")]
    tmp_dir: PathBuf,

    /// Directory for state kept across restarts
    #[clap(long, default_value = "/var/lib/wrtd")]
    var_dir: PathBuf,

    /// Identity of this router in the cascade tree
    #[clap(long)]
    uuid: String,

    /// Port of the cascade control API on the upstream router
    #[clap(long, default_value_t = 2220)]
    cascade_api_port: u16,

    /// Port of the layer 2 nameserver the bridges forward to
    #[clap(long, default_value_t = 5353)]
    l2_nameserver_port: u16,

    /// Host resolver file pointed at the local nameserver
    #[clap(long, default_value = "/etc/resolv.conf")]
    resolv_conf: PathBuf,
}

impl Args {
    fn params(&self) -> Params {
        Params {
            etc_dir: self.etc_dir.clone(),
            tmp_dir: self.tmp_dir.clone(),
            var_dir: self.var_dir.clone(),
            uuid: self.uuid.clone(),
            cascade_api_port: self.cascade_api_port,
            l2_nameserver_port: self.l2_nameserver_port,
            resolv_conf: self.resolv_conf.clone(),
        }
    }
}

fn forward_signal(kind: SignalKind, tx: EventSender, event: Event) -> Res<JoinHandle<()>> {
    let mut stream = signal(kind)?;
    Ok(tokio::spawn(async move {
        while stream.recv().await.is_some() {
            if tx.send(event.clone()).is_err() {
                break;
            }
        }
    }))
}

// SIGHUP restarts, SIGTERM and SIGINT shut down.
fn install_signals(tx: EventSender) -> Res<Vec<JoinHandle<()>>> {
    Ok(vec![
        forward_signal(SignalKind::hangup(), tx.clone(), Event::Restart)?,
        forward_signal(SignalKind::terminate(), tx.clone(), Event::Shutdown)?,
        forward_signal(SignalKind::interrupt(), tx, Event::Shutdown)?,
    ])
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Void {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(?args, "wrtd starting");
    let hub = PluginHub::default();

    loop {
        let pool = PoolConfig::load(&args.etc_dir)?.build_pool()?;
        let ctx = Context::new(
            args.params(),
            pool,
            Rc::new(IpRoute::default()),
            Rc::new(DnsmasqLauncher),
        );
        let daemon = Daemon::start(ctx, &hub, Box::new(|| Box::new(Nft::default()) as Box<dyn Firewall>))
            .map_err(|err| {
                error!("startup failed: {:#}", err);
                err
            })?;

        let signals = match install_signals(daemon.sender()) {
            Ok(signals) => signals,
            Err(err) => {
                daemon.dispose();
                return Err(err);
            }
        };
        let outcome = daemon.run().await;
        for s in signals {
            s.abort();
        }
        match outcome {
            Outcome::Restart => info!("restarting"),
            Outcome::Exit => break,
        }
    }
    Ok(())
}
