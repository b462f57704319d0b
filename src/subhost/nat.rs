use std::net::Ipv4Addr;

use regex::Regex;
use tracing::warn;

use crate::firewall::Firewall;
use crate::prelude::*;

pub const CHAIN_PRE: &str = "natpre";
pub const CHAIN_POST: &str = "natpost";

fn dnat_rule(iface: &str, foreign: Ipv4Addr, local: Ipv4Addr) -> String {
    format!("ip daddr {} iif {} dnat {}", local, iface, foreign)
}

fn snat_rule(iface: &str, foreign: Ipv4Addr, local: Ipv4Addr) -> String {
    format!("ip saddr {} oif {} snat {}", foreign, iface, local)
}

/// Inbound traffic for `local` is sent to `foreign`, outbound traffic from
/// `foreign` leaves the tunnel as `local`.
pub fn install_subhost_nat(
    fw: &mut dyn Firewall,
    iface: &str,
    foreign: Ipv4Addr,
    local: Ipv4Addr,
) -> Void {
    fw.add_rule(CHAIN_PRE, &dnat_rule(iface, foreign, local))?;
    fw.add_rule(CHAIN_POST, &snat_rule(iface, foreign, local))?;
    Ok(())
}

/// Finds the handle of the rule printed by `nft list ... -a`.
pub fn find_handle(listing: &str, pattern: &str) -> Option<u64> {
    let re = Regex::new(&format!(r"(?m)^\s*{} # handle ([0-9]+)\s*$", pattern)).ok()?;
    re.captures(listing)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn dnat_pattern(iface: &str, foreign: Ipv4Addr, local: Ipv4Addr) -> String {
    format!(
        r#"ip daddr {} iif "{}" dnat to {}"#,
        regex::escape(&local.to_string()),
        regex::escape(iface),
        regex::escape(&foreign.to_string())
    )
}

fn snat_pattern(iface: &str, foreign: Ipv4Addr, local: Ipv4Addr) -> String {
    format!(
        r#"ip saddr {} oif "{}" snat to {}"#,
        regex::escape(&foreign.to_string()),
        regex::escape(iface),
        regex::escape(&local.to_string())
    )
}

/// Deletes only the rules matching this binding. A rule that is already
/// gone, or a listing that cannot be read, is not an error.
pub fn remove_subhost_nat(fw: &mut dyn Firewall, iface: &str, foreign: Ipv4Addr, local: Ipv4Addr) {
    let listing = match fw.list_rules() {
        Ok(listing) => listing,
        Err(err) => {
            warn!(%local, %foreign, error = %err, "can not list firewall rules");
            return;
        }
    };
    for (chain, pattern) in [
        (CHAIN_PRE, dnat_pattern(iface, foreign, local)),
        (CHAIN_POST, snat_pattern(iface, foreign, local)),
    ] {
        if let Some(handle) = find_handle(&listing, &pattern) {
            if let Err(err) = fw.delete_rule(chain, handle) {
                warn!(chain, handle, error = %err, "delete rule failed");
            }
        }
    }
}
