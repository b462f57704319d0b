use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::prelude::*;
use crate::util::write_atomic;

/// Hosts known through one source. `None` marks a present but unnamed host,
/// stored as a comment line so the resolver ignores it.
pub type HostSet = BTreeMap<Ipv4Addr, Option<String>>;

pub fn parse_host_file(content: &str) -> HostSet {
    let mut set = HostSet::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix('#') {
            if let Ok(ip) = rest.trim().parse::<Ipv4Addr>() {
                set.insert(ip, None);
            }
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(ip) = fields.next().and_then(|it| it.parse::<Ipv4Addr>().ok()) else {
            continue;
        };
        set.insert(ip, fields.next().map(|it| it.to_string()));
    }
    set
}

pub fn render_host_file(set: &HostSet) -> String {
    let mut buf = String::new();
    for (ip, hostname) in set {
        match hostname {
            Some(hostname) => buf.push_str(&format!("{} {}\n", ip, hostname)),
            None => buf.push_str(&format!("# {}\n", ip)),
        }
    }
    buf
}

pub fn read_host_file(path: &Path) -> Res<HostSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading host file {}", path.display()))?;
    Ok(parse_host_file(&content))
}

pub fn write_host_file(path: &Path, set: &HostSet) -> Void {
    write_atomic(path, &render_host_file(set))
}
