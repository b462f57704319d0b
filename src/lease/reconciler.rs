use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::lease::{parse_lease_file, LeaseRecord};
use crate::prelude::*;

/// Classification of one snapshot against the previous one, matched by ip.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LeaseDiff {
    pub added: Vec<LeaseRecord>,
    pub changed: Vec<LeaseRecord>,
    pub removed: Vec<LeaseRecord>,
}

impl LeaseDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Adds and changes coalesced into one appear-or-change map.
    pub fn appeared(&self) -> IpDataMap {
        self.added
            .iter()
            .chain(self.changed.iter())
            .map(|it| (it.ip, it.host_data()))
            .collect()
    }

    pub fn disappeared(&self) -> Vec<Ipv4Addr> {
        self.removed.iter().map(|it| it.ip).collect()
    }
}

fn find<'a>(item: &LeaseRecord, list: &'a [LeaseRecord]) -> Option<&'a LeaseRecord> {
    list.iter().find(|it| it.ip == item.ip)
}

/// An entry in both snapshots is a change only when its mac or hostname
/// differs, expiry renewals are ignored.
pub fn diff(old: &[LeaseRecord], new: &[LeaseRecord]) -> LeaseDiff {
    let mut d = LeaseDiff::default();
    for item in new {
        match find(item, old) {
            None => d.added.push(item.clone()),
            Some(prev) => {
                if prev.mac != item.mac || prev.hostname != item.hostname {
                    d.changed.push(item.clone());
                }
            }
        }
    }
    for item in old {
        if find(item, new).is_none() {
            d.removed.push(item.clone());
        }
    }
    d
}

/// Turns the lease file of one bridge into add/change/remove deltas by
/// diffing full snapshots, so a missed notification heals on the next one.
#[derive(Debug)]
pub struct LeaseReconciler {
    path: PathBuf,
    last: Vec<LeaseRecord>,
}

impl LeaseReconciler {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            last: vec![],
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_snapshot(&self) -> &[LeaseRecord] {
        &self.last
    }

    /// Reads the current snapshot and returns its diff against the previous
    /// one. The previous snapshot is replaced before the diff is handed out,
    /// so whatever happens to the dispatch, the same change is never
    /// reported twice. A read failure leaves the previous snapshot in place.
    pub fn scan(&mut self) -> Res<LeaseDiff> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let snapshot = parse_lease_file(&content);
        let d = diff(&self.last, &snapshot);
        self.last = snapshot;

        for l in &d.added {
            match &l.hostname {
                Some(hostname) => info!(%hostname, ip = %l.ip, mac = %l.mac, "client appeared"),
                None => info!(ip = %l.ip, mac = %l.mac, "client appeared"),
            }
        }
        for l in &d.removed {
            match &l.hostname {
                Some(hostname) => info!(%hostname, ip = %l.ip, mac = %l.mac, "client disappeared"),
                None => info!(ip = %l.ip, mac = %l.mac, "client disappeared"),
            }
        }
        Ok(d)
    }
}
