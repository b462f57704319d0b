use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::Exhausted;
use crate::prefix::{normalize, overlapping, Ipv4NetworkIterator, Prefix};
use crate::prelude::*;

const CANDIDATE_WINDOW: usize = 100;
const DEFAULT_SPACE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);
const DEFAULT_SPACE_LEN: u8 = 8;
const DEFAULT_PREFIX_LEN: u8 = 24;

/// Hands out non-overlapping bridge prefixes and keeps the exclude lists
/// other subsystems claim (internet connection, VPN link, upstream routers).
#[derive(Debug, Clone)]
pub struct PrefixPool {
    space: Ipv4Network,
    prefix_len: u8,
    allocated: Vec<Prefix>,
    exclude: BTreeMap<String, Vec<Prefix>>,
}

impl Default for PrefixPool {
    fn default() -> Self {
        Self {
            space: Ipv4Network::new(DEFAULT_SPACE, DEFAULT_SPACE_LEN)
                .unwrap_or_else(|_| Ipv4Network::from(DEFAULT_SPACE)),
            prefix_len: DEFAULT_PREFIX_LEN,
            allocated: vec![],
            exclude: BTreeMap::new(),
        }
    }
}

impl PrefixPool {
    pub fn new(space: Ipv4Network, prefix_len: u8) -> Res<Self> {
        if prefix_len > 30 {
            bail!("prefix length must be less than /31")
        }
        if prefix_len < space.prefix() {
            bail!("prefix length /{} does not fit in {}", prefix_len, space)
        }
        Ok(Self {
            space: normalize(space),
            prefix_len,
            allocated: vec![],
            exclude: BTreeMap::new(),
        })
    }

    pub fn space(&self) -> Ipv4Network {
        self.space
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn allocated(&self) -> &[Prefix] {
        &self.allocated
    }

    pub fn exclude_list(&self, name: &str) -> Option<&[Prefix]> {
        self.exclude.get(name).map(|it| it.as_slice())
    }

    fn is_free(&self, sn: &Prefix) -> bool {
        !self.allocated.iter().any(|it| it.overlaps(*sn))
            && !self.exclude.values().flatten().any(|it| it.overlaps(*sn))
    }

    /// Picks one of the first free candidates at random so that sibling
    /// routers rarely pick the same block.
    pub fn allocate(&mut self) -> Result<Prefix, Exhausted> {
        let mut available = vec![];
        let mut sn = Ipv4Network::new(self.space.network(), self.prefix_len).ok();
        while let Some(cur) = sn {
            if !self.space.contains(cur.network()) || available.len() >= CANDIDATE_WINDOW {
                break;
            }
            if self.is_free(&cur) {
                available.push(cur);
            }
            sn = cur.next_network();
        }
        if available.is_empty() {
            return Err(Exhausted::Prefix);
        }
        let i = rand::thread_rng().gen_range(0..available.len());
        let prefix = available[i];
        self.allocated.push(prefix);
        debug!(%prefix, "prefix allocated");
        Ok(prefix)
    }

    pub fn release(&mut self, prefix: Prefix) {
        let prefix = normalize(prefix);
        let before = self.allocated.len();
        self.allocated.retain(|it| *it != prefix);
        if self.allocated.len() == before {
            warn!(%prefix, "releasing a prefix that was not allocated");
        }
    }

    /// Prefixes of `list` that collide with a prefix in use by a bridge.
    pub fn conflicts_with_allocated(&self, list: &[Prefix]) -> Vec<Prefix> {
        overlapping(list, &self.allocated)
    }

    /// Replaces the exclude list owned by `name`. Returns true when the new
    /// list overlaps an allocated prefix, which the caller must treat as
    /// fatal.
    pub fn set_exclude_list(&mut self, name: &str, list: &[Prefix]) -> bool {
        let list = list.iter().copied().map(normalize).collect::<Vec<_>>();
        let conflict = !self.conflicts_with_allocated(&list).is_empty();
        self.exclude.insert(name.to_string(), list);
        conflict
    }

    pub fn remove_exclude_list(&mut self, name: &str) {
        self.exclude.remove(name);
    }
}
