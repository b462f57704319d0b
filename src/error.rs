use thiserror::Error;

use crate::prefix::Prefix;

/// A pool had nothing left to hand out. The operation was not performed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    #[error("no free prefix left in the address pool")]
    Prefix,

    #[error("no free subhost address left")]
    Subhost,
}

/// An inconsistency in the router tree that can only be resolved by
/// restarting the whole daemon. Whoever raises it must not mutate any
/// further state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalTopologyConflict {
    #[error("router id {0} already appears in the upstream chain")]
    IdentityCollision(String),

    #[error("prefixes claimed by \"{claimant}\" overlap active bridges: {prefixes:?}")]
    BridgePrefixOverlap {
        claimant: String,
        prefixes: Vec<Prefix>,
    },

    #[error("upstream WAN prefixes overlap the internet connection: {0:?}")]
    UpstreamWanOverlap(Vec<Prefix>),

    #[error("upstream prefixes overlap the live internet connection: {0:?}")]
    UpstreamInternetOverlap(Vec<Prefix>),
}

pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<FatalTopologyConflict>().is_some()
}
