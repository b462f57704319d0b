mod nft;

pub use nft::*;

use crate::prelude::*;

/// Narrow view of the packet filter: idempotent rule insertion, a listing
/// that carries rule handles, and deletion by handle.
pub trait Firewall {
    fn add_rule(&mut self, chain: &str, rule: &str) -> Void;
    fn list_rules(&mut self) -> Res<String>;
    fn delete_rule(&mut self, chain: &str, handle: u64) -> Void;
}
