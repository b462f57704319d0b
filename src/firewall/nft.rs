use std::process::Command;

use crate::firewall::Firewall;
use crate::prelude::*;
use crate::util::execute;

const NFT: &str = "/sbin/nft";
pub const TABLE: &str = "wrtd";

/// `nft` driven through its command line, all rules live in one table.
#[derive(Debug, Clone)]
pub struct Nft {
    program: String,
    table: String,
}

impl Default for Nft {
    fn default() -> Self {
        Self {
            program: NFT.to_string(),
            table: TABLE.to_string(),
        }
    }
}

impl Nft {
    fn run(&self, args: &str) -> Res<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args.split_whitespace());
        let output = execute(&mut cmd)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Firewall for Nft {
    fn add_rule(&mut self, chain: &str, rule: &str) -> Void {
        self.run(&format!("add rule {} {} {}", self.table, chain, rule))?;
        Ok(())
    }

    fn list_rules(&mut self) -> Res<String> {
        self.run(&format!("list table ip {} -a", self.table))
    }

    fn delete_rule(&mut self, chain: &str, handle: u64) -> Void {
        self.run(&format!("delete rule {} {} handle {}", self.table, chain, handle))?;
        Ok(())
    }
}
