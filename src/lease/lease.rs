use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::prelude::*;

/// One line of the DHCP server's lease file:
/// `<expiry> <mac> <ip> <hostname|*> <client-id|*>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub expiry: u64,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub client_id: Option<String>,
}

fn optional(field: Option<&str>) -> Option<String> {
    match field {
        None | Some("*") | Some("") => None,
        Some(s) => Some(s.to_string()),
    }
}

impl FromStr for LeaseRecord {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Res<Self> {
        let mut fields = line.split_whitespace();
        let expiry = fields
            .next()
            .ok_or(anyhow!("empty lease line"))?
            .parse::<u64>()?;
        let mac = fields.next().ok_or(anyhow!("lease line without mac"))?;
        let ip = fields
            .next()
            .ok_or(anyhow!("lease line without ip"))?
            .parse::<Ipv4Addr>()?;
        Ok(Self {
            expiry,
            mac: mac.to_string(),
            ip,
            hostname: optional(fields.next()),
            client_id: optional(fields.next()),
        })
    }
}

impl LeaseRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.expiry,
            self.mac,
            self.ip,
            self.hostname.as_deref().unwrap_or("*"),
            self.client_id.as_deref().unwrap_or("*")
        )
    }

    pub fn host_data(&self) -> HostData {
        HostData {
            hostname: self.hostname.clone(),
            wakeup_mac: self.mac.parse().ok(),
            ..Default::default()
        }
    }
}

/// Parses a whole lease file. Lines that do not parse (a torn last line,
/// DUID lines, IPv6 leases) are skipped.
pub fn parse_lease_file(content: &str) -> Vec<LeaseRecord> {
    content
        .lines()
        .filter(|it| !it.trim().is_empty())
        .filter_map(|it| it.parse().ok())
        .collect()
}
