use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::prefix::PrefixPool;
use crate::prelude::*;

pub const POOL_CONFIG_FILE: &str = "wrtd.json";
pub const WAN_CONNECTION_FILE: &str = "wan-connection.json";
pub const WAN_VPN_FILE: &str = "wan-vpn.json";

/// Process parameters, filled from the command line.
#[derive(Debug, Clone)]
pub struct Params {
    pub etc_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub var_dir: PathBuf,
    pub uuid: String,
    pub cascade_api_port: u16,
    pub l2_nameserver_port: u16,
    pub resolv_conf: PathBuf,
}

/// Address space the bridges are carved from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PoolConfig {
    #[serde(rename = "prefix-space", default = "default_space")]
    pub space: Ipv4Network,

    #[serde(rename = "prefix-len", default = "default_len")]
    pub prefix_len: u8,
}

fn default_space() -> Ipv4Network {
    PrefixPool::default().space()
}

fn default_len() -> u8 {
    PrefixPool::default().prefix_len()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            space: default_space(),
            prefix_len: default_len(),
        }
    }
}

impl PoolConfig {
    /// Reads `wrtd.json` from the etc dir, defaults when it is absent.
    pub fn load(etc_dir: &Path) -> Res<Self> {
        let path = etc_dir.join(POOL_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn build_pool(&self) -> Res<PrefixPool> {
        PrefixPool::new(self.space, self.prefix_len)
    }
}

/// One configured instance of a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub name: String,
    /// Empty for the unnamed default instance.
    pub instance: String,
    pub config: JsonValue,
    pub tmp_dir: PathBuf,
    pub var_dir: PathBuf,
}

impl InstanceInfo {
    pub fn full_name(&self) -> String {
        if self.instance.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.name, self.instance)
        }
    }
}

fn read_config_object(path: &Path) -> Res<JsonValue> {
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(JsonValue::Object(Map::new()));
    }
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Finds `<cfg_prefix>-<name>[-<instance>].json` in `params.etc_dir`. When
/// none exists one default instance with an empty config is returned.
/// Instance dirs are `<plugin_prefix>-<full name>` below tmp and var dir.
pub fn instances_from_etc_dir(
    params: &Params,
    plugin_prefix: &str,
    cfg_prefix: &str,
    name: &str,
) -> Res<Vec<InstanceInfo>> {
    let stem = format!("{}-{}", cfg_prefix, name);
    let mut found = vec![];
    if params.etc_dir.exists() {
        for entry in std::fs::read_dir(&params.etc_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(rest) = file_name
                .strip_prefix(&stem)
                .and_then(|it| it.strip_suffix(".json"))
            else {
                continue;
            };
            let instance = match rest {
                "" => "",
                _ => match rest.strip_prefix('-') {
                    Some(it) if !it.is_empty() => it,
                    _ => continue,
                },
            };
            found.push((instance.to_string(), entry.path()));
        }
    }
    found.sort();

    let make = |instance: String, config: JsonValue| {
        let mut info = InstanceInfo {
            name: name.to_string(),
            instance,
            config,
            tmp_dir: PathBuf::new(),
            var_dir: PathBuf::new(),
        };
        let dir_name = format!("{}-{}", plugin_prefix, info.full_name());
        info.tmp_dir = params.tmp_dir.join(&dir_name);
        info.var_dir = params.var_dir.join(&dir_name);
        info
    };

    if found.is_empty() {
        return Ok(vec![make(String::new(), JsonValue::Object(Map::new()))]);
    }
    found
        .into_iter()
        .map(|(instance, path)| Ok(make(instance, read_config_object(&path)?)))
        .collect()
}

/// Reads a single-instance config whose `plugin` key names the plugin.
/// `None` when the file does not exist: that subsystem stays off.
pub fn load_optional(path: &Path) -> Res<Option<(String, JsonValue)>> {
    if !path.exists() {
        return Ok(None);
    }
    let config = read_config_object(path)?;
    let plugin = config
        .get("plugin")
        .and_then(|it| it.as_str())
        .ok_or(anyhow!("{}: missing \"plugin\"", path.display()))?
        .to_string();
    Ok(Some((plugin, config)))
}
