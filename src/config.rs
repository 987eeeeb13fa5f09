//! HA node configuration parsed from a flat string-keyed map.
//!
//! Parsing is complete and validated before the node touches the disk or the
//! network, so a bad key fails construction immediately.

use crate::branched::BranchedDataPolicy;
use crate::identity::MachineId;
use crate::timeouts::{HaTimeouts, DEFAULT_READ_TIMEOUT};
use crate::update_mode::SlaveUpdateMode;
use log::warn;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_KEY_SERVER_ID: &str = "ha.server_id";
pub const CONFIG_KEY_OLD_SERVER_ID: &str = "ha.machine_id";
pub const CONFIG_KEY_COORDINATORS: &str = "ha.coordinators";
pub const CONFIG_KEY_OLD_COORDINATORS: &str = "ha.zoo_keeper_servers";
pub const CONFIG_KEY_SERVER: &str = "ha.server";
pub const CONFIG_KEY_CLUSTER_NAME: &str = "ha.cluster_name";
pub const CONFIG_KEY_PULL_INTERVAL: &str = "ha.pull_interval";
pub const CONFIG_KEY_ALLOW_INIT_CLUSTER: &str = "ha.allow_init_cluster";
pub const CONFIG_KEY_MAX_CONCURRENT_CHANNELS_PER_SLAVE: &str =
    "ha.max_concurrent_channels_per_slave";
pub const CONFIG_KEY_BRANCHED_DATA_POLICY: &str = "ha.branched_data_policy";
pub const CONFIG_KEY_READ_TIMEOUT: &str = "ha.read_timeout";
pub const CONFIG_KEY_LOCK_READ_TIMEOUT: &str = "ha.lock_read_timeout";
pub const CONFIG_KEY_SLAVE_COORDINATOR_UPDATE_MODE: &str = "ha.slave_coordinator_update_mode";
pub const CONFIG_KEY_ONLINE_BACKUP: &str = "enable_online_backup";

pub const DEFAULT_CLUSTER_NAME: &str = "neo4j.ha";
pub const DEFAULT_PORT: u16 = 6361;
pub const DEFAULT_BACKUP_PORT: u16 = 6362;
pub const DEFAULT_MAX_CONCURRENT_CHANNELS_PER_SLAVE: usize = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration set for any of {0:?}")]
    Missing(Vec<&'static str>),
    #[error("multiple configuration values set for the same logical key {0:?}")]
    Ambiguous(Vec<&'static str>),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("unknown branched data policy {0:?}")]
    UnknownPolicy(String),
    #[error("unknown slave coordinator update mode {0:?}")]
    UnknownUpdateMode(String),
    #[error("could not auto configure host name, please supply ha.server")]
    HostUnresolved,
    #[error("configuration I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct HaConfig {
    pub machine_id: MachineId,
    pub coordinators: String,
    pub server: String,
    pub cluster_name: String,
    pub pull_interval: Option<Duration>,
    pub branched_data_policy: BranchedDataPolicy,
    pub slave_update_mode: SlaveUpdateMode,
    pub read_timeout: Duration,
    pub lock_read_timeout: Duration,
    pub max_concurrent_channels_per_slave: usize,
    pub allow_init_cluster: bool,
    pub backup_port: Option<u16>,
    pub timeouts: HaTimeouts,
}

impl HaConfig {
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let machine_id = required(values, &[CONFIG_KEY_SERVER_ID, CONFIG_KEY_OLD_SERVER_ID])?;
        let machine_id = machine_id
            .trim()
            .parse::<i32>()
            .map(MachineId::new)
            .map_err(|_| ConfigError::Invalid {
                key: CONFIG_KEY_SERVER_ID,
                value: machine_id.to_string(),
            })?;
        let coordinators =
            required(values, &[CONFIG_KEY_COORDINATORS, CONFIG_KEY_OLD_COORDINATORS])?.to_string();
        let server = match values.get(CONFIG_KEY_SERVER) {
            Some(server) => server.clone(),
            None => local_server_address()?,
        };
        let cluster_name = values
            .get(CONFIG_KEY_CLUSTER_NAME)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string());
        let pull_interval = values
            .get(CONFIG_KEY_PULL_INTERVAL)
            .map(|value| {
                parse_time(value)
                    .filter(|interval| !interval.is_zero())
                    .ok_or_else(|| ConfigError::Invalid {
                        key: CONFIG_KEY_PULL_INTERVAL,
                        value: value.clone(),
                    })
            })
            .transpose()?;
        let branched_data_policy = match values.get(CONFIG_KEY_BRANCHED_DATA_POLICY) {
            Some(value) => value.parse()?,
            None => BranchedDataPolicy::default(),
        };
        let slave_update_mode = match values.get(CONFIG_KEY_SLAVE_COORDINATOR_UPDATE_MODE) {
            Some(value) => value.parse()?,
            None => SlaveUpdateMode::default(),
        };
        let read_timeout = seconds(values, CONFIG_KEY_READ_TIMEOUT)?.unwrap_or(DEFAULT_READ_TIMEOUT);
        let lock_read_timeout = seconds(values, CONFIG_KEY_LOCK_READ_TIMEOUT)?.unwrap_or(read_timeout);
        let max_concurrent_channels_per_slave = values
            .get(CONFIG_KEY_MAX_CONCURRENT_CHANNELS_PER_SLAVE)
            .map(|value| {
                value.trim().parse::<usize>().map_err(|_| ConfigError::Invalid {
                    key: CONFIG_KEY_MAX_CONCURRENT_CHANNELS_PER_SLAVE,
                    value: value.clone(),
                })
            })
            .transpose()?
            .unwrap_or(DEFAULT_MAX_CONCURRENT_CHANNELS_PER_SLAVE);
        let allow_init_cluster = match values.get(CONFIG_KEY_ALLOW_INIT_CLUSTER) {
            Some(value) => parse_bool(value).ok_or_else(|| ConfigError::Invalid {
                key: CONFIG_KEY_ALLOW_INIT_CLUSTER,
                value: value.clone(),
            })?,
            None => true,
        };
        let backup_port = values
            .get(CONFIG_KEY_ONLINE_BACKUP)
            .and_then(|value| parse_backup_port(value));
        Ok(Self {
            machine_id,
            coordinators,
            server,
            cluster_name,
            pull_interval,
            branched_data_policy,
            slave_update_mode,
            read_timeout,
            lock_read_timeout,
            max_concurrent_channels_per_slave,
            allow_init_cluster,
            backup_port,
            timeouts: HaTimeouts::default(),
        })
    }

    /// Reads a `key=value` properties file and parses it.
    pub fn load_properties(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let values = read_properties(path.as_ref())?;
        Self::from_map(&values)
    }

    pub fn with_timeouts(mut self, timeouts: HaTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn graph_wait(&self) -> Duration {
        self.timeouts.graph_wait_for(self.read_timeout)
    }
}

/// Parses a properties file: `key=value` or `key:value`, `#`/`!` comments.
pub fn read_properties(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let mut values = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let split = line.find(&['=', ':'][..]);
        let (key, value) = match split {
            Some(index) => (&line[..index], &line[index + 1..]),
            None => (line, ""),
        };
        values.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(values)
}

/// Parses `<n>`, `<n>ms`, `<n>s` or `<n>m`; a bare number is seconds.
pub fn parse_time(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);
    let amount = amount.parse::<u64>().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(amount)),
        "ms" => Some(Duration::from_millis(amount)),
        "m" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        _ => None,
    }
}

fn first_of<'a>(
    values: &'a HashMap<String, String>,
    keys: &[&'static str],
) -> Result<Option<&'a str>, ConfigError> {
    let mut found: Option<(usize, &str)> = None;
    for (index, key) in keys.iter().enumerate() {
        if let Some(value) = values.get(*key) {
            if found.is_some() {
                return Err(ConfigError::Ambiguous(keys.to_vec()));
            }
            found = Some((index, value.as_str()));
        }
    }
    if let Some((index, _)) = found {
        if index > 0 {
            warn!(
                "deprecated configuration key '{}' used instead of the preferred '{}'",
                keys[index], keys[0]
            );
        }
    }
    Ok(found.map(|(_, value)| value))
}

fn required<'a>(
    values: &'a HashMap<String, String>,
    keys: &[&'static str],
) -> Result<&'a str, ConfigError> {
    first_of(values, keys)?.ok_or_else(|| ConfigError::Missing(keys.to_vec()))
}

/// Whole seconds, at least one.
fn seconds(
    values: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    values
        .get(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| ConfigError::Invalid {
                    key,
                    value: value.clone(),
                })
        })
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_backup_port(value: &str) -> Option<u16> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("true") {
        return Some(DEFAULT_BACKUP_PORT);
    }
    value
        .split(',')
        .filter_map(|part| part.trim().strip_prefix("port="))
        .find_map(|port| port.trim().parse::<u16>().ok())
}

fn local_server_address() -> Result<String, ConfigError> {
    let addr = ("localhost", DEFAULT_PORT)
        .to_socket_addrs()
        .map_err(|_| ConfigError::HostUnresolved)?
        .min_by_key(|addr| !addr.is_ipv4())
        .ok_or(ConfigError::HostUnresolved)?;
    Ok(format!("{}:{}", addr.ip(), DEFAULT_PORT))
}
