//! The `config` module handles the application's configuration management.
//!
//! It defines the structure of the node settings, provides default values,
//! and implements the logic for loading configuration from a file and from
//! environment variables.
//!
//! This module uses the `config` crate for file loading; the well-known
//! environment variables (`BROKER_NODE_ID`, `BROKER_PORT`, `HTTP_PORT`,
//! `MAX_CLUSTER_SIZE`, `BROKER_HOST`, `BROKER_DATA_DIR`) are applied on top
//! as the final layer.

pub mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, File};

pub use settings::Settings;

pub use settings::{BrokerSettings, ClusterSettings, NodeSettings, RaftSettings};

/// Loads node settings from file, environment, and defaults.
///
/// This function reads configuration values from:
/// 1. An optional `config/default` file (TOML/YAML/JSON).
/// 2. The well-known environment variables, which override the file.
///
/// Missing fields are filled using the values from `Settings::default()`.
///
/// # Errors
///
/// Returns an error if the config file cannot be parsed, or if one of the
/// environment variables is present but not parsable as its expected type.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder().add_source(File::with_name("config/default").required(false));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize().unwrap_or_default();

    // Merge with defaults
    let default = Settings::default();

    let mut merged = Settings {
        node: NodeSettings {
            id: partial
                .node
                .as_ref()
                .and_then(|n| n.id)
                .unwrap_or(default.node.id),
            host: partial
                .node
                .as_ref()
                .and_then(|n| n.host.clone())
                .unwrap_or(default.node.host),
            client_port: partial
                .node
                .as_ref()
                .and_then(|n| n.client_port)
                .unwrap_or(default.node.client_port),
            admin_port: partial
                .node
                .as_ref()
                .and_then(|n| n.admin_port)
                .unwrap_or(default.node.admin_port),
            data_dir: partial
                .node
                .as_ref()
                .and_then(|n| n.data_dir.clone())
                .unwrap_or(default.node.data_dir),
        },
        cluster: ClusterSettings {
            scan_hosts: partial
                .cluster
                .as_ref()
                .and_then(|c| c.scan_hosts.clone())
                .unwrap_or(default.cluster.scan_hosts),
            base_client_port: partial
                .cluster
                .as_ref()
                .and_then(|c| c.base_client_port)
                .unwrap_or(default.cluster.base_client_port),
            max_cluster_size: partial
                .cluster
                .as_ref()
                .and_then(|c| c.max_cluster_size)
                .unwrap_or(default.cluster.max_cluster_size),
            scan_interval_ms: partial
                .cluster
                .as_ref()
                .and_then(|c| c.scan_interval_ms)
                .unwrap_or(default.cluster.scan_interval_ms),
        },
        raft: RaftSettings {
            election_timeout_min_ms: partial
                .raft
                .as_ref()
                .and_then(|r| r.election_timeout_min_ms)
                .unwrap_or(default.raft.election_timeout_min_ms),
            election_timeout_max_ms: partial
                .raft
                .as_ref()
                .and_then(|r| r.election_timeout_max_ms)
                .unwrap_or(default.raft.election_timeout_max_ms),
            heartbeat_interval_ms: partial
                .raft
                .as_ref()
                .and_then(|r| r.heartbeat_interval_ms)
                .unwrap_or(default.raft.heartbeat_interval_ms),
            rpc_timeout_ms: partial
                .raft
                .as_ref()
                .and_then(|r| r.rpc_timeout_ms)
                .unwrap_or(default.raft.rpc_timeout_ms),
        },
        broker: BrokerSettings {
            outbound_queue_capacity: partial
                .broker
                .as_ref()
                .and_then(|b| b.outbound_queue_capacity)
                .unwrap_or(default.broker.outbound_queue_capacity),
            subscriber_idle_timeout_secs: partial
                .broker
                .as_ref()
                .and_then(|b| b.subscriber_idle_timeout_secs)
                .unwrap_or(default.broker.subscriber_idle_timeout_secs),
            write_queue_capacity: partial
                .broker
                .as_ref()
                .and_then(|b| b.write_queue_capacity)
                .unwrap_or(default.broker.write_queue_capacity),
            write_batch_size: partial
                .broker
                .as_ref()
                .and_then(|b| b.write_batch_size)
                .unwrap_or(default.broker.write_batch_size),
        },
    };

    apply_env_overrides(&mut merged)?;

    Ok(merged)
}

/// Applies the well-known environment variables on top of the merged
/// settings. A variable that is present but unparsable is a hard error
/// rather than a silently ignored one.
fn apply_env_overrides(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Some(id) = parse_env::<u32>("BROKER_NODE_ID")? {
        settings.node.id = id;
    }
    if let Some(port) = parse_env::<u16>("BROKER_PORT")? {
        settings.node.client_port = port;
    }
    if let Some(port) = parse_env::<u16>("HTTP_PORT")? {
        settings.node.admin_port = port;
    }
    if let Some(size) = parse_env::<u16>("MAX_CLUSTER_SIZE")? {
        settings.cluster.max_cluster_size = size;
    }
    if let Ok(host) = std::env::var("BROKER_HOST") {
        settings.node.host = host;
    }
    if let Ok(dir) = std::env::var("BROKER_DATA_DIR") {
        settings.node.data_dir = dir;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Message(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests;
