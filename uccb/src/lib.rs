use std::{fs, path::PathBuf};

use anyhow::{Result, anyhow};

pub mod bridge_node;
pub mod cfg;
pub mod chain;
pub mod client;
pub mod contracts;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod event;
pub mod launcher;
pub mod ledger;
pub mod message;
pub mod query;
pub mod registry;
pub mod relayer;
pub mod request;
pub mod signatures;
pub mod validator_node;

/// Reads and merges `config_files`. A top-level key may only appear in one of them.
pub fn read_config(config_files: &[PathBuf]) -> Result<cfg::Config> {
    let mut merged_config = toml::Table::new();
    for config_file in config_files {
        let config = fs::read_to_string(config_file)
            .map_err(|e| anyhow!("failed to read {config_file:?}: {e}"))?;
        let config: toml::Table = toml::from_str(&config)?;
        for key in config.keys() {
            if merged_config.contains_key(key) {
                return Err(anyhow!(
                    "configuration conflict: {config_file:?} contained a key {key:?} that was already included in an earlier file"
                ));
            }
        }
        merged_config.extend(config);
    }

    Ok(serde::Deserialize::deserialize(merged_config)?)
}
