//! Configuration of a local bridge: its chains, validator keys and agent timings.

use std::{path::PathBuf, time::Duration};

use alloy::primitives::{Address, B256, U256, address};
use serde::{Deserialize, Serialize};

use crate::crypto::SecretKey;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The two chains bridged by the relay.
    pub chains: Vec<ChainConfig>,
    /// Secret keys of the validators to run, hex encoded. Their addresses, in this order, form the validator set
    /// registered with both relays.
    pub validators: Vec<SecretKey>,
    /// Settings shared by every validator.
    #[serde(default)]
    pub node: NodeConfig,
    /// The base address of the OTLP collector. If not set, metrics will not be exported.
    #[serde(default)]
    pub otlp_collector_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// The address the relay is hosted at.
    #[serde(default = "relayer_address_default")]
    pub relayer_address: Address,
    /// Where the relay's nonce ledger is stored. If not set, the ledger is kept in memory.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    /// The first block validators read relay logs from.
    #[serde(default)]
    pub start_block: u64,
}

pub fn relayer_address_default() -> Address {
    address!("0x00000000000000000000000000000000000face7")
}

/// Who submits `dispatch` and `resume` once a quorum exists. Safety never depends on this: submissions are
/// idempotent, so the policy only decides how many redundant transactions are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderPolicy {
    /// Every validator submits immediately.
    FirstToTry,
    /// Validators take turns by nonce.
    #[default]
    RoundRobin,
    /// The leader is picked by the digest being submitted.
    HashBased,
}

impl LeaderPolicy {
    /// The position of validator `index` in the submission order for a request, among `validators` validators.
    /// The leader has rank zero.
    pub fn rank(&self, validators: usize, index: u16, nonce: U256, digest: B256) -> usize {
        let len = validators.max(1);
        let start = match self {
            LeaderPolicy::FirstToTry => return 0,
            LeaderPolicy::RoundRobin => (nonce % U256::from(len)).to::<usize>(),
            LeaderPolicy::HashBased => {
                let mut word = [0u8; 8];
                word.copy_from_slice(&digest[..8]);
                (u64::from_be_bytes(word) % len as u64) as usize
            }
        };
        (usize::from(index) % len + len - start) % len
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// How often each chain is polled for new relay logs.
    #[serde(default = "poll_interval_default")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub leader_policy: LeaderPolicy,
    /// How long each validator waits per rank before submitting in place of validators ranked ahead of it.
    #[serde(default = "failover_delay_default")]
    pub failover_delay: Duration,
    /// Attempts at submitting one `dispatch` or `resume` before this validator gives up on it.
    #[serde(default = "max_dispatch_attempts_default")]
    pub max_dispatch_attempts: u8,
    #[serde(default = "retry_delay_default")]
    pub retry_delay: Duration,
    /// Requests still unresolved after this long are reported once.
    #[serde(default = "stuck_warning_after_default")]
    pub stuck_warning_after: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            poll_interval: poll_interval_default(),
            leader_policy: LeaderPolicy::default(),
            failover_delay: failover_delay_default(),
            max_dispatch_attempts: max_dispatch_attempts_default(),
            retry_delay: retry_delay_default(),
            stuck_warning_after: stuck_warning_after_default(),
        }
    }
}

pub fn poll_interval_default() -> Duration {
    Duration::from_millis(100)
}

pub fn failover_delay_default() -> Duration {
    Duration::from_secs(2)
}

pub fn max_dispatch_attempts_default() -> u8 {
    5
}

pub fn retry_delay_default() -> Duration {
    Duration::from_secs(1)
}

pub fn stuck_warning_after_default() -> Duration {
    Duration::from_secs(60)
}
