//! Runs a two-chain bridge in one process: both chains with their relays, and a validator per configured key.

use std::sync::Arc;

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use tokio::task::JoinSet;
use tracing::*;

use crate::{
    cfg::{ChainConfig, Config},
    chain::Chain,
    client::ChainClient,
    ledger::NonceLedger,
    registry::ValidatorRegistry,
    relayer::Relayer,
    validator_node::{ChainEndpoint, ValidatorNode},
};

pub struct LocalBridge {
    config: Config,
    chains: Vec<Arc<Chain>>,
    validators: JoinSet<(Address, Result<()>)>,
}

impl LocalBridge {
    /// Creates the configured chains. No validators run until [`LocalBridge::start_validators`] is called.
    pub fn new(config: Config) -> Result<Self> {
        if config.chains.len() != 2 {
            return Err(anyhow!(
                "a bridge connects two chains, {} configured",
                config.chains.len()
            ));
        }
        let registry =
            ValidatorRegistry::new(config.validators.iter().map(|key| key.address()).collect())?;

        let chains = config
            .chains
            .iter()
            .map(|chain| create_chain(chain, &registry))
            .collect::<Result<Vec<_>>>()?;

        Ok(LocalBridge {
            config,
            chains,
            validators: JoinSet::new(),
        })
    }

    pub fn chains(&self) -> &[Arc<Chain>] {
        &self.chains
    }

    pub fn chain(&self, chain_id: u64) -> Option<&Arc<Chain>> {
        self.chains.iter().find(|chain| chain.chain_id() == chain_id)
    }

    /// Endpoints for a validator, one per chain.
    pub fn endpoints(&self) -> Vec<ChainEndpoint> {
        self.config
            .chains
            .iter()
            .zip(&self.chains)
            .map(|(config, chain)| ChainEndpoint {
                client: chain.clone() as Arc<dyn ChainClient>,
                start_block: config.start_block,
            })
            .collect()
    }

    /// Spawns a validator for every configured key.
    pub async fn start_validators(&mut self) -> Result<()> {
        for key in self.config.validators.clone() {
            let node = ValidatorNode::new(key, self.config.node.clone(), self.endpoints()).await?;
            let address = node.address();
            self.validators
                .spawn(async move { (address, node.run().await) });
        }
        info!(validators = self.validators.len(), "bridge running");
        Ok(())
    }

    /// Waits for a validator to stop and reports why. Validators only stop on failure.
    pub async fn join_validator(&mut self) -> Result<()> {
        match self.validators.join_next().await {
            Some(Ok((address, Ok(())))) => Err(anyhow!("validator {address} stopped")),
            Some(Ok((address, Err(e)))) => Err(anyhow!("validator {address} failed: {e:?}")),
            Some(Err(e)) => Err(e.into()),
            None => Err(anyhow!("no validators running")),
        }
    }

    pub async fn shutdown(mut self) {
        self.validators.abort_all();
        while self.validators.join_next().await.is_some() {}
        info!("bridge stopped");
    }
}

fn create_chain(config: &ChainConfig, registry: &ValidatorRegistry) -> Result<Arc<Chain>> {
    let ledger = NonceLedger::open(config.ledger_path.as_deref())?;
    let relayer = Relayer::new(config.chain_id, registry.clone(), ledger)?;
    debug!(
        chain_id = config.chain_id,
        relayer_address = %config.relayer_address,
        ledger = ?config.ledger_path,
        "chain created"
    );
    Ok(Arc::new(Chain::new(
        config.chain_id,
        config.relayer_address,
        relayer,
    )))
}
