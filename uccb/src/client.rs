//! How validators talk to a chain.

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;

use crate::{
    chain::Chain,
    event::{CallOutcome, ChainLog, EchoRecord, QuorumProof, RelayRequest, ResultMessage},
    registry::ValidatorRegistry,
    relayer::{DispatchOutcome, ResumeOutcome, Simulation},
};

/// A connection to the relay of one chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> Result<u64>;

    /// Relay logs in blocks `from_block..=to_block`.
    async fn relay_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainLog>>;

    async fn validators(&self) -> Result<ValidatorRegistry>;

    async fn echo(&self, from: Address, echo: &EchoRecord) -> Result<()>;

    async fn simulate_dispatch(&self, request: &RelayRequest, proof: &QuorumProof) -> Result<Simulation>;

    async fn dispatch(&self, from: Address, request: &RelayRequest, proof: &QuorumProof) -> Result<DispatchOutcome>;

    async fn query(&self, caller: Address, callee: Address, payload: &[u8]) -> Result<CallOutcome>;

    async fn simulate_resume(&self, message: &ResultMessage, proof: &QuorumProof) -> Result<Simulation>;

    async fn resume(&self, from: Address, message: &ResultMessage, proof: &QuorumProof) -> Result<ResumeOutcome>;
}

#[async_trait]
impl ChainClient for Chain {
    fn chain_id(&self) -> u64 {
        Chain::chain_id(self)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(Chain::block_number(self))
    }

    async fn relay_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainLog>> {
        let relayer = self.relayer_address();
        Ok(self
            .logs(from_block, to_block)
            .into_iter()
            .filter(|log| log.inner.address == relayer)
            .collect())
    }

    async fn validators(&self) -> Result<ValidatorRegistry> {
        Ok(Chain::validators(self))
    }

    async fn echo(&self, from: Address, echo: &EchoRecord) -> Result<()> {
        Chain::echo(self, from, echo.digest, echo.index, echo.signature.clone())?;
        Ok(())
    }

    async fn simulate_dispatch(&self, request: &RelayRequest, proof: &QuorumProof) -> Result<Simulation> {
        Ok(Chain::simulate_dispatch(self, request, proof)?)
    }

    async fn dispatch(&self, from: Address, request: &RelayRequest, proof: &QuorumProof) -> Result<DispatchOutcome> {
        Ok(Chain::dispatch(self, from, request, proof)?)
    }

    async fn query(&self, caller: Address, callee: Address, payload: &[u8]) -> Result<CallOutcome> {
        Ok(Chain::query(self, caller, callee, payload))
    }

    async fn simulate_resume(&self, message: &ResultMessage, proof: &QuorumProof) -> Result<Simulation> {
        Ok(Chain::simulate_resume(self, message, proof)?)
    }

    async fn resume(&self, from: Address, message: &ResultMessage, proof: &QuorumProof) -> Result<ResumeOutcome> {
        Ok(Chain::resume(self, from, message, proof)?)
    }
}
