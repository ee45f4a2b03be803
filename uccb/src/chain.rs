//! An in-process ledger hosting a relay and the contracts which use it.
//!
//! Transactions run one at a time under the chain's lock. Each committed transaction produces a block holding
//! the logs it emitted. Contracts are native Rust objects addressed like EVM accounts: a call to an address with
//! no contract succeeds with empty output, and a reverted call discards the logs it emitted.

use std::{collections::HashMap, sync::Arc};

use alloy::{
    primitives::{Address, B256, Bytes, Log, Selector, U256},
    sol_types::{Revert, SolError, SolEvent},
};
use parking_lot::Mutex;
use tracing::*;

use crate::{
    error::RelayError,
    event::{CallOutcome, ChainLog, QuorumProof, RelayRequest, ResultMessage},
    ledger::NonceRecord,
    registry::ValidatorRegistry,
    relayer::{DispatchOutcome, Relayer, ResumeOutcome, Simulation},
};

/// What a contract call returns: its output, or the data it reverted with.
pub type CallResult = std::result::Result<Bytes, Bytes>;

/// Revert data carrying a Solidity `Error(string)`.
pub fn revert(reason: &str) -> Bytes {
    Revert::from(reason).abi_encode().into()
}

/// A contract hosted by a [`Chain`].
pub trait Contract: Send + Sync {
    /// Executes a state-changing call.
    fn call(&self, ctx: &mut CallContext<'_>, input: &[u8]) -> CallResult;

    /// Executes a side-effect-free call on behalf of `caller`.
    fn view(&self, _caller: Address, _input: &[u8]) -> CallResult {
        Err(revert("no view entry point"))
    }
}

/// The outcome of a committed transaction.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub block_number: u64,
    pub outcome: CallOutcome,
    pub logs: Vec<ChainLog>,
}

struct Host {
    chain_id: u64,
    relayer_address: Address,
    block_number: u64,
    logs: Vec<ChainLog>,
    pending: Vec<Log>,
    contracts: HashMap<Address, Arc<dyn Contract>>,
}

impl Host {
    fn view(&self, caller: Address, to: Address, input: &[u8]) -> CallResult {
        match self.contracts.get(&to) {
            Some(contract) => contract.view(caller, input),
            None => Ok(Bytes::new()),
        }
    }

    fn commit(&mut self) -> (u64, Vec<ChainLog>) {
        self.block_number += 1;
        let block_number = self.block_number;
        let logs: Vec<_> = self
            .pending
            .drain(..)
            .enumerate()
            .map(|(log_index, inner)| ChainLog {
                block_number,
                log_index: log_index as u64,
                inner,
            })
            .collect();
        self.logs.extend(logs.iter().cloned());
        (block_number, logs)
    }
}

struct ChainState {
    relayer: Relayer,
    host: Host,
}

/// The execution environment of a contract call.
pub struct CallContext<'a> {
    relayer: &'a Relayer,
    host: &'a mut Host,
    sender: Address,
    this: Address,
    relayed_caller: Option<Address>,
}

impl<'a> CallContext<'a> {
    pub fn chain_id(&self) -> u64 {
        self.host.chain_id
    }

    /// The immediate caller.
    pub fn sender(&self) -> Address {
        self.sender
    }

    /// The address of the executing contract.
    pub fn this(&self) -> Address {
        self.this
    }

    /// The address of the relay on this chain.
    pub fn relayer_address(&self) -> Address {
        self.host.relayer_address
    }

    /// When the executing call was dispatched by the relay, the caller on the other chain which requested it.
    pub fn relayed_caller(&self) -> Option<Address> {
        self.relayed_caller
    }

    pub(crate) fn relayer(&self) -> &'a Relayer {
        self.relayer
    }

    fn enter(&mut self, sender: Address, this: Address, relayed_caller: Option<Address>) -> CallContext<'_> {
        CallContext {
            relayer: self.relayer,
            host: &mut *self.host,
            sender,
            this,
            relayed_caller,
        }
    }

    fn invoke(&mut self, to: Address, input: &[u8], relayed_caller: Option<Address>) -> CallResult {
        let Some(contract) = self.host.contracts.get(&to).cloned() else {
            return Ok(Bytes::new());
        };
        let mark = self.host.pending.len();
        let sender = self.this;
        let result = contract.call(&mut self.enter(sender, to, relayed_caller), input);
        if result.is_err() {
            self.host.pending.truncate(mark);
        }
        result
    }

    /// Calls `to` with the executing contract as the sender.
    pub fn call(&mut self, to: Address, input: &[u8]) -> CallResult {
        self.invoke(to, input, None)
    }

    /// Calls `to` on behalf of `caller` on the other chain.
    pub(crate) fn call_relayed(&mut self, caller: Address, to: Address, input: &[u8]) -> CallResult {
        self.invoke(to, input, Some(caller))
    }

    /// Runs the side-effect-free entry point of `to` on behalf of `caller`.
    pub fn view(&self, caller: Address, to: Address, input: &[u8]) -> CallResult {
        self.host.view(caller, to, input)
    }

    /// Emits `event` from the executing contract.
    pub fn emit<E: SolEvent>(&mut self, event: &E) {
        self.host.pending.push(Log {
            address: self.this,
            data: event.encode_log_data(),
        });
    }

    /// Asks the relay to call `callee` on the other chain with the executing contract as the caller. The result
    /// is delivered by calling `callback` on the executing contract. Returns the nonce of the request.
    pub fn relay(
        &mut self,
        callee: Address,
        payload: Bytes,
        readonly: bool,
        callback: Selector,
    ) -> Result<U256, RelayError> {
        let caller = self.this;
        let relayer_address = self.host.relayer_address;
        let relayer = self.relayer;
        relayer.relay(
            &mut self.enter(caller, relayer_address, None),
            callee,
            payload,
            readonly,
            callback,
        )
    }
}

/// A chain hosting one relay.
pub struct Chain {
    chain_id: u64,
    relayer_address: Address,
    state: Mutex<ChainState>,
}

impl Chain {
    pub fn new(chain_id: u64, relayer_address: Address, relayer: Relayer) -> Chain {
        Chain {
            chain_id,
            relayer_address,
            state: Mutex::new(ChainState {
                relayer,
                host: Host {
                    chain_id,
                    relayer_address,
                    block_number: 0,
                    logs: Vec::new(),
                    pending: Vec::new(),
                    contracts: HashMap::new(),
                },
            }),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn relayer_address(&self) -> Address {
        self.relayer_address
    }

    pub fn deploy(&self, address: Address, contract: Arc<dyn Contract>) {
        let mut state = self.state.lock();
        if address == state.host.relayer_address {
            warn!(%address, "refusing to deploy over the relay");
            return;
        }
        state.host.contracts.insert(address, contract);
        debug!(chain_id = self.chain_id, %address, "deployed contract");
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().host.block_number
    }

    /// Logs in blocks `from_block..=to_block`, in order.
    pub fn logs(&self, from_block: u64, to_block: u64) -> Vec<ChainLog> {
        let state = self.state.lock();
        let start = state
            .host
            .logs
            .partition_point(|log| log.block_number < from_block);
        state.host.logs[start..]
            .iter()
            .take_while(|log| log.block_number <= to_block)
            .cloned()
            .collect()
    }

    pub fn validators(&self) -> ValidatorRegistry {
        self.state.lock().relayer.registry().clone()
    }

    pub fn nonce_record(&self, caller: Address, nonce: U256) -> Result<NonceRecord, RelayError> {
        Ok(self.state.lock().relayer.ledger().record(caller, nonce)?)
    }

    /// Runs `f` as a transaction sent by `from` to `to`. The transaction commits a block unless `f` fails; a
    /// reverted call still commits, without its logs.
    fn execute<T>(
        &self,
        from: Address,
        to: Address,
        f: impl FnOnce(&mut CallContext<'_>) -> Result<T, RelayError>,
    ) -> Result<(T, u64, Vec<ChainLog>), RelayError> {
        let mut state = self.state.lock();
        let ChainState { relayer, host } = &mut *state;
        host.pending.clear();
        let mut ctx = CallContext {
            relayer: &*relayer,
            host: &mut *host,
            sender: from,
            this: to,
            relayed_caller: None,
        };
        match f(&mut ctx) {
            Ok(value) => {
                let (block_number, logs) = host.commit();
                Ok((value, block_number, logs))
            }
            Err(e) => {
                host.pending.clear();
                Err(e)
            }
        }
    }

    /// Sends a transaction from an externally owned account.
    pub fn transact(&self, from: Address, to: Address, input: &[u8]) -> Receipt {
        let result = self.execute(from, to, |ctx| {
            let Some(contract) = ctx.host.contracts.get(&to).cloned() else {
                return Ok(Ok(Bytes::new()));
            };
            let result = contract.call(ctx, input);
            if result.is_err() {
                ctx.host.pending.clear();
            }
            Ok(result)
        });
        match result {
            Ok((result, block_number, logs)) => Receipt {
                block_number,
                outcome: result.into(),
                logs,
            },
            Err(e) => Receipt {
                block_number: self.block_number(),
                outcome: CallOutcome::reverted(revert(&e.to_string())),
                logs: Vec::new(),
            },
        }
    }

    /// Runs the side-effect-free entry point of `to` on behalf of `caller`.
    pub fn view(&self, caller: Address, to: Address, input: &[u8]) -> CallResult {
        self.state.lock().host.view(caller, to, input)
    }

    pub fn echo(
        &self,
        from: Address,
        digest: B256,
        index: u16,
        signature: Bytes,
    ) -> Result<Receipt, RelayError> {
        let relayer_address = self.relayer_address;
        let (_, block_number, logs) = self.execute(from, relayer_address, |ctx| {
            ctx.relayer().echo(ctx, digest, index, signature);
            Ok(())
        })?;
        Ok(Receipt {
            block_number,
            outcome: CallOutcome::succeeded(Bytes::new()),
            logs,
        })
    }

    pub fn simulate_dispatch(
        &self,
        request: &RelayRequest,
        proof: &QuorumProof,
    ) -> Result<Simulation, RelayError> {
        self.state.lock().relayer.simulate_dispatch(request, proof)
    }

    pub fn dispatch(
        &self,
        from: Address,
        request: &RelayRequest,
        proof: &QuorumProof,
    ) -> Result<DispatchOutcome, RelayError> {
        let relayer_address = self.relayer_address;
        let (outcome, _, _) = self.execute(from, relayer_address, |ctx| {
            ctx.relayer().dispatch(ctx, request, proof)
        })?;
        Ok(outcome)
    }

    /// The relay's read-only entry point. Runs `callee`'s side-effect-free entry point on behalf of `caller` and
    /// records nothing.
    pub fn query(&self, caller: Address, callee: Address, payload: &[u8]) -> CallOutcome {
        let outcome = CallOutcome::from(self.view(caller, callee, payload));
        debug!(
            chain_id = self.chain_id,
            %caller,
            %callee,
            success = outcome.success,
            "answered query"
        );
        outcome
    }

    pub fn simulate_resume(
        &self,
        message: &ResultMessage,
        proof: &QuorumProof,
    ) -> Result<Simulation, RelayError> {
        self.state.lock().relayer.simulate_resume(message, proof)
    }

    pub fn resume(
        &self,
        from: Address,
        message: &ResultMessage,
        proof: &QuorumProof,
    ) -> Result<ResumeOutcome, RelayError> {
        let relayer_address = self.relayer_address;
        let (outcome, _, _) = self.execute(from, relayer_address, |ctx| {
            ctx.relayer().resume(ctx, message, proof)
        })?;
        Ok(outcome)
    }
}
