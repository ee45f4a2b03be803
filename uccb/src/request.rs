//! A validator's view of one request as it moves through the protocol.

use std::{collections::BTreeSet, time::Instant};

use alloy::primitives::{Selector, U256};

use crate::{
    event::{CallOutcome, RelayRequest, ResultMessage},
    signatures::RequestKey,
};

/// Where a request is, as seen by one validator. Phases only move forward, and `Resolved` is absorbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Opened,
    AwaitingCallQuorum,
    Dispatched(CallOutcome),
    AwaitingResultQuorum(CallOutcome),
    Resolved,
}

impl Phase {
    fn rank(&self) -> u8 {
        match self {
            Phase::Opened => 0,
            Phase::AwaitingCallQuorum => 1,
            Phase::Dispatched(_) => 2,
            Phase::AwaitingResultQuorum(_) => 3,
            Phase::Resolved => 4,
        }
    }

    pub fn outcome(&self) -> Option<&CallOutcome> {
        match self {
            Phase::Dispatched(outcome) | Phase::AwaitingResultQuorum(outcome) => Some(outcome),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub key: RequestKey,
    /// The chain the call is executed on.
    pub target_chain_id: u64,
    /// Known once the `Relayed` entry has been seen. Validators may see the `Dispatched` entry first.
    pub request: Option<RelayRequest>,
    /// The block of the `Relayed` entry on the caller's chain.
    pub relayed_block: Option<u64>,
    pub callback: Option<Selector>,
    pub phase: Phase,
    pub opened_at: Instant,
    pub warned_stuck: bool,
}

impl Request {
    pub fn new(key: RequestKey, target_chain_id: u64) -> Self {
        Request {
            key,
            target_chain_id,
            request: None,
            relayed_block: None,
            callback: None,
            phase: Phase::Opened,
            opened_at: Instant::now(),
            warned_stuck: false,
        }
    }

    fn advance(&mut self, phase: Phase) -> bool {
        if phase.rank() > self.phase.rank() {
            self.phase = phase;
            true
        } else {
            false
        }
    }

    pub fn opened(&mut self, request: RelayRequest, block_number: u64) {
        self.callback = Some(request.callback);
        self.request = Some(request);
        self.relayed_block = Some(block_number);
    }

    pub fn readonly(&self) -> bool {
        self.request.as_ref().is_some_and(|r| r.readonly)
    }

    /// This validator has published its signature over the call.
    pub fn call_echoed(&mut self) -> bool {
        self.advance(Phase::AwaitingCallQuorum)
    }

    /// The call has an outcome, either from the target chain's `Dispatched` entry or, for read-only calls, from
    /// querying it. The first outcome sticks.
    pub fn dispatched(&mut self, outcome: CallOutcome) -> bool {
        if self.phase.outcome().is_some() {
            return false;
        }
        self.advance(Phase::Dispatched(outcome))
    }

    /// This validator has published its signature over the result.
    pub fn result_echoed(&mut self) -> bool {
        match self.phase.outcome().cloned() {
            Some(outcome) => self.advance(Phase::AwaitingResultQuorum(outcome)),
            None => false,
        }
    }

    pub fn resolve(&mut self) -> bool {
        self.advance(Phase::Resolved)
    }

    pub fn is_resolved(&self) -> bool {
        self.phase == Phase::Resolved
    }

    /// The result to sign, once the call has an outcome and the callback is known.
    pub fn result_message(&self) -> Option<ResultMessage> {
        Some(ResultMessage {
            caller: self.key.caller,
            callback: self.callback?,
            outcome: self.phase.outcome()?.clone(),
            nonce: self.key.nonce,
        })
    }
}

/// The resolved nonces of one caller: every nonce below `floor`, and the resolved ones above it.
#[derive(Debug, Default)]
pub struct ResolvedNonces {
    floor: U256,
    above: BTreeSet<U256>,
}

impl ResolvedNonces {
    pub fn insert(&mut self, nonce: U256) {
        if nonce < self.floor {
            return;
        }
        self.above.insert(nonce);
        while self.above.remove(&self.floor) {
            self.floor += U256::from(1);
        }
    }

    pub fn contains(&self, nonce: U256) -> bool {
        nonce < self.floor || self.above.contains(&nonce)
    }

    /// Nonces held individually, above the contiguous prefix.
    pub fn gaps(&self) -> usize {
        self.above.len()
    }
}
