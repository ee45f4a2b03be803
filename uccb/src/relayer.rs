//! The relay: the entry points callers and validators use on one chain.
//!
//! `relay` opens a request, `echo` publishes a validator signature, `dispatch` executes an authorized call at
//! most once, and `resume` delivers an authorized result to its caller at most once. The read-only entry point
//! lives on [`crate::chain::Chain::query`] since it touches no relay state.

use alloy::primitives::{Address, B256, Bytes, Selector, U256};
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};
use tracing::*;

use crate::{
    chain::CallContext,
    error::{RelayError, RevertError},
    event::{CallOutcome, Dispatched, Echoed, QuorumProof, RelayRequest, Relayed, ResultMessage, Resumed},
    ledger::NonceLedger,
    registry::ValidatorRegistry,
};

/// What a submitted `dispatch` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The call was executed by this submission.
    Executed(CallOutcome),
    /// The nonce had already been dispatched. Carries the recorded outcome.
    AlreadyDispatched(CallOutcome),
}

impl DispatchOutcome {
    pub fn outcome(&self) -> &CallOutcome {
        match self {
            DispatchOutcome::Executed(outcome) | DispatchOutcome::AlreadyDispatched(outcome) => outcome,
        }
    }
}

/// What a submitted `resume` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The result was delivered by this submission. Carries what the callback returned.
    Delivered(CallOutcome),
    /// The nonce had already been resolved.
    AlreadyResolved,
}

/// The effect a submission would have if sent now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Simulation {
    WouldApply,
    AlreadyApplied,
}

struct RelayMetrics {
    dispatches: Counter<u64>,
    resumes: Counter<u64>,
    duplicates: Counter<u64>,
    rejections: Counter<u64>,
}

impl RelayMetrics {
    fn new(meter: &Meter) -> Self {
        RelayMetrics {
            dispatches: meter
                .u64_counter("uccb.relay.dispatches")
                .with_description("Calls executed by dispatch")
                .build(),
            resumes: meter
                .u64_counter("uccb.relay.resumes")
                .with_description("Results delivered by resume")
                .build(),
            duplicates: meter
                .u64_counter("uccb.relay.duplicates")
                .with_description("Dispatch or resume submissions for nonces which were already done")
                .build(),
            rejections: meter
                .u64_counter("uccb.relay.rejections")
                .with_description("Dispatch or resume submissions rejected before changing state")
                .build(),
        }
    }
}

/// The relay hosted by one chain.
pub struct Relayer {
    chain_id: u64,
    registry: ValidatorRegistry,
    ledger: NonceLedger,
    metrics: RelayMetrics,
}

impl Relayer {
    pub fn new(chain_id: u64, registry: ValidatorRegistry, ledger: NonceLedger) -> anyhow::Result<Relayer> {
        ledger.register_validators(&registry)?;
        let meter = opentelemetry::global::meter("uccb");
        Ok(Relayer {
            chain_id,
            registry,
            ledger,
            metrics: RelayMetrics::new(&meter),
        })
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &NonceLedger {
        &self.ledger
    }

    fn attributes(&self, entry_point: &'static str) -> [KeyValue; 2] {
        [
            KeyValue::new("chain_id", self.chain_id as i64),
            KeyValue::new("entry_point", entry_point),
        ]
    }

    fn reject(&self, entry_point: &'static str, error: RelayError) -> RelayError {
        let mut attributes = self.attributes(entry_point).to_vec();
        attributes.push(KeyValue::new("error_type", error.kind()));
        self.metrics.rejections.add(1, &attributes);
        warn!(chain_id = self.chain_id, entry_point, %error, "rejected submission");
        error
    }

    /// Opens a request from `ctx.sender()` and returns its nonce.
    pub fn relay(
        &self,
        ctx: &mut CallContext<'_>,
        callee: Address,
        payload: Bytes,
        readonly: bool,
        callback: Selector,
    ) -> Result<U256, RelayError> {
        let caller = ctx.sender();
        let nonce = self.ledger.allocate_nonce(caller)?;
        let request = RelayRequest {
            caller,
            callee,
            payload,
            readonly,
            callback,
            nonce,
        };
        info!(chain_id = self.chain_id, %caller, %callee, %nonce, readonly, "relayed");
        ctx.emit(&Relayed::from(&request));
        Ok(nonce)
    }

    /// Publishes a validator's signature over `digest`. The relay does not check it; collectors do.
    pub fn echo(&self, ctx: &mut CallContext<'_>, digest: B256, index: u16, signature: Bytes) {
        trace!(chain_id = self.chain_id, %digest, index, "echoed");
        ctx.emit(&Echoed {
            digest,
            index,
            signature,
        });
    }

    /// Checks whether `dispatch` would accept `proof` and whether the nonce is still open, without executing.
    pub fn simulate_dispatch(&self, request: &RelayRequest, proof: &QuorumProof) -> Result<Simulation, RelayError> {
        self.registry.verify_quorum(&request.digest(), proof)?;
        let record = self.ledger.record(request.caller, request.nonce)?;
        if record.dispatched.is_some() {
            return Ok(Simulation::AlreadyApplied);
        }
        if record.reserved {
            return Err(RelayError::DispatchIncomplete {
                caller: request.caller,
                nonce: request.nonce,
            });
        }
        Ok(Simulation::WouldApply)
    }

    /// Executes an authorized call at most once per `(caller, nonce)`.
    ///
    /// The nonce is reserved in the ledger before the callee runs. If the outcome cannot be recorded afterwards,
    /// the reservation stays and later submissions fail with [`RelayError::DispatchIncomplete`] instead of
    /// running the call again.
    pub fn dispatch(
        &self,
        ctx: &mut CallContext<'_>,
        request: &RelayRequest,
        proof: &QuorumProof,
    ) -> Result<DispatchOutcome, RelayError> {
        self.registry
            .verify_quorum(&request.digest(), proof)
            .map_err(|e| self.reject("dispatch", e))?;

        let RelayRequest {
            caller,
            callee,
            payload,
            readonly,
            callback,
            nonce,
        } = request;

        let record = self.ledger.record(*caller, *nonce)?;
        if let Some(outcome) = record.dispatched {
            self.metrics.duplicates.add(1, &self.attributes("dispatch"));
            debug!(chain_id = self.chain_id, %caller, %nonce, "already dispatched");
            return Ok(DispatchOutcome::AlreadyDispatched(outcome));
        }
        let incomplete = RelayError::DispatchIncomplete {
            caller: *caller,
            nonce: *nonce,
        };
        // The chain lock serializes dispatches, so an unreserved nonce cannot be claimed since the check.
        if record.reserved || !self.ledger.reserve_dispatch(*caller, *nonce)? {
            return Err(self.reject("dispatch", incomplete));
        }

        let outcome = CallOutcome::from(if *readonly {
            ctx.view(*caller, *callee, payload)
        } else {
            ctx.call_relayed(*caller, *callee, payload)
        });
        match self.ledger.mark_dispatched(*caller, *nonce, &outcome) {
            Ok(true) => {}
            Ok(false) => return Err(self.reject("dispatch", incomplete)),
            Err(e) => {
                error!(
                    chain_id = self.chain_id,
                    %caller,
                    %nonce,
                    error = %e,
                    "call executed but its outcome was not recorded, the nonce stays reserved"
                );
                return Err(e.into());
            }
        }

        if outcome.success {
            info!(chain_id = self.chain_id, %caller, %callee, %nonce, "dispatched");
        } else {
            info!(
                chain_id = self.chain_id,
                %caller,
                %callee,
                %nonce,
                error = %RevertError::new(outcome.result.clone()),
                "dispatched call failed"
            );
        }
        self.metrics.dispatches.add(1, &self.attributes("dispatch"));

        ctx.emit(&Dispatched {
            caller: *caller,
            callback: *callback,
            success: outcome.success,
            response: outcome.result.clone(),
            nonce: *nonce,
        });
        Ok(DispatchOutcome::Executed(outcome))
    }

    pub fn simulate_resume(&self, message: &ResultMessage, proof: &QuorumProof) -> Result<Simulation, RelayError> {
        if self.ledger.record(message.caller, message.nonce)?.resolved {
            return Ok(Simulation::AlreadyApplied);
        }
        self.registry.verify_quorum(&message.digest(), proof)?;
        Ok(Simulation::WouldApply)
    }

    /// Delivers an authorized result to its caller at most once per `(caller, nonce)`. The nonce is resolved
    /// whatever the callback does.
    pub fn resume(
        &self,
        ctx: &mut CallContext<'_>,
        message: &ResultMessage,
        proof: &QuorumProof,
    ) -> Result<ResumeOutcome, RelayError> {
        let ResultMessage { caller, nonce, .. } = message;

        if self.ledger.record(*caller, *nonce)?.resolved {
            self.metrics.duplicates.add(1, &self.attributes("resume"));
            debug!(chain_id = self.chain_id, %caller, %nonce, "already resolved");
            return Ok(ResumeOutcome::AlreadyResolved);
        }

        self.registry
            .verify_quorum(&message.digest(), proof)
            .map_err(|e| self.reject("resume", e))?;

        let invocation = message.callback_invocation();
        let callback_outcome = CallOutcome::from(ctx.call(*caller, &invocation));
        self.ledger.mark_resolved(*caller, *nonce)?;

        if callback_outcome.success {
            info!(chain_id = self.chain_id, %caller, %nonce, "resumed");
        } else {
            warn!(
                chain_id = self.chain_id,
                %caller,
                %nonce,
                error = %RevertError::new(callback_outcome.result.clone()),
                "callback failed, nonce resolved anyway"
            );
        }
        self.metrics.resumes.add(1, &self.attributes("resume"));

        ctx.emit(&Resumed {
            caller: *caller,
            call: invocation,
            success: callback_outcome.success,
            response: callback_outcome.result.clone(),
            nonce: *nonce,
        });
        Ok(ResumeOutcome::Delivered(callback_outcome))
    }
}
