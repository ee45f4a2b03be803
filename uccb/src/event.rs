//! Relay log entries and the protocol messages carried by them.

use alloy::{
    primitives::{Address, B256, Bytes, Log, Selector, U256},
    sol,
    sol_types::{SolEvent, SolValue},
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::digest;

sol! {
    #[derive(Debug)]
    event Relayed(address caller, address callee, bytes call, bool readonly, bytes4 callback, uint256 nonce);

    #[derive(Debug)]
    event Echoed(bytes32 indexed digest, uint16 index, bytes signature);

    #[derive(Debug)]
    event Dispatched(address indexed caller, bytes4 callback, bool success, bytes response, uint256 indexed nonce);

    #[derive(Debug)]
    event Resumed(address indexed caller, bytes call, bool success, bytes response, uint256 indexed nonce);
}

/// A call one contract asked the relay to make on another chain. Identified by `(caller, nonce)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub caller: Address,
    pub callee: Address,
    pub payload: Bytes,
    pub readonly: bool,
    pub callback: Selector,
    pub nonce: U256,
}

impl RelayRequest {
    pub fn message(&self) -> Vec<u8> {
        digest::encode_call(
            self.caller,
            self.callee,
            &self.payload,
            self.readonly,
            self.callback,
            self.nonce,
        )
    }

    pub fn digest(&self) -> B256 {
        digest::call_digest(
            self.caller,
            self.callee,
            &self.payload,
            self.readonly,
            self.callback,
            self.nonce,
        )
    }
}

impl From<Relayed> for RelayRequest {
    fn from(event: Relayed) -> Self {
        RelayRequest {
            caller: event.caller,
            callee: event.callee,
            payload: event.call,
            readonly: event.readonly,
            callback: event.callback,
            nonce: event.nonce,
        }
    }
}

impl From<&RelayRequest> for Relayed {
    fn from(request: &RelayRequest) -> Self {
        Relayed {
            caller: request.caller,
            callee: request.callee,
            call: request.payload.clone(),
            readonly: request.readonly,
            callback: request.callback,
            nonce: request.nonce,
        }
    }
}

/// What a callee returned, or the data it reverted with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallOutcome {
    pub success: bool,
    pub result: Bytes,
}

impl CallOutcome {
    pub fn succeeded(result: Bytes) -> Self {
        CallOutcome {
            success: true,
            result,
        }
    }

    pub fn reverted(data: Bytes) -> Self {
        CallOutcome {
            success: false,
            result: data,
        }
    }
}

impl From<std::result::Result<Bytes, Bytes>> for CallOutcome {
    fn from(result: std::result::Result<Bytes, Bytes>) -> Self {
        match result {
            Ok(output) => CallOutcome::succeeded(output),
            Err(data) => CallOutcome::reverted(data),
        }
    }
}

/// The outcome of a dispatched call, addressed back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub caller: Address,
    pub callback: Selector,
    pub outcome: CallOutcome,
    pub nonce: U256,
}

impl ResultMessage {
    pub fn for_request(request: &RelayRequest, outcome: CallOutcome) -> Self {
        ResultMessage {
            caller: request.caller,
            callback: request.callback,
            outcome,
            nonce: request.nonce,
        }
    }

    pub fn message(&self) -> Vec<u8> {
        digest::encode_result(
            self.caller,
            self.callback,
            self.outcome.success,
            &self.outcome.result,
            self.nonce,
        )
    }

    pub fn digest(&self) -> B256 {
        digest::result_digest(
            self.caller,
            self.callback,
            self.outcome.success,
            &self.outcome.result,
            self.nonce,
        )
    }

    /// The call made on the caller to deliver this result: `callback ‖ abi(success, result, nonce)`.
    pub fn callback_invocation(&self) -> Bytes {
        let mut invocation = self.callback.to_vec();
        invocation.extend(
            (
                self.outcome.success,
                self.outcome.result.clone(),
                self.nonce,
            )
                .abi_encode_params(),
        );
        invocation.into()
    }
}

impl From<Dispatched> for ResultMessage {
    fn from(event: Dispatched) -> Self {
        ResultMessage {
            caller: event.caller,
            callback: event.callback,
            outcome: CallOutcome {
                success: event.success,
                result: event.response,
            },
            nonce: event.nonce,
        }
    }
}

/// Signer indices with their signatures, as submitted to `dispatch` and `resume`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumProof {
    pub signer_indices: Vec<u16>,
    pub signatures: Vec<Bytes>,
}

/// One validator's signature over a digest, as published by `echo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRecord {
    pub digest: B256,
    pub index: u16,
    pub signature: Bytes,
}

impl From<Echoed> for EchoRecord {
    fn from(event: Echoed) -> Self {
        EchoRecord {
            digest: event.digest,
            index: event.index,
            signature: event.signature,
        }
    }
}

/// A delivered result, as logged by `resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumedRecord {
    pub caller: Address,
    pub invocation: Bytes,
    pub callback_outcome: CallOutcome,
    pub nonce: U256,
}

impl From<Resumed> for ResumedRecord {
    fn from(event: Resumed) -> Self {
        ResumedRecord {
            caller: event.caller,
            invocation: event.call,
            callback_outcome: CallOutcome {
                success: event.success,
                result: event.response,
            },
            nonce: event.nonce,
        }
    }
}

/// A log entry as stored by a chain, with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub block_number: u64,
    pub log_index: u64,
    pub inner: Log,
}

/// A decoded relay log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeEvent {
    Relayed(RelayRequest),
    Echoed(EchoRecord),
    Dispatched(ResultMessage),
    Resumed(ResumedRecord),
}

impl BridgeEvent {
    /// Decodes a relay log entry. Returns `Ok(None)` for logs which are not relay events.
    pub fn try_from_log(log: &Log) -> Result<Option<BridgeEvent>> {
        let Some(topic) = log.data.topics().first() else {
            return Ok(None);
        };

        let event = if *topic == Relayed::SIGNATURE_HASH {
            BridgeEvent::Relayed(Relayed::decode_log_data(&log.data, true)?.into())
        } else if *topic == Echoed::SIGNATURE_HASH {
            BridgeEvent::Echoed(Echoed::decode_log_data(&log.data, true)?.into())
        } else if *topic == Dispatched::SIGNATURE_HASH {
            BridgeEvent::Dispatched(Dispatched::decode_log_data(&log.data, true)?.into())
        } else if *topic == Resumed::SIGNATURE_HASH {
            BridgeEvent::Resumed(Resumed::decode_log_data(&log.data, true)?.into())
        } else {
            return Ok(None);
        };

        Ok(Some(event))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::Relayed(_) => "Relayed",
            BridgeEvent::Echoed(_) => "Echoed",
            BridgeEvent::Dispatched(_) => "Dispatched",
            BridgeEvent::Resumed(_) => "Resumed",
        }
    }
}
