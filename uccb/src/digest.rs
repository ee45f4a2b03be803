//! Deterministic encoding of the two messages validators sign.
//!
//! A message is the ABI parameter encoding of its fields. Its digest is the EIP-191 personal-message hash of
//! that encoding, so any validator signing the message with a standard wallet produces a signature which
//! recovers against the digest.

use alloy::{
    primitives::{Address, B256, Bytes, Selector, U256, eip191_hash_message},
    sol_types::SolValue,
};

/// The message signed to authorize a call on the target chain.
pub fn encode_call(
    caller: Address,
    callee: Address,
    payload: &Bytes,
    readonly: bool,
    callback: Selector,
    nonce: U256,
) -> Vec<u8> {
    (caller, callee, payload.clone(), readonly, callback, nonce).abi_encode_params()
}

pub fn call_digest(
    caller: Address,
    callee: Address,
    payload: &Bytes,
    readonly: bool,
    callback: Selector,
    nonce: U256,
) -> B256 {
    eip191_hash_message(encode_call(
        caller, callee, payload, readonly, callback, nonce,
    ))
}

/// The message signed to authorize delivery of a result back to its caller.
pub fn encode_result(
    caller: Address,
    callback: Selector,
    success: bool,
    result: &Bytes,
    nonce: U256,
) -> Vec<u8> {
    (caller, callback, success, result.clone(), nonce).abi_encode_params()
}

pub fn result_digest(
    caller: Address,
    callback: Selector,
    success: bool,
    result: &Bytes,
    nonce: U256,
) -> B256 {
    eip191_hash_message(encode_result(caller, callback, success, result, nonce))
}
