//! Native reference contracts used to exercise the relay end to end.

use alloy::primitives::Bytes;

use crate::chain::{CallResult, revert};

fn unknown_call(input: &[u8]) -> CallResult {
    let selector = input.get(..4).map(Bytes::copy_from_slice).unwrap_or_default();
    Err(revert(&format!("unknown call {selector}")))
}

pub mod target {
    use alloy::{
        primitives::{Address, U256},
        sol,
        sol_types::{SolCall, SolValue},
    };

    use super::unknown_call;
    use crate::chain::{CallContext, CallResult, Contract, revert};

    sol! {
        #[derive(Debug)]
        interface ITarget {
            function test(uint256 num) external returns (uint256);
        }
    }

    /// Returns its argument plus one, and reverts with "Too large" from 1000 on.
    #[derive(Debug, Default)]
    pub struct Target;

    impl Target {
        pub const LIMIT: u64 = 1000;

        fn test(num: U256) -> CallResult {
            if num >= U256::from(Self::LIMIT) {
                return Err(revert("Too large"));
            }
            Ok((num + U256::from(1)).abi_encode().into())
        }
    }

    impl Contract for Target {
        fn call(&self, _ctx: &mut CallContext<'_>, input: &[u8]) -> CallResult {
            self.view(Address::ZERO, input)
        }

        fn view(&self, _caller: Address, input: &[u8]) -> CallResult {
            match ITarget::testCall::abi_decode(input, true) {
                Ok(call) => Self::test(call.num),
                Err(_) => unknown_call(input),
            }
        }
    }
}

pub mod twin {
    use alloy::{
        primitives::{Address, Bytes, U256},
        sol,
        sol_types::{Revert, SolCall, SolError, SolValue},
    };
    use parking_lot::Mutex;
    use tracing::*;

    use super::{target::ITarget, unknown_call};
    use crate::chain::{CallContext, CallResult, Contract, revert};

    sol! {
        #[derive(Debug)]
        interface ITwin {
            function start(address target, uint256 num, bool readonly) external returns (uint256);
            function finish(bool success, bytes res, uint256 nonce) external;

            event Succeeded(uint256 num);
            event Failed(string error);
        }
    }

    /// What a `finish` callback delivered.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TwinResult {
        Succeeded(U256),
        Failed(String),
    }

    /// Relays `test(num)` to a target on the other chain and records what comes back.
    #[derive(Debug, Default)]
    pub struct Twin {
        results: Mutex<Vec<(U256, TwinResult)>>,
    }

    impl Twin {
        /// The input of a transaction starting a relayed `test(num)` call.
        pub fn start_input(target: Address, num: u64, readonly: bool) -> Bytes {
            ITwin::startCall {
                target,
                num: U256::from(num),
                readonly,
            }
            .abi_encode()
            .into()
        }

        /// Results delivered so far, by nonce, in delivery order.
        pub fn results(&self) -> Vec<(U256, TwinResult)> {
            self.results.lock().clone()
        }

        fn start(ctx: &mut CallContext<'_>, call: ITwin::startCall) -> CallResult {
            let payload = ITarget::testCall { num: call.num }.abi_encode();
            let nonce = ctx
                .relay(
                    call.target,
                    payload.into(),
                    call.readonly,
                    ITwin::finishCall::SELECTOR.into(),
                )
                .map_err(|e| revert(&e.to_string()))?;
            Ok(nonce.abi_encode().into())
        }

        fn finish(&self, ctx: &mut CallContext<'_>, call: ITwin::finishCall) -> CallResult {
            if ctx.sender() != ctx.relayer_address() {
                return Err(revert("Must be called by the relay"));
            }

            let result = if call.success {
                match U256::abi_decode(&call.res, true) {
                    Ok(num) => {
                        ctx.emit(&ITwin::Succeeded { num });
                        TwinResult::Succeeded(num)
                    }
                    Err(e) => return Err(revert(&format!("bad result: {e}"))),
                }
            } else {
                let error = Revert::abi_decode(&call.res, true)
                    .map(|revert| revert.reason)
                    .unwrap_or_default();
                ctx.emit(&ITwin::Failed {
                    error: error.clone(),
                });
                TwinResult::Failed(error)
            };
            debug!(nonce = %call.nonce, ?result, "twin finished");
            self.results.lock().push((call.nonce, result));
            Ok(Bytes::new())
        }
    }

    impl Contract for Twin {
        fn call(&self, ctx: &mut CallContext<'_>, input: &[u8]) -> CallResult {
            let Some(selector) = input.get(..4) else {
                return unknown_call(input);
            };
            if selector == ITwin::startCall::SELECTOR {
                match ITwin::startCall::abi_decode(input, true) {
                    Ok(call) => Self::start(ctx, call),
                    Err(e) => Err(revert(&e.to_string())),
                }
            } else if selector == ITwin::finishCall::SELECTOR {
                match ITwin::finishCall::abi_decode(input, true) {
                    Ok(call) => self.finish(ctx, call),
                    Err(e) => Err(revert(&e.to_string())),
                }
            } else {
                unknown_call(input)
            }
        }
    }
}
