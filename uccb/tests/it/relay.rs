//! The relay entry points driven by hand: validators' signatures are produced directly rather than by agents.

use std::sync::Arc;

use alloy::{
    primitives::{Bytes, U256},
    sol_types::{SolCall, SolValue},
};
use uccb::{
    chain::{CallContext, CallResult, Contract, revert},
    client::ChainClient,
    contracts::{
        target::ITarget,
        twin::{ITwin, TwinResult},
    },
    error::RelayError,
    event::{BridgeEvent, CallOutcome, Dispatched, QuorumProof, ResultMessage, Resumed},
    query::{QueryError, QueryPolicy, ReadOnlyQuery},
    relayer::{DispatchOutcome, ResumeOutcome, Simulation},
};

use crate::{Network, TARGET_ADDRESS, TWIN_ADDRESS, events};

#[uccb_macros::test]
async fn call_round_trip(network: Network) {
    let twin = network.deploy_demo();
    let user = network.random_address();

    let request = network.start_demo(123, false);
    assert_eq!(request.caller, TWIN_ADDRESS);
    assert_eq!(request.callee, TARGET_ADDRESS);
    assert_eq!(request.nonce, U256::ZERO);
    assert_eq!(request.callback, ITwin::finishCall::SELECTOR);

    let proof = network.proof(&[0, 1, 2], &request.message());
    let outcome = network.target.dispatch(user, &request, &proof).unwrap();
    let expected = CallOutcome::succeeded(U256::from(124).abi_encode().into());
    assert_eq!(outcome, DispatchOutcome::Executed(expected.clone()));

    let dispatched = events::<Dispatched>(&network.target, network.target.relayer_address());
    assert_eq!(dispatched.len(), 1);
    assert!(dispatched[0].success);
    assert_eq!(dispatched[0].response, expected.result);

    let message = ResultMessage::for_request(&request, expected);
    let proof = network.proof(&[3, 1, 2], &message.message());
    let outcome = network.source.resume(user, &message, &proof).unwrap();
    assert!(matches!(outcome, ResumeOutcome::Delivered(ref o) if o.success));

    assert_eq!(
        twin.results(),
        vec![(U256::ZERO, TwinResult::Succeeded(U256::from(124)))]
    );
    let resumed = events::<Resumed>(&network.source, network.source.relayer_address());
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].call, message.callback_invocation());
    assert_eq!(
        events::<ITwin::Succeeded>(&network.source, TWIN_ADDRESS)[0].num,
        U256::from(124)
    );

    let record = network.target.nonce_record(TWIN_ADDRESS, U256::ZERO).unwrap();
    assert!(record.dispatched.is_some());
    assert!(!record.resolved);
    let record = network.source.nonce_record(TWIN_ADDRESS, U256::ZERO).unwrap();
    assert!(record.dispatched.is_none());
    assert!(record.resolved);
}

#[uccb_macros::test]
async fn callee_failure_is_delivered(network: Network) {
    let twin = network.deploy_demo();
    let user = network.random_address();

    let request = network.start_demo(1789, false);
    let proof = network.proof(&[0, 1, 2, 3], &request.message());
    let outcome = network.target.dispatch(user, &request, &proof).unwrap();
    let expected = CallOutcome::reverted(revert("Too large"));
    assert_eq!(outcome, DispatchOutcome::Executed(expected.clone()));

    let dispatched = events::<Dispatched>(&network.target, network.target.relayer_address());
    assert!(!dispatched[0].success);
    assert_eq!(dispatched[0].response, revert("Too large"));

    let message = ResultMessage::for_request(&request, expected);
    let proof = network.proof(&[0, 1, 2], &message.message());
    network.source.resume(user, &message, &proof).unwrap();

    assert_eq!(
        twin.results(),
        vec![(U256::ZERO, TwinResult::Failed("Too large".to_string()))]
    );
    assert_eq!(
        events::<ITwin::Failed>(&network.source, TWIN_ADDRESS)[0].error,
        "Too large"
    );
}

#[uccb_macros::test]
async fn duplicates_are_reported_not_repeated(network: Network) {
    let twin = network.deploy_demo();
    let user = network.random_address();

    let request = network.start_demo(5, false);
    let proof = network.proof(&[0, 1, 2], &request.message());
    let first = network.target.dispatch(user, &request, &proof).unwrap();

    // Another quorum over the same request changes nothing.
    let other_proof = network.proof(&[1, 2, 3], &request.message());
    assert_eq!(
        network.target.simulate_dispatch(&request, &other_proof).unwrap(),
        Simulation::AlreadyApplied
    );
    let second = network
        .target
        .dispatch(network.random_address(), &request, &other_proof)
        .unwrap();
    assert_eq!(
        second,
        DispatchOutcome::AlreadyDispatched(first.outcome().clone())
    );
    assert_eq!(
        events::<Dispatched>(&network.target, network.target.relayer_address()).len(),
        1
    );

    let message = ResultMessage::for_request(&request, first.outcome().clone());
    let proof = network.proof(&[0, 1, 2], &message.message());
    assert_eq!(
        network.source.simulate_resume(&message, &proof).unwrap(),
        Simulation::WouldApply
    );
    network.source.resume(user, &message, &proof).unwrap();
    assert_eq!(
        network.source.simulate_resume(&message, &proof).unwrap(),
        Simulation::AlreadyApplied
    );
    assert_eq!(
        network.source.resume(user, &message, &proof).unwrap(),
        ResumeOutcome::AlreadyResolved
    );
    // A resolved nonce is reported as such even without a valid quorum.
    assert_eq!(
        network
            .source
            .resume(user, &message, &QuorumProof::default())
            .unwrap(),
        ResumeOutcome::AlreadyResolved
    );

    assert_eq!(twin.results().len(), 1);
    assert_eq!(
        events::<Resumed>(&network.source, network.source.relayer_address()).len(),
        1
    );
}

#[uccb_macros::test]
async fn bad_quorums_are_rejected(network: Network) {
    network.deploy_demo();
    let user = network.random_address();
    let request = network.start_demo(7, false);
    let message = request.message();

    let assert_rejected = |proof: QuorumProof, check: fn(&RelayError) -> bool| {
        let error = network.target.dispatch(user, &request, &proof).unwrap_err();
        assert!(check(&error), "{error:?}");
        assert!(network.target.simulate_dispatch(&request, &proof).is_err());
    };

    assert_rejected(network.proof(&[0, 1], &message), |e| {
        matches!(
            e,
            RelayError::InsufficientQuorum {
                distinct: 2,
                required: 3
            }
        )
    });
    assert_rejected(network.proof(&[0, 0, 1], &message), |e| {
        matches!(e, RelayError::InsufficientQuorum { distinct: 2, .. })
    });

    let mut unknown = network.proof(&[0, 1, 2], &message);
    unknown.signer_indices[2] = 7;
    assert_rejected(unknown, |e| matches!(e, RelayError::UnknownValidator(7)));

    let mut swapped = network.proof(&[0, 1, 2], &message);
    swapped.signatures.swap(0, 1);
    assert_rejected(swapped, |e| matches!(e, RelayError::InvalidSignature(0)));

    let mut tampered = request.clone();
    tampered.payload = ITarget::testCall {
        num: U256::from(8),
    }
    .abi_encode()
    .into();
    let error = network
        .target
        .dispatch(user, &tampered, &network.proof(&[0, 1, 2], &message))
        .unwrap_err();
    assert!(matches!(error, RelayError::InvalidSignature(0)), "{error:?}");

    let mut short = network.proof(&[0, 1, 2], &message);
    short.signatures.pop();
    assert_rejected(short, |e| {
        matches!(
            e,
            RelayError::MalformedQuorum {
                indices: 3,
                signatures: 2
            }
        )
    });

    let mut garbage = network.proof(&[0, 1, 2], &message);
    garbage.signatures[1] = Bytes::from_static(&[0xff; 10]);
    assert_rejected(garbage, |e| matches!(e, RelayError::InvalidSignature(1)));

    // Nothing was recorded and nothing was logged.
    let record = network.target.nonce_record(TWIN_ADDRESS, request.nonce).unwrap();
    assert_eq!(record.dispatched, None);
    assert!(!record.reserved);
    assert!(
        events::<Dispatched>(&network.target, network.target.relayer_address()).is_empty()
    );

    // A forged result is rejected the same way.
    let real = ResultMessage::for_request(
        &request,
        CallOutcome::succeeded(U256::from(8).abi_encode().into()),
    );
    let proof = network.proof(&[0, 1, 2], &real.message());
    let mut forged = real.clone();
    forged.outcome = CallOutcome::succeeded(U256::from(1_000_000).abi_encode().into());
    let error = network.source.resume(user, &forged, &proof).unwrap_err();
    assert!(matches!(error, RelayError::InvalidSignature(0)), "{error:?}");
    assert!(
        !network
            .source
            .nonce_record(TWIN_ADDRESS, request.nonce)
            .unwrap()
            .resolved
    );
}

#[uccb_macros::test]
async fn readonly_call_is_queried(network: Network) {
    let twin = network.deploy_demo();
    let request = network.start_demo(123, true);
    assert!(request.readonly);

    let expected = CallOutcome::succeeded(U256::from(124).abi_encode().into());
    assert_eq!(
        network
            .target
            .query(request.caller, request.callee, &request.payload),
        expected
    );

    // Each validator samples its own endpoint. Here they all see the same chain.
    let endpoints: Vec<Arc<dyn ChainClient>> = (0..4)
        .map(|_| network.target.clone() as Arc<dyn ChainClient>)
        .collect();
    let query = ReadOnlyQuery {
        caller: request.caller,
        callee: request.callee,
        payload: request.payload.to_vec(),
    };
    let quorum_size = network.registry().quorum_size();
    assert_eq!(
        query
            .run(&endpoints, quorum_size, QueryPolicy::Unanimous)
            .await,
        Ok(expected.clone())
    );
    assert_eq!(
        query
            .run(&endpoints[..2], quorum_size, QueryPolicy::Unanimous)
            .await,
        Err(QueryError::NotEnoughSamples {
            got: 2,
            required: 3
        })
    );

    // Queries leave no trace on the target chain.
    assert_eq!(network.target.block_number(), 0);

    let message = ResultMessage::for_request(&request, expected);
    let proof = network.proof(&[0, 1, 2], &message.message());
    network
        .source
        .resume(network.random_address(), &message, &proof)
        .unwrap();
    assert_eq!(
        twin.results(),
        vec![(U256::ZERO, TwinResult::Succeeded(U256::from(124)))]
    );
}

#[uccb_macros::test]
async fn nonces_progress_independently(network: Network) {
    let twin = network.deploy_demo();
    let user = network.random_address();

    let requests: Vec<_> = [10, 2000, 30]
        .into_iter()
        .map(|num| network.start_demo(num, false))
        .collect();
    let nonces: Vec<_> = requests.iter().map(|r| r.nonce).collect();
    assert_eq!(nonces, vec![U256::from(0), U256::from(1), U256::from(2)]);

    let mut messages = Vec::new();
    for i in [2, 0, 1] {
        let request = &requests[i];
        let proof = network.proof(&[1, 2, 3], &request.message());
        let outcome = network.target.dispatch(user, request, &proof).unwrap();
        messages.push(ResultMessage::for_request(request, outcome.outcome().clone()));
    }
    for message in messages.iter().rev() {
        let proof = network.proof(&[0, 2, 3], &message.message());
        network.source.resume(user, message, &proof).unwrap();
    }

    let mut results = twin.results();
    results.sort_by_key(|(nonce, _)| *nonce);
    assert_eq!(
        results,
        vec![
            (U256::from(0), TwinResult::Succeeded(U256::from(11))),
            (U256::from(1), TwinResult::Failed("Too large".to_string())),
            (U256::from(2), TwinResult::Succeeded(U256::from(31))),
        ]
    );
}

#[uccb_macros::test]
async fn callbacks_only_accept_the_relay(network: Network) {
    let twin = network.deploy_demo();
    let input = ITwin::finishCall {
        success: true,
        res: U256::from(1).abi_encode().into(),
        nonce: U256::ZERO,
    }
    .abi_encode();
    let receipt = network
        .source
        .transact(network.random_address(), TWIN_ADDRESS, &input);
    assert_eq!(
        receipt.outcome,
        CallOutcome::reverted(revert("Must be called by the relay"))
    );
    assert!(twin.results().is_empty());
}

/// Relays `Target.test(num)` and refuses whatever comes back.
struct Sulky;

impl Contract for Sulky {
    fn call(&self, ctx: &mut CallContext<'_>, input: &[u8]) -> CallResult {
        if ctx.sender() == ctx.relayer_address() {
            return Err(revert("not interested"));
        }
        let num = U256::abi_decode(input, true).map_err(|e| revert(&e.to_string()))?;
        let nonce = ctx
            .relay(
                TARGET_ADDRESS,
                ITarget::testCall { num }.abi_encode().into(),
                false,
                ITwin::finishCall::SELECTOR.into(),
            )
            .map_err(|e| revert(&e.to_string()))?;
        Ok(nonce.abi_encode().into())
    }
}

#[uccb_macros::test]
async fn failing_callback_still_resolves(network: Network) {
    network.deploy_demo();
    let user = network.random_address();
    let sulky = network.random_address();
    network.source.deploy(sulky, Arc::new(Sulky));

    let receipt = network
        .source
        .transact(user, sulky, &U256::from(41).abi_encode());
    assert!(receipt.outcome.success, "{:?}", receipt.outcome);
    let request = receipt
        .logs
        .iter()
        .find_map(|log| match BridgeEvent::try_from_log(&log.inner) {
            Ok(Some(BridgeEvent::Relayed(request))) => Some(request),
            _ => None,
        })
        .unwrap();

    let proof = network.proof(&[0, 1, 3], &request.message());
    let outcome = network.target.dispatch(user, &request, &proof).unwrap();
    assert!(outcome.outcome().success);

    let message = ResultMessage::for_request(&request, outcome.outcome().clone());
    let proof = network.proof(&[0, 2, 3], &message.message());
    assert_eq!(
        network.source.resume(user, &message, &proof).unwrap(),
        ResumeOutcome::Delivered(CallOutcome::reverted(revert("not interested")))
    );
    assert!(network.source.nonce_record(sulky, request.nonce).unwrap().resolved);

    let resumed = events::<Resumed>(&network.source, network.source.relayer_address());
    assert_eq!(resumed.len(), 1);
    assert!(!resumed[0].success);
    assert_eq!(resumed[0].response, revert("not interested"));

    assert_eq!(
        network.source.resume(user, &message, &proof).unwrap(),
        ResumeOutcome::AlreadyResolved
    );
    assert_eq!(
        events::<Resumed>(&network.source, network.source.relayer_address()).len(),
        1
    );
}
