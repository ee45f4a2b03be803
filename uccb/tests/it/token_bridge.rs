//! A lock-and-mint token bridge built on the relay.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy::{
    primitives::{Address, Bytes, U256, address},
    sol,
    sol_types::{SolCall, SolValue},
};
use uccb::{
    chain::{CallContext, CallResult, Contract, revert},
    event::Dispatched,
};

use crate::{Network, events};

const TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_PROXY: Address = address!("0x000000000000000000000000000000000000a10c");
const MINT_PROXY: Address = address!("0x000000000000000000000000000000000000b417");

sol! {
    interface IProxy {
        function bridge(address to, uint256 amount) external returns (uint256);
        function release(address to, uint256 amount) external;
        function finish(bool success, bytes res, uint256 nonce) external;
    }
}

#[derive(Debug, Default)]
struct Token {
    balances: Mutex<HashMap<Address, U256>>,
}

impl Token {
    fn balance_of(&self, owner: Address) -> U256 {
        self.balances
            .lock()
            .unwrap()
            .get(&owner)
            .copied()
            .unwrap_or_default()
    }

    fn total_supply(&self) -> U256 {
        self.balances
            .lock()
            .unwrap()
            .values()
            .fold(U256::ZERO, |total, balance| total + balance)
    }

    fn mint(&self, to: Address, amount: U256) {
        *self.balances.lock().unwrap().entry(to).or_default() += amount;
    }

    fn burn(&self, from: Address, amount: U256) -> CallResult {
        let mut balances = self.balances.lock().unwrap();
        let balance = balances.entry(from).or_default();
        if *balance < amount {
            return Err(revert("insufficient balance"));
        }
        *balance -= amount;
        Ok(Bytes::new())
    }

    fn transfer(&self, from: Address, to: Address, amount: U256) -> CallResult {
        self.burn(from, amount)?;
        self.mint(to, amount);
        Ok(Bytes::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Holds the real tokens while they are bridged out.
    Lock,
    /// Issues wrapped tokens while the real ones are locked.
    Mint,
}

/// One side of the token bridge. Only accepts releases relayed from its counterpart.
#[derive(Debug)]
struct Proxy {
    mode: Mode,
    token: Arc<Token>,
    remote: Address,
    pending: Mutex<HashMap<U256, (Address, U256)>>,
    finished: Mutex<Vec<(U256, bool)>>,
}

impl Proxy {
    fn new(mode: Mode, token: Arc<Token>, remote: Address) -> Self {
        Proxy {
            mode,
            token,
            remote,
            pending: Mutex::default(),
            finished: Mutex::default(),
        }
    }

    fn finished(&self) -> Vec<(U256, bool)> {
        self.finished.lock().unwrap().clone()
    }

    fn take(&self, from: Address, this: Address, amount: U256) -> CallResult {
        match self.mode {
            Mode::Lock => self.token.transfer(from, this, amount),
            Mode::Mint => self.token.burn(from, amount),
        }
    }

    fn give(&self, this: Address, to: Address, amount: U256) -> CallResult {
        match self.mode {
            Mode::Lock => self.token.transfer(this, to, amount),
            Mode::Mint => {
                self.token.mint(to, amount);
                Ok(Bytes::new())
            }
        }
    }

    fn bridge(&self, ctx: &mut CallContext<'_>, call: IProxy::bridgeCall) -> CallResult {
        let (from, this) = (ctx.sender(), ctx.this());
        if self.token.balance_of(from) < call.amount {
            return Err(revert("insufficient balance"));
        }
        let payload = IProxy::releaseCall {
            to: call.to,
            amount: call.amount,
        }
        .abi_encode();
        let nonce = ctx
            .relay(
                self.remote,
                payload.into(),
                false,
                IProxy::finishCall::SELECTOR.into(),
            )
            .map_err(|e| revert(&e.to_string()))?;
        self.take(from, this, call.amount)?;
        self.pending
            .lock()
            .unwrap()
            .insert(nonce, (from, call.amount));
        Ok(nonce.abi_encode().into())
    }

    fn release(&self, ctx: &mut CallContext<'_>, call: IProxy::releaseCall) -> CallResult {
        if ctx.sender() != ctx.relayer_address() || ctx.relayed_caller() != Some(self.remote) {
            return Err(revert("unauthorized"));
        }
        self.give(ctx.this(), call.to, call.amount)
    }

    fn finish(&self, ctx: &mut CallContext<'_>, call: IProxy::finishCall) -> CallResult {
        if ctx.sender() != ctx.relayer_address() {
            return Err(revert("unauthorized"));
        }
        let Some((from, amount)) = self.pending.lock().unwrap().remove(&call.nonce) else {
            return Err(revert("unknown nonce"));
        };
        if !call.success {
            self.give(ctx.this(), from, amount)?;
        }
        self.finished
            .lock()
            .unwrap()
            .push((call.nonce, call.success));
        Ok(Bytes::new())
    }
}

impl Contract for Proxy {
    fn call(&self, ctx: &mut CallContext<'_>, input: &[u8]) -> CallResult {
        match input.get(..4) {
            Some(s) if s == IProxy::bridgeCall::SELECTOR => {
                let call = IProxy::bridgeCall::abi_decode(input, true)
                    .map_err(|e| revert(&e.to_string()))?;
                self.bridge(ctx, call)
            }
            Some(s) if s == IProxy::releaseCall::SELECTOR => {
                let call = IProxy::releaseCall::abi_decode(input, true)
                    .map_err(|e| revert(&e.to_string()))?;
                self.release(ctx, call)
            }
            Some(s) if s == IProxy::finishCall::SELECTOR => {
                let call = IProxy::finishCall::abi_decode(input, true)
                    .map_err(|e| revert(&e.to_string()))?;
                self.finish(ctx, call)
            }
            _ => Err(revert("unknown call")),
        }
    }
}

/// Relays a `release` to the lock proxy without being its counterpart.
struct Forger {
    beneficiary: Address,
}

impl Contract for Forger {
    fn call(&self, ctx: &mut CallContext<'_>, input: &[u8]) -> CallResult {
        if ctx.sender() == ctx.relayer_address() {
            // The callback: accept whatever comes back.
            return Ok(Bytes::new());
        }
        let payload = IProxy::releaseCall {
            to: self.beneficiary,
            amount: U256::abi_decode(input, true).map_err(|e| revert(&e.to_string()))?,
        }
        .abi_encode();
        let nonce = ctx
            .relay(
                LOCK_PROXY,
                payload.into(),
                false,
                IProxy::finishCall::SELECTOR.into(),
            )
            .map_err(|e| revert(&e.to_string()))?;
        Ok(nonce.abi_encode().into())
    }
}

struct Deployment {
    real: Arc<Token>,
    wrapped: Arc<Token>,
    lock_proxy: Arc<Proxy>,
    mint_proxy: Arc<Proxy>,
}

impl Deployment {
    fn new(network: &Network) -> Self {
        let real = Arc::new(Token::default());
        let wrapped = Arc::new(Token::default());
        let lock_proxy = Arc::new(Proxy::new(Mode::Lock, real.clone(), MINT_PROXY));
        let mint_proxy = Arc::new(Proxy::new(Mode::Mint, wrapped.clone(), LOCK_PROXY));
        network.source.deploy(LOCK_PROXY, lock_proxy.clone());
        network.target.deploy(MINT_PROXY, mint_proxy.clone());
        Deployment {
            real,
            wrapped,
            lock_proxy,
            mint_proxy,
        }
    }

    /// Every wrapped token is backed by a locked one.
    fn assert_conserved(&self) {
        assert_eq!(
            self.real.balance_of(LOCK_PROXY),
            self.wrapped.total_supply()
        );
    }
}

fn bridge_input(to: Address, amount: u64) -> Vec<u8> {
    IProxy::bridgeCall {
        to,
        amount: U256::from(amount),
    }
    .abi_encode()
}

#[uccb_macros::test]
async fn lock_mint_and_exit(mut network: Network) {
    let deployment = Deployment::new(&network);
    let user = network.random_address();
    deployment.real.mint(user, U256::from(100));
    network.start_validators().await;

    let receipt = network
        .source
        .transact(user, LOCK_PROXY, &bridge_input(user, 12));
    assert!(receipt.outcome.success, "{:?}", receipt.outcome);
    assert_eq!(deployment.real.balance_of(user), U256::from(88));

    network
        .run_until(|_| !deployment.lock_proxy.finished().is_empty(), TIMEOUT)
        .await;
    assert_eq!(deployment.lock_proxy.finished(), vec![(U256::ZERO, true)]);
    assert_eq!(deployment.wrapped.balance_of(user), U256::from(12));
    assert_eq!(deployment.real.balance_of(LOCK_PROXY), U256::from(12));
    deployment.assert_conserved();

    // Exit: the relay runs the other way.
    let receipt = network
        .target
        .transact(user, MINT_PROXY, &bridge_input(user, 12));
    assert!(receipt.outcome.success, "{:?}", receipt.outcome);
    network
        .run_until(|_| !deployment.mint_proxy.finished().is_empty(), TIMEOUT)
        .await;
    assert_eq!(deployment.mint_proxy.finished(), vec![(U256::ZERO, true)]);
    assert_eq!(deployment.real.balance_of(user), U256::from(100));
    assert_eq!(deployment.wrapped.total_supply(), U256::ZERO);
    deployment.assert_conserved();
}

#[uccb_macros::test]
async fn releases_need_the_counterpart(mut network: Network) {
    let deployment = Deployment::new(&network);
    let user = network.random_address();
    deployment.real.mint(user, U256::from(100));

    let attacker = network.random_address();
    let forger = network.random_address();
    network.target.deploy(
        forger,
        Arc::new(Forger {
            beneficiary: attacker,
        }),
    );
    network.start_validators().await;

    // Lock some tokens so there is something to steal.
    network
        .source
        .transact(user, LOCK_PROXY, &bridge_input(user, 50));
    network
        .run_until(|_| !deployment.lock_proxy.finished().is_empty(), TIMEOUT)
        .await;

    network
        .target
        .transact(attacker, forger, &U256::from(50).abi_encode());
    network
        .run_until(
            |n| {
                events::<Dispatched>(&n.source, n.source.relayer_address())
                    .iter()
                    .any(|d| d.caller == forger)
            },
            TIMEOUT,
        )
        .await;
    let forged = events::<Dispatched>(&network.source, network.source.relayer_address())
        .into_iter()
        .find(|d| d.caller == forger)
        .unwrap();
    assert!(!forged.success);
    assert_eq!(forged.response, revert("unauthorized"));
    assert_eq!(deployment.real.balance_of(attacker), U256::ZERO);
    assert_eq!(deployment.real.balance_of(LOCK_PROXY), U256::from(50));

    // An exit the lock proxy cannot honour is refunded on the wrapped side. These wrapped tokens are minted
    // without backing, so only the refund is checked here.
    deployment.wrapped.mint(attacker, U256::from(60));
    network
        .target
        .transact(attacker, MINT_PROXY, &bridge_input(attacker, 60));
    assert_eq!(deployment.wrapped.balance_of(attacker), U256::ZERO);
    network
        .run_until(|_| !deployment.mint_proxy.finished().is_empty(), TIMEOUT)
        .await;
    assert_eq!(deployment.mint_proxy.finished(), vec![(U256::ZERO, false)]);
    assert_eq!(deployment.wrapped.balance_of(attacker), U256::from(60));
    assert_eq!(deployment.real.balance_of(LOCK_PROXY), U256::from(50));
}
