//! A validator agent. It watches the relays of both chains, signs what it observes, and submits `dispatch` and
//! `resume` once quorums form.
//!
//! The agent keeps no durable state. Restarted, it replays the relay logs from the configured start blocks:
//! its own earlier echoes and any later `Dispatched` and `Resumed` entries are ingested before it acts, so it
//! does not redo finished work. An earlier answer to a read-only call cannot be tied back to its request from
//! the logs alone, so a restarted agent does not answer read-only calls it may already have answered.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::SystemTime,
};

use alloy::primitives::{Address, B256};
use anyhow::{Result, anyhow};
use futures::StreamExt;
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::{
    attribute::{ERROR_TYPE, MESSAGING_DESTINATION_NAME, MESSAGING_OPERATION_NAME, MESSAGING_SYSTEM},
    metric::MESSAGING_PROCESS_DURATION,
};
use tokio::{
    select,
    sync::mpsc,
    task::JoinSet,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::*;

use crate::{
    bridge_node::BridgeNode,
    cfg::NodeConfig,
    client::ChainClient,
    crypto::SecretKey,
    error::{RelayError, RevertError},
    event::{BridgeEvent, EchoRecord, QuorumProof, RelayRequest, ResultMessage},
    message::InboundBridgeMessage,
    registry::ValidatorRegistry,
    relayer::{DispatchOutcome, ResumeOutcome, Simulation},
    request::{Request, ResolvedNonces},
    signatures::{Leg, QuorumCollector, RequestKey},
};

/// A chain the validator watches, and where to start reading its relay logs.
#[derive(Clone)]
pub struct ChainEndpoint {
    pub client: Arc<dyn ChainClient>,
    pub start_block: u64,
}

#[derive(Debug)]
struct Submission {
    due: Instant,
    attempts: u8,
    exhausted: bool,
}

pub struct ValidatorNode {
    key: SecretKey,
    address: Address,
    index: u16,
    registry: ValidatorRegistry,
    config: NodeConfig,
    endpoints: BTreeMap<u64, ChainEndpoint>,
    /// Echoes published on each chain. Both legs of a request are signed on the caller's chain.
    collectors: HashMap<u64, QuorumCollector>,
    requests: BTreeMap<RequestKey, Request>,
    /// Which request each bound digest belongs to, per chain the digest is echoed on.
    digests: HashMap<(u64, B256), RequestKey>,
    /// This validator's own echoes found in the logs which no known request leg accounts for, with their blocks.
    unclaimed: HashMap<(u64, B256), u64>,
    resolved: HashMap<(u64, Address), ResolvedNonces>,
    submissions: BTreeMap<(RequestKey, Leg), Submission>,
    /// Requests whose last step failed and should be retried.
    retry: BTreeSet<RequestKey>,
    /// Chains which have delivered their first batch. Nothing is acted on until every chain has, so that a
    /// restarted validator sees the whole history first.
    synced: HashSet<u64>,
    touched: BTreeSet<RequestKey>,
}

impl ValidatorNode {
    /// Creates a validator for the bridge between exactly two chains. Both relays must share the validator set,
    /// and `key` must be part of it.
    pub async fn new(key: SecretKey, config: NodeConfig, endpoints: Vec<ChainEndpoint>) -> Result<Self> {
        if endpoints.len() != 2 {
            return Err(anyhow!("a bridge connects two chains, got {}", endpoints.len()));
        }

        let mut registry: Option<ValidatorRegistry> = None;
        let mut by_chain = BTreeMap::new();
        for endpoint in endpoints {
            let chain_id = endpoint.client.chain_id();
            let validators = endpoint.client.validators().await?;
            match &registry {
                Some(registry) if *registry != validators => {
                    return Err(anyhow!("chain {chain_id} has a different validator set"));
                }
                Some(_) => {}
                None => registry = Some(validators),
            }
            if by_chain.insert(chain_id, endpoint).is_some() {
                return Err(anyhow!("chain {chain_id} is configured twice"));
            }
        }
        let registry = registry.ok_or_else(|| anyhow!("no chains"))?;

        let address = key.address();
        let index = registry
            .index_of(address)
            .ok_or_else(|| anyhow!("{address} is not a registered validator"))?;

        let collectors = by_chain
            .keys()
            .map(|chain_id| (*chain_id, QuorumCollector::new(registry.clone())))
            .collect();

        Ok(ValidatorNode {
            key,
            address,
            index,
            registry,
            config,
            endpoints: by_chain,
            collectors,
            requests: BTreeMap::new(),
            digests: HashMap::new(),
            unclaimed: HashMap::new(),
            resolved: HashMap::new(),
            submissions: BTreeMap::new(),
            retry: BTreeSet::new(),
            synced: HashSet::new(),
            touched: BTreeSet::new(),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    fn counterpart(&self, chain_id: u64) -> Result<u64> {
        self.endpoints
            .keys()
            .copied()
            .find(|id| *id != chain_id)
            .ok_or_else(|| anyhow!("no counterpart for chain {chain_id}"))
    }

    fn client(&self, chain_id: u64) -> Result<Arc<dyn ChainClient>> {
        self.endpoints
            .get(&chain_id)
            .map(|endpoint| endpoint.client.clone())
            .ok_or_else(|| anyhow!("unknown chain {chain_id}"))
    }

    fn collector(&mut self, chain_id: u64) -> Result<&mut QuorumCollector> {
        self.collectors
            .get_mut(&chain_id)
            .ok_or_else(|| anyhow!("unknown chain {chain_id}"))
    }

    /// Runs the validator until one of its chain watches fails.
    pub async fn run(mut self) -> Result<()> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inbound = UnboundedReceiverStream::new(receiver);

        let mut bridge_nodes = JoinSet::new();
        for (chain_id, endpoint) in &self.endpoints {
            let mut node = BridgeNode::new(
                endpoint.client.clone(),
                *chain_id,
                endpoint.start_block,
                self.config.poll_interval,
                sender.clone(),
            );
            bridge_nodes.spawn(async move { node.start().await });
        }
        drop(sender);

        let meter = opentelemetry::global::meter("uccb");
        let messaging_process_duration = meter
            .f64_histogram(MESSAGING_PROCESS_DURATION)
            .with_unit("s")
            .with_boundaries(vec![
                0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
            ])
            .build();

        fn get_attributes(name: &str) -> Vec<KeyValue> {
            vec![
                KeyValue::new(MESSAGING_OPERATION_NAME, "handle"),
                KeyValue::new(MESSAGING_SYSTEM, "tokio_channel"),
                KeyValue::new(MESSAGING_DESTINATION_NAME, name.to_string()),
            ]
        }

        let mut tick = time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(address = %self.address, index = self.index, "validator started");

        loop {
            select! {
                Some(message) = inbound.next() => {
                    let start = SystemTime::now();
                    let mut attributes = get_attributes("relay-logs");
                    if let Err(e) = self.handle_batch(message).await {
                        attributes.push(KeyValue::new(ERROR_TYPE, "process-error"));
                        error!("Failed to process relay logs: {e}");
                    }
                    messaging_process_duration.record(
                        start.elapsed().map_or(0.0, |d| d.as_secs_f64()),
                        &attributes);
                }
                _ = tick.tick() => {
                    let start = SystemTime::now();
                    let mut attributes = get_attributes("tick");
                    if let Err(e) = self.drive().await {
                        attributes.push(KeyValue::new(ERROR_TYPE, "process-error"));
                        error!("Failed to drive submissions: {e}");
                    }
                    messaging_process_duration.record(
                        start.elapsed().map_or(0.0, |d| d.as_secs_f64()),
                        &attributes);
                }
                Some(result) = bridge_nodes.join_next() => {
                    return match result {
                        Ok(Ok(())) => Err(anyhow!("chain watch stopped")),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(e.into()),
                    };
                }
            }
        }
    }

    /// Ingests a batch of relay events from one chain, then acts on every request it touched.
    pub async fn handle_batch(&mut self, message: InboundBridgeMessage) -> Result<()> {
        let chain_id = message.chain_id;
        debug!(
            chain_id,
            to_block = message.to_block,
            events = message.events.len(),
            "relay logs"
        );
        for observed in message.events {
            trace!(chain_id, ?observed, "ingesting");
            self.ingest(chain_id, observed.block_number, observed.event)?;
        }

        self.synced.insert(chain_id);
        if self.synced.len() < self.endpoints.len() {
            return Ok(());
        }

        let touched = std::mem::take(&mut self.touched);
        for key in touched {
            self.act_or_retry(key).await;
        }
        Ok(())
    }

    fn is_resolved(&self, key: &RequestKey) -> bool {
        self.resolved
            .get(&(key.chain_id, key.caller))
            .is_some_and(|nonces| nonces.contains(key.nonce))
    }

    fn open(&mut self, key: RequestKey) -> Result<Option<&mut Request>> {
        if self.is_resolved(&key) {
            return Ok(None);
        }
        let target_chain_id = self.counterpart(key.chain_id)?;
        self.touched.insert(key);
        Ok(Some(
            self.requests
                .entry(key)
                .or_insert_with(|| Request::new(key, target_chain_id)),
        ))
    }

    fn bind(&mut self, chain_id: u64, digest: B256, key: RequestKey, leg: Leg) -> Result<()> {
        self.collector(chain_id)?.bind(digest, key, leg);
        self.digests.insert((chain_id, digest), key);
        self.unclaimed.remove(&(chain_id, digest));
        Ok(())
    }

    fn ingest(&mut self, chain_id: u64, block_number: u64, event: BridgeEvent) -> Result<()> {
        match event {
            BridgeEvent::Relayed(relayed) => {
                let key = RequestKey {
                    chain_id,
                    caller: relayed.caller,
                    nonce: relayed.nonce,
                };
                let digest = relayed.digest();
                let Some(request) = self.open(key)? else {
                    return Ok(());
                };
                if request.request.is_none() {
                    request.opened(relayed, block_number);
                    self.bind(chain_id, digest, key, Leg::Call)?;
                }
            }
            BridgeEvent::Echoed(echo) => match self.collector(chain_id)?.observe(&echo) {
                Ok(_) => match self.digests.get(&(chain_id, echo.digest)) {
                    Some(key) => {
                        self.touched.insert(*key);
                    }
                    None if echo.index == self.index => {
                        self.unclaimed.insert((chain_id, echo.digest), block_number);
                    }
                    None => {}
                },
                Err(e) => {
                    warn!(chain_id, digest = %echo.digest, index = echo.index, error = %e, "ignoring echo");
                }
            },
            BridgeEvent::Dispatched(result) => {
                let key = RequestKey {
                    chain_id: self.counterpart(chain_id)?,
                    caller: result.caller,
                    nonce: result.nonce,
                };
                let digest = result.digest();
                let Some(request) = self.open(key)? else {
                    return Ok(());
                };
                request.callback.get_or_insert(result.callback);
                if request.dispatched(result.outcome) {
                    info!(
                        caller = %key.caller,
                        nonce = %key.nonce,
                        "observed dispatch"
                    );
                }
                self.bind(key.chain_id, digest, key, Leg::Result)?;
            }
            BridgeEvent::Resumed(resumed) => {
                let key = RequestKey {
                    chain_id,
                    caller: resumed.caller,
                    nonce: resumed.nonce,
                };
                if let Some(request) = self.open(key)? {
                    request.resolve();
                }
            }
        }
        Ok(())
    }

    async fn act_or_retry(&mut self, key: RequestKey) {
        match self.act(key).await {
            Ok(()) => {
                self.retry.remove(&key);
            }
            Err(e) => {
                warn!(caller = %key.caller, nonce = %key.nonce, "request step failed, will retry - {e:?}");
                self.retry.insert(key);
            }
        }
    }

    /// Takes whatever step this validator owes `key`: signing the call, querying a read-only call, signing the
    /// result, or scheduling a submission once a quorum exists.
    async fn act(&mut self, key: RequestKey) -> Result<()> {
        let Some(request) = self.requests.get(&key) else {
            return Ok(());
        };
        if request.is_resolved() {
            self.finish(key)?;
            return Ok(());
        }
        let target_chain_id = request.target_chain_id;

        if request.phase.outcome().is_none() {
            // Wait for the `Relayed` entry.
            let Some(relayed) = request.request.clone() else {
                return Ok(());
            };

            if request.readonly() {
                let relayed_block = request.relayed_block.unwrap_or_default();
                let outcome = self
                    .client(target_chain_id)?
                    .query(relayed.caller, relayed.callee, &relayed.payload)
                    .await?;
                let digest = ResultMessage::for_request(&relayed, outcome.clone()).digest();
                let index = self.index;
                if !self.collector(key.chain_id)?.has_signed(&digest, index)
                    && self.may_have_answered(key.chain_id, relayed_block)
                {
                    warn!(
                        caller = %key.caller,
                        nonce = %key.nonce,
                        "an earlier run may have answered this read-only call, not answering again"
                    );
                    return Ok(());
                }
                info!(
                    caller = %key.caller,
                    nonce = %key.nonce,
                    success = outcome.success,
                    "queried read-only call"
                );
                if let Some(request) = self.requests.get_mut(&key) {
                    request.dispatched(outcome);
                }
            } else {
                let digest = relayed.digest();
                self.echo(key.chain_id, digest, &relayed.message()).await?;
                if let Some(request) = self.requests.get_mut(&key) {
                    request.call_echoed();
                }
                if self.collector(key.chain_id)?.quorum(&digest).is_some() {
                    self.schedule(key, Leg::Call, digest);
                }
                return Ok(());
            }
        }

        let Some(message) = self.requests.get(&key).and_then(Request::result_message) else {
            return Ok(());
        };
        let digest = message.digest();
        self.bind(key.chain_id, digest, key, Leg::Result)?;
        self.echo(key.chain_id, digest, &message.message()).await?;
        if let Some(request) = self.requests.get_mut(&key) {
            request.result_echoed();
        }
        if self.collector(key.chain_id)?.quorum(&digest).is_some() {
            self.schedule(key, Leg::Result, digest);
        }
        Ok(())
    }

    /// Whether one of this validator's unaccounted echoes on `chain_id` was published after `relayed_block`, and so
    /// could be its answer to a read-only call relayed in that block.
    fn may_have_answered(&self, chain_id: u64, relayed_block: u64) -> bool {
        self.unclaimed
            .iter()
            .any(|((id, _), block)| *id == chain_id && *block > relayed_block)
    }

    /// Signs `message` and publishes the signature on `chain_id`, unless this validator already has.
    async fn echo(&mut self, chain_id: u64, digest: B256, message: &[u8]) -> Result<()> {
        let index = self.index;
        if self.collector(chain_id)?.has_signed(&digest, index) {
            return Ok(());
        }
        let echo = EchoRecord {
            digest,
            index,
            signature: self.key.sign_message(message)?.into(),
        };
        self.client(chain_id)?.echo(self.address, &echo).await?;
        debug!(chain_id, %digest, index, "echoed");
        self.collector(chain_id)?.observe(&echo)?;
        Ok(())
    }

    fn schedule(&mut self, key: RequestKey, leg: Leg, digest: B256) {
        if self.submissions.contains_key(&(key, leg)) {
            return;
        }
        let rank = self
            .config
            .leader_policy
            .rank(self.registry.len(), self.index, key.nonce, digest);
        let delay = self.config.failover_delay * rank as u32;
        debug!(caller = %key.caller, nonce = %key.nonce, ?leg, rank, ?delay, "quorum reached, scheduling submission");
        self.submissions.insert(
            (key, leg),
            Submission {
                due: Instant::now() + delay,
                attempts: 0,
                exhausted: false,
            },
        );
    }

    fn finish(&mut self, key: RequestKey) -> Result<()> {
        let resolved = self.resolved.entry((key.chain_id, key.caller)).or_default();
        resolved.insert(key.nonce);
        if let Some(request) = self.requests.remove(&key) {
            info!(
                caller = %key.caller,
                nonce = %key.nonce,
                elapsed = ?request.opened_at.elapsed(),
                out_of_order = resolved.gaps(),
                "request resolved"
            );
        }
        self.submissions.remove(&(key, Leg::Call));
        self.submissions.remove(&(key, Leg::Result));
        self.retry.remove(&key);
        self.digests.retain(|_, k| *k != key);
        self.collector(key.chain_id)?.forget(&key);

        // An unaccounted echo only matters to read-only calls relayed before it which are still open.
        let requests = &self.requests;
        self.unclaimed.retain(|(chain_id, _), block| {
            requests.values().any(|request| {
                request.key.chain_id == *chain_id
                    && request.readonly()
                    && request.relayed_block.is_some_and(|relayed| relayed < *block)
            })
        });
        Ok(())
    }

    /// Retries failed steps, sends submissions which are due and reports stuck requests.
    pub async fn drive(&mut self) -> Result<()> {
        if self.synced.len() < self.endpoints.len() {
            return Ok(());
        }

        let retry = std::mem::take(&mut self.retry);
        for key in retry {
            self.act_or_retry(key).await;
        }

        let now = Instant::now();
        let due: Vec<(RequestKey, Leg)> = self
            .submissions
            .iter()
            .filter(|(_, s)| !s.exhausted && s.due <= now)
            .map(|(k, _)| *k)
            .collect();
        for (key, leg) in due {
            self.submit(key, leg).await?;
        }

        let stuck_after = self.config.stuck_warning_after;
        for request in self.requests.values_mut() {
            if !request.warned_stuck && request.opened_at.elapsed() > stuck_after {
                request.warned_stuck = true;
                warn!(
                    chain_id = request.key.chain_id,
                    caller = %request.key.caller,
                    nonce = %request.key.nonce,
                    phase = ?request.phase,
                    "request has not resolved after {stuck_after:?}"
                );
            }
        }
        Ok(())
    }

    async fn submit(&mut self, key: RequestKey, leg: Leg) -> Result<()> {
        let Some(request) = self.requests.get(&key) else {
            self.submissions.remove(&(key, leg));
            return Ok(());
        };
        let source = key.chain_id;
        let target = request.target_chain_id;

        let attempt: Result<Option<String>> = match leg {
            Leg::Call => {
                let Some(relayed) = request.request.clone() else {
                    self.submissions.remove(&(key, leg));
                    return Ok(());
                };
                if request.phase.outcome().is_some() {
                    self.submissions.remove(&(key, leg));
                    return Ok(());
                }
                let Some(quorum) = self.collector(source)?.quorum(&relayed.digest()) else {
                    self.submissions.remove(&(key, leg));
                    return Ok(());
                };
                let proof = quorum.to_proof();
                submit_dispatch(self.client(target)?, self.address, &relayed, &proof).await
            }
            Leg::Result => {
                let Some(message) = request.result_message() else {
                    self.submissions.remove(&(key, leg));
                    return Ok(());
                };
                let Some(quorum) = self.collector(source)?.quorum(&message.digest()) else {
                    self.submissions.remove(&(key, leg));
                    return Ok(());
                };
                let proof = quorum.to_proof();
                submit_resume(self.client(source)?, self.address, &message, &proof).await
            }
        };

        let max_attempts = self.config.max_dispatch_attempts;
        let retry_delay = self.config.retry_delay;
        match attempt {
            Ok(Some(what)) => {
                info!(caller = %key.caller, nonce = %key.nonce, ?leg, "{what}");
                self.submissions.remove(&(key, leg));
            }
            Ok(None) => {
                debug!(caller = %key.caller, nonce = %key.nonce, ?leg, "already applied, not submitting");
                self.submissions.remove(&(key, leg));
            }
            Err(e) => {
                let Some(submission) = self.submissions.get_mut(&(key, leg)) else {
                    return Ok(());
                };
                submission.attempts += 1;
                let permanent = e
                    .downcast_ref::<RelayError>()
                    .is_some_and(|e| !e.is_transient());
                if permanent || submission.attempts >= max_attempts {
                    submission.exhausted = true;
                    error!(
                        caller = %key.caller,
                        nonce = %key.nonce,
                        ?leg,
                        attempts = submission.attempts,
                        "giving up on submission - {e:?}"
                    );
                } else {
                    submission.due = Instant::now() + retry_delay;
                    warn!(
                        caller = %key.caller,
                        nonce = %key.nonce,
                        ?leg,
                        attempts = submission.attempts,
                        "submission failed, retrying in {retry_delay:?} - {e:?}"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Simulates, then sends, a `dispatch`. Returns `None` when the nonce was already dispatched.
async fn submit_dispatch(
    client: Arc<dyn ChainClient>,
    from: Address,
    relayed: &RelayRequest,
    proof: &QuorumProof,
) -> Result<Option<String>> {
    if client.simulate_dispatch(relayed, proof).await? == Simulation::AlreadyApplied {
        return Ok(None);
    }
    let what = match client.dispatch(from, relayed, proof).await? {
        DispatchOutcome::Executed(outcome) if outcome.success => "dispatched".to_string(),
        DispatchOutcome::Executed(outcome) => {
            format!("dispatched, call failed: {}", RevertError::new(outcome.result))
        }
        DispatchOutcome::AlreadyDispatched(_) => "already dispatched".to_string(),
    };
    Ok(Some(what))
}

/// Simulates, then sends, a `resume`. Returns `None` when the nonce was already resolved.
async fn submit_resume(
    client: Arc<dyn ChainClient>,
    from: Address,
    message: &ResultMessage,
    proof: &QuorumProof,
) -> Result<Option<String>> {
    if client.simulate_resume(message, proof).await? == Simulation::AlreadyApplied {
        return Ok(None);
    }
    let what = match client.resume(from, message, proof).await? {
        ResumeOutcome::Delivered(outcome) if outcome.success => "resumed".to_string(),
        ResumeOutcome::Delivered(outcome) => {
            format!("resumed, callback failed: {}", RevertError::new(outcome.result))
        }
        ResumeOutcome::AlreadyResolved => "already resolved".to_string(),
    };
    Ok(Some(what))
}
