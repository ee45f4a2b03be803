//! Echo collection: validator signatures gathered per digest until they form a quorum.

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::{Address, B256, Bytes, U256};
use bitvec::{bitvec, order::Msb0, vec::BitVec};
use tracing::*;

use crate::{
    error::RelayError,
    event::{EchoRecord, QuorumProof},
    registry::ValidatorRegistry,
};

/// Identifies a request across both chains: the chain the caller lives on, the caller and its nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub chain_id: u64,
    pub caller: Address,
    pub nonce: U256,
}

/// Which of the two signed messages of a request a digest belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Leg {
    Call,
    Result,
}

/// Distinct verified signatures over one digest, enough to authorize it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuorumSet {
    pub digest: B256,
    signatures: BTreeMap<u16, Bytes>,
}

impl QuorumSet {
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// The signer indices and signatures, ordered by signer index.
    pub fn to_proof(&self) -> QuorumProof {
        let (signer_indices, signatures) = self
            .signatures
            .iter()
            .map(|(index, signature)| (*index, signature.clone()))
            .unzip();
        QuorumProof {
            signer_indices,
            signatures,
        }
    }
}

/// A validator which signed two different digests for the same leg of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Equivocation {
    pub key: RequestKey,
    pub leg: Leg,
    pub index: u16,
    pub first: B256,
    pub second: B256,
}

#[derive(Debug)]
struct Round {
    signatures: BTreeMap<u16, Bytes>,
    cosigned: BitVec<u8, Msb0>,
    supermajority_reached: bool,
}

/// Collects echoed signatures published on one chain, per digest, until each digest reaches quorum.
#[derive(Debug)]
pub struct QuorumCollector {
    registry: ValidatorRegistry,
    rounds: HashMap<B256, Round>,
    bindings: HashMap<B256, (RequestKey, Leg)>,
    signed: HashMap<(RequestKey, Leg), BTreeMap<u16, B256>>,
    equivocations: Vec<Equivocation>,
}

impl QuorumCollector {
    pub fn new(registry: ValidatorRegistry) -> Self {
        QuorumCollector {
            registry,
            rounds: HashMap::new(),
            bindings: HashMap::new(),
            signed: HashMap::new(),
            equivocations: Vec::new(),
        }
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    /// Adds an echo. Returns the quorum set the first time the echo's digest reaches quorum, and `None` for
    /// echoes which are duplicates, below quorum or arrive after quorum was reached. Echoes which do not verify
    /// are rejected and not stored.
    pub fn observe(&mut self, echo: &EchoRecord) -> Result<Option<QuorumSet>, RelayError> {
        self.registry.verify(echo.index, &echo.digest, &echo.signature)?;

        if let Some((key, leg)) = self.bindings.get(&echo.digest).copied() {
            self.note_signer(key, leg, echo.index, echo.digest);
        }

        let committee_size = self.registry.len();
        let round = self.rounds.entry(echo.digest).or_insert_with(|| Round {
            signatures: BTreeMap::new(),
            cosigned: bitvec![u8, bitvec::order::Msb0; 0; committee_size],
            supermajority_reached: false,
        });

        let index = usize::from(echo.index);
        if round.cosigned[index] {
            trace!(digest = %echo.digest, index, "duplicate echo");
            return Ok(None);
        }
        round.cosigned.set(index, true);
        round.signatures.insert(echo.index, echo.signature.clone());

        if round.supermajority_reached {
            return Ok(None);
        }
        let count = round.cosigned.count_ones();
        round.supermajority_reached = self.registry.has_quorum(count);
        trace!(
            digest = %echo.digest,
            index,
            count,
            supermajority_reached = round.supermajority_reached,
            "storing echo"
        );

        Ok(round.supermajority_reached.then(|| QuorumSet {
            digest: echo.digest,
            signatures: round.signatures.clone(),
        }))
    }

    /// The current quorum set over `digest`, if it has reached quorum. Includes echoes that arrived after quorum.
    pub fn quorum(&self, digest: &B256) -> Option<QuorumSet> {
        let round = self.rounds.get(digest)?;
        round.supermajority_reached.then(|| QuorumSet {
            digest: *digest,
            signatures: round.signatures.clone(),
        })
    }

    pub fn count(&self, digest: &B256) -> usize {
        self.rounds
            .get(digest)
            .map_or(0, |round| round.cosigned.count_ones())
    }

    pub fn has_signed(&self, digest: &B256, index: u16) -> bool {
        self.rounds.get(digest).is_some_and(|round| {
            round
                .cosigned
                .get(usize::from(index))
                .is_some_and(|bit| *bit)
        })
    }

    /// Associates `digest` with a leg of a request, so that validators signing conflicting digests for it are
    /// noticed. Signatures collected before the binding are checked too.
    pub fn bind(&mut self, digest: B256, key: RequestKey, leg: Leg) {
        if self.bindings.insert(digest, (key, leg)).is_some() {
            return;
        }
        let signers: Vec<u16> = self
            .rounds
            .get(&digest)
            .map(|round| round.signatures.keys().copied().collect())
            .unwrap_or_default();
        for index in signers {
            self.note_signer(key, leg, index, digest);
        }
    }

    fn note_signer(&mut self, key: RequestKey, leg: Leg, index: u16, digest: B256) {
        let first = *self
            .signed
            .entry((key, leg))
            .or_default()
            .entry(index)
            .or_insert(digest);
        if first != digest {
            warn!(
                chain_id = key.chain_id,
                caller = %key.caller,
                nonce = %key.nonce,
                ?leg,
                index,
                %first,
                second = %digest,
                "validator signed conflicting digests"
            );
            let equivocation = Equivocation {
                key,
                leg,
                index,
                first,
                second: digest,
            };
            if !self.equivocations.contains(&equivocation) {
                self.equivocations.push(equivocation);
            }
        }
    }

    pub fn equivocations(&self) -> &[Equivocation] {
        &self.equivocations
    }

    /// Drops everything held for a request which has been resolved.
    pub fn forget(&mut self, key: &RequestKey) {
        let digests: Vec<B256> = self
            .bindings
            .iter()
            .filter(|(_, (k, _))| k == key)
            .map(|(digest, _)| *digest)
            .collect();
        for digest in digests {
            self.bindings.remove(&digest);
            self.rounds.remove(&digest);
        }
        self.signed.retain(|(k, _), _| k != key);
    }
}
