//! The ordered set of validators a relay accepts signatures from.

use alloy::primitives::{Address, B256};
use anyhow::{Result, anyhow};
use itertools::Itertools;

use crate::{crypto::recover_signer, error::RelayError, event::QuorumProof};

/// Validator identities addressed by index. Indices are stable for the lifetime of a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRegistry {
    validators: Vec<Address>,
}

impl ValidatorRegistry {
    pub fn new(validators: Vec<Address>) -> Result<Self> {
        if validators.is_empty() {
            return Err(anyhow!("validator set is empty"));
        }
        if validators.len() > usize::from(u16::MAX) + 1 {
            return Err(anyhow!(
                "{} validators cannot be addressed by a 16-bit index",
                validators.len()
            ));
        }
        if let Some(duplicate) = validators.iter().duplicates().next() {
            return Err(anyhow!("validator {duplicate} is registered twice"));
        }
        Ok(ValidatorRegistry { validators })
    }

    pub fn validators(&self) -> &[Address] {
        &self.validators
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The smallest number of distinct signers which is more than two thirds of the set.
    pub fn quorum_size(&self) -> usize {
        self.validators.len() * 2 / 3 + 1
    }

    pub fn has_quorum(&self, count: usize) -> bool {
        count >= self.quorum_size()
    }

    pub fn get(&self, index: u16) -> Option<Address> {
        self.validators.get(usize::from(index)).copied()
    }

    pub fn index_of(&self, address: Address) -> Option<u16> {
        self.validators
            .iter()
            .position(|v| *v == address)
            .and_then(|i| u16::try_from(i).ok())
    }

    pub fn is_validator(&self, index: u16, address: Address) -> bool {
        self.get(index) == Some(address)
    }

    /// Checks a single echoed signature over `digest` from the validator at `index`.
    pub fn verify(&self, index: u16, digest: &B256, signature: &[u8]) -> Result<(), RelayError> {
        if self.get(index).is_none() {
            return Err(RelayError::UnknownValidator(index));
        }
        match recover_signer(digest, signature) {
            Some(signer) if self.is_validator(index, signer) => Ok(()),
            _ => Err(RelayError::InvalidSignature(index)),
        }
    }

    /// Checks a submitted quorum over `digest`. The checks run in a fixed order: matching lengths, every index
    /// registered and every signature valid, then enough distinct signers.
    pub fn verify_quorum(&self, digest: &B256, proof: &QuorumProof) -> Result<(), RelayError> {
        if proof.signer_indices.len() != proof.signatures.len() {
            return Err(RelayError::MalformedQuorum {
                indices: proof.signer_indices.len(),
                signatures: proof.signatures.len(),
            });
        }

        for (index, signature) in proof.signer_indices.iter().zip(&proof.signatures) {
            self.verify(*index, digest, signature)?;
        }

        let distinct = proof.signer_indices.iter().unique().count();
        if distinct != proof.signer_indices.len() || !self.has_quorum(distinct) {
            return Err(RelayError::InsufficientQuorum {
                distinct,
                required: self.quorum_size(),
            });
        }

        Ok(())
    }
}
