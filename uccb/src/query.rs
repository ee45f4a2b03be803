//! Assembling an answer to a read-only call from several validators' samples.
//!
//! A read-only call needs no signatures: a client asks at least a quorum of validators to run the call against
//! their view of the target chain, and accepts an answer only if the samples agree.

use std::{collections::HashMap, sync::Arc};

use alloy::primitives::Address;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{client::ChainClient, event::CallOutcome};

/// How much agreement between samples is required.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum QueryPolicy {
    /// Every sample must be identical.
    #[default]
    Unanimous,
    /// At least a quorum of samples must be identical. Other samples are ignored.
    Supermajority,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("{got} samples, at least {required} required")]
    NotEnoughSamples { got: usize, required: usize },
    #[error("samples disagree: {distinct} distinct answers, largest agreeing group has {largest}")]
    Disagreement { distinct: usize, largest: usize },
}

/// Combines `samples` into one answer under `policy`. `quorum_size` is the quorum of the validator set the
/// samples came from.
pub fn assemble(
    samples: &[CallOutcome],
    quorum_size: usize,
    policy: QueryPolicy,
) -> Result<CallOutcome, QueryError> {
    if samples.len() < quorum_size {
        return Err(QueryError::NotEnoughSamples {
            got: samples.len(),
            required: quorum_size,
        });
    }

    let mut counts: HashMap<&CallOutcome, usize> = HashMap::new();
    for sample in samples {
        *counts.entry(sample).or_default() += 1;
    }
    let distinct = counts.len();
    let (answer, largest) = counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(answer, count)| (answer.clone(), count))
        .ok_or(QueryError::NotEnoughSamples {
            got: 0,
            required: quorum_size,
        })?;

    let accepted = match policy {
        QueryPolicy::Unanimous => distinct == 1,
        QueryPolicy::Supermajority => largest >= quorum_size,
    };
    if !accepted {
        return Err(QueryError::Disagreement { distinct, largest });
    }
    Ok(answer)
}

/// A read-only call to run on several validators' endpoints.
#[derive(Debug, Clone)]
pub struct ReadOnlyQuery {
    pub caller: Address,
    pub callee: Address,
    pub payload: Vec<u8>,
}

impl ReadOnlyQuery {
    /// Queries every endpoint concurrently and assembles the answers. Endpoints which fail to answer are left
    /// out of the sample.
    pub async fn run(
        &self,
        endpoints: &[Arc<dyn ChainClient>],
        quorum_size: usize,
        policy: QueryPolicy,
    ) -> Result<CallOutcome, QueryError> {
        let answers = join_all(
            endpoints
                .iter()
                .map(|endpoint| endpoint.query(self.caller, self.callee, &self.payload)),
        )
        .await;

        let samples: Vec<CallOutcome> = answers
            .into_iter()
            .filter_map(|answer| {
                answer
                    .inspect_err(|e| warn!(error = %e, "query sample failed"))
                    .ok()
            })
            .collect();
        debug!(samples = samples.len(), quorum_size, ?policy, "assembling query");
        assemble(&samples, quorum_size, policy)
    }
}
