use std::{
    error::Error,
    fmt::{self, Display, Formatter},
};

use alloy::{
    primitives::{Address, Bytes, U256},
    sol_types::decode_revert_reason,
};

/// A rejected `dispatch` or `resume` submission, or a failure of the ledger behind it.
///
/// A rejected submission changes no state. Duplicate submissions are not errors: they are reported through
/// [`crate::relayer::DispatchOutcome`] and [`crate::relayer::ResumeOutcome`].
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("signer index {0} is not a registered validator")]
    UnknownValidator(u16),
    #[error("signature for signer index {0} does not recover to the registered validator")]
    InvalidSignature(u16),
    #[error("insufficient quorum: {distinct} distinct signers, {required} required")]
    InsufficientQuorum { distinct: usize, required: usize },
    #[error("{indices} signer indices but {signatures} signatures")]
    MalformedQuorum { indices: usize, signatures: usize },
    #[error("nonce {nonce} of {caller} was reserved for dispatch but its outcome was never recorded")]
    DispatchIncomplete { caller: Address, nonce: U256 },
    #[error("ledger failure: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl RelayError {
    /// A short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::UnknownValidator(_) => "unknown_validator",
            RelayError::InvalidSignature(_) => "invalid_signature",
            RelayError::InsufficientQuorum { .. } => "insufficient_quorum",
            RelayError::MalformedQuorum { .. } => "malformed_quorum",
            RelayError::DispatchIncomplete { .. } => "dispatch_incomplete",
            RelayError::Storage(_) => "storage",
        }
    }

    /// Whether resubmitting the same input could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Storage(_))
    }
}

/// Revert data from a callee, rendered with its decoded reason where there is one.
#[derive(Debug)]
pub struct RevertError(Option<Bytes>);

impl RevertError {
    pub fn new(output: Bytes) -> Self {
        RevertError((!output.is_empty()).then_some(output))
    }

    pub fn reason(&self) -> Option<String> {
        self.0.as_ref().and_then(|b| decode_revert_reason(b))
    }
}

impl Error for RevertError {}

impl Display for RevertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("execution reverted")?;
        if let Some(reason) = self.reason() {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}
