use serde::{Deserialize, Serialize};

use crate::error::ConsensusErrorCode;

/// Outcome of pre-validating one block outside the chain lock.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreValidationResult {
    pub error: Option<ConsensusErrorCode>,
    pub required_iters: Option<u64>,
    pub cost: Option<u64>,
    pub validated_signature: bool,
}

impl PreValidationResult {
    pub fn valid(required_iters: u64) -> Self {
        Self {
            error: None,
            required_iters: Some(required_iters),
            cost: None,
            validated_signature: true,
        }
    }

    pub fn invalid(code: ConsensusErrorCode) -> Self {
        Self {
            error: Some(code),
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}
