use crate::types::SignedValidatorRegistration;
use ethereum_consensus::primitives::{Slot, ValidatorIndex};

/// An upcoming duty a builder can bid on: published only for proposers with
/// a current registration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProposerSchedule {
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    #[serde(with = "crate::serde::as_str")]
    pub validator_index: ValidatorIndex,
    pub entry: SignedValidatorRegistration,
}
