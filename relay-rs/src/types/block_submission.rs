use crate::types::ExecutionPayload;
use ethereum_consensus::{
    primitives::{BlsPublicKey, BlsSignature, ExecutionAddress, Hash32, Slot},
    ssz::prelude::*,
    Fork,
};

#[derive(Debug, Default, Clone, PartialEq, Eq, SimpleSerialize)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct BidTrace {
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    pub parent_hash: Hash32,
    pub block_hash: Hash32,
    #[serde(rename = "builder_pubkey")]
    pub builder_public_key: BlsPublicKey,
    #[serde(rename = "proposer_pubkey")]
    pub proposer_public_key: BlsPublicKey,
    pub proposer_fee_recipient: ExecutionAddress,
    #[serde(with = "crate::serde::as_str")]
    pub gas_limit: u64,
    #[serde(with = "crate::serde::as_str")]
    pub gas_used: u64,
    #[serde(with = "crate::serde::as_str")]
    pub value: U256,
}

/// A builder's sealed bid: the trace it signs, plus the full payload the
/// relay escrows until the proposer commits to the matching header.
#[derive(Debug, Clone, Serializable, HashTreeRoot)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SignedBidSubmission {
    pub message: BidTrace,
    pub execution_payload: ExecutionPayload,
    pub signature: BlsSignature,
}

impl SignedBidSubmission {
    pub fn version(&self) -> Fork {
        self.execution_payload.version()
    }

    pub fn transaction_count(&self) -> usize {
        transaction_count(&self.execution_payload)
    }
}

pub fn transaction_count(execution_payload: &ExecutionPayload) -> usize {
    match execution_payload {
        ExecutionPayload::Bellatrix(payload) => payload.transactions.len(),
        ExecutionPayload::Capella(payload) => payload.transactions.len(),
        ExecutionPayload::Deneb(payload) => payload.transactions.len(),
        _ => 0,
    }
}

impl std::fmt::Display for SignedBidSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = &self.message;
        let slot = message.slot;
        let block_hash = &message.block_hash;
        let value = &message.value;
        write!(f, "bid for slot {slot} with block hash {block_hash} and value {value}")
    }
}
