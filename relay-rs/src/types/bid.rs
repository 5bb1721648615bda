use crate::types::SignedBuilderBid;
use ethereum_consensus::{
    primitives::{BlsPublicKey, Hash32},
    ssz::prelude::U256,
};

/// One builder's current candidate in an auction, as kept in the shared bid
/// store. The candidate that wins recomputation becomes the top-bid record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BidCandidate {
    #[serde(rename = "builder_pubkey")]
    pub builder_public_key: BlsPublicKey,
    pub block_hash: Hash32,
    #[serde(with = "crate::serde::as_str")]
    pub value: U256,
    #[serde(with = "crate::serde::as_str")]
    pub received_at_ms: u64,
    pub cancellations_enabled: bool,
    pub signed_builder_bid: SignedBuilderBid,
}

/// Winner selection: highest value first, then earliest receipt, then block
/// hash so that equal inputs resolve the same way on every relay instance.
pub fn select_top_bid(candidates: &[BidCandidate]) -> Option<&BidCandidate> {
    candidates.iter().max_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| b.received_at_ms.cmp(&a.received_at_ms))
            .then_with(|| b.block_hash.cmp(&a.block_hash))
    })
}
