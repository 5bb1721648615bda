use ethereum_consensus::primitives::{BlsPublicKey, Hash32, Slot};

/// Describes a single unique auction.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct AuctionRequest {
    /// Slot for the proposal
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    /// Hash of the parent block for the proposal
    pub parent_hash: Hash32,
    /// Public key of the proposer for the proposal
    pub public_key: BlsPublicKey,
}

impl std::fmt::Display for AuctionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot;
        let parent_hash = &self.parent_hash;
        let public_key = &self.public_key;
        write!(f, "slot {slot}, parent hash {parent_hash} and proposer {public_key}")
    }
}

/// Identifies one revealed payload in escrow.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct BlockKey {
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    #[serde(rename = "proposer_pubkey")]
    pub proposer_public_key: BlsPublicKey,
    pub block_hash: Hash32,
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot;
        let proposer = &self.proposer_public_key;
        let block_hash = &self.block_hash;
        write!(f, "slot {slot}, proposer {proposer} and block hash {block_hash}")
    }
}
