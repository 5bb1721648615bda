mod auction_request;
mod bid;
mod block_submission;
mod builder_bid;
mod builder_status;
mod proposer_schedule;

pub use auction_request::*;
pub use bid::*;
pub use block_submission::*;
pub use builder_bid::*;
pub use builder_status::*;
pub use ethereum_consensus::{
    builder::{SignedValidatorRegistration, ValidatorRegistration},
    types::mainnet::{
        ExecutionPayload, ExecutionPayloadHeader, SignedBeaconBlock, SignedBlindedBeaconBlock,
    },
};
pub use proposer_schedule::*;

use ethereum_consensus::Fork;

/// Response envelope used across the builder APIs: the fork tag first, then
/// the fork-shaped data.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VersionedValue<T> {
    pub version: Fork,
    pub data: T,
}
