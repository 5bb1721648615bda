//! Append-mostly audit records for submissions, deliveries, and
//! registrations, plus the filtered reads behind the data API. Writes happen
//! off the request path; reads are bounded by a hard limit of 200 rows.

mod memory;

pub use memory::InMemoryAuditStore;

use crate::types::{BidTrace, BuilderStatus, SignedValidatorRegistration};
use async_trait::async_trait;
use ethereum_consensus::primitives::{BlsPublicKey, Hash32, Slot};
use thiserror::Error as ThisError;

pub const MAX_QUERY_LIMIT: u64 = 200;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("audit store failure: {0}")]
    Backend(String),
}

/// One accepted or rejected builder submission.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmissionEntry {
    pub inserted_at_ms: u64,
    pub trace: BidTrace,
    pub block_number: u64,
    pub num_tx: usize,
    pub timestamp_ms: u64,
    pub optimistic_submission: bool,
    pub sim_success: bool,
    pub sim_error: String,
    pub was_top_bid: bool,
}

/// A payload handed to a proposer in exchange for its signature.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeliveredPayloadEntry {
    pub inserted_at_ms: u64,
    pub trace: BidTrace,
    pub block_number: u64,
    pub num_tx: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BuilderEntry {
    #[serde(rename = "builder_pubkey")]
    pub public_key: BlsPublicKey,
    pub is_high_prio: bool,
    pub is_blacklisted: bool,
    pub num_submissions: u64,
    pub num_sim_failures: u64,
    pub num_delivered: u64,
    pub last_submission_slot: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrdering {
    Ascending,
    Descending,
}

/// Filters shared by the two bid-trace history endpoints. `slot` and
/// `cursor` are mutually exclusive; `cursor` pages downwards from the given
/// slot.
#[derive(Debug, Clone, Default)]
pub struct TraceFilters {
    pub slot: Option<Slot>,
    pub cursor: Option<Slot>,
    pub block_hash: Option<Hash32>,
    pub block_number: Option<u64>,
    pub proposer_public_key: Option<BlsPublicKey>,
    pub builder_public_key: Option<BlsPublicKey>,
    pub limit: u64,
    pub order_by_value: Option<ValueOrdering>,
}

impl TraceFilters {
    pub fn with_limit(limit: u64) -> Self {
        Self { limit, ..Default::default() }
    }

    pub(crate) fn matches(&self, trace: &BidTrace, block_number: u64) -> bool {
        if self.slot.is_some_and(|slot| trace.slot != slot) {
            return false
        }
        if self.cursor.is_some_and(|cursor| trace.slot > cursor) {
            return false
        }
        if self.block_hash.as_ref().is_some_and(|hash| &trace.block_hash != hash) {
            return false
        }
        if self.block_number.is_some_and(|number| block_number != number) {
            return false
        }
        if self
            .proposer_public_key
            .as_ref()
            .is_some_and(|public_key| &trace.proposer_public_key != public_key)
        {
            return false
        }
        if self
            .builder_public_key
            .as_ref()
            .is_some_and(|public_key| &trace.builder_public_key != public_key)
        {
            return false
        }
        true
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn save_registration(&self, entry: &SignedValidatorRegistration) -> Result<(), Error>;
    async fn registration(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<SignedValidatorRegistration>, Error>;

    async fn save_submission(&self, entry: SubmissionEntry) -> Result<(), Error>;

    /// Unique on (slot, proposer, block hash); replays are absorbed.
    async fn save_delivered_payload(&self, entry: DeliveredPayloadEntry) -> Result<(), Error>;

    async fn delivered_payloads(
        &self,
        filters: &TraceFilters,
    ) -> Result<Vec<DeliveredPayloadEntry>, Error>;
    async fn submissions(&self, filters: &TraceFilters) -> Result<Vec<SubmissionEntry>, Error>;

    async fn builder_entry(&self, public_key: &BlsPublicKey)
        -> Result<Option<BuilderEntry>, Error>;
    async fn set_builder_status(
        &self,
        public_key: &BlsPublicKey,
        status: BuilderStatus,
    ) -> Result<(), Error>;
    async fn upsert_builder_after_submission(
        &self,
        public_key: &BlsPublicKey,
        slot: Slot,
        sim_failed: bool,
    ) -> Result<(), Error>;
    async fn inc_builder_delivered(&self, public_key: &BlsPublicKey) -> Result<(), Error>;
}
