//! Typed client over the shared key-value store that coordinates relay
//! instances. All state the auction depends on lives here, namespaced under
//! `boost-relay/<network>:`. The only operation that needs more than
//! last-writer-wins is the top-bid record, which is updated by
//! compare-and-set.

mod memory;

pub use memory::InMemoryCache;

use crate::types::{
    AuctionRequest, BidCandidate, BidTrace, BlockKey, BuilderStatus, ExecutionPayload,
    ProposerSchedule, SignedValidatorRegistration,
};
use async_trait::async_trait;
use ethereum_consensus::primitives::{BlsPublicKey, ValidatorIndex};
use ethereum_consensus::ssz::prelude::U256;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error as ThisError;

const CACHE_PREFIX: &str = "boost-relay";

/// Bids and escrowed payloads expire out of the cache after five minutes.
pub const BID_CACHE_EXPIRY: Duration = Duration::from_secs(5 * 60);

pub const CONFIG_FIELD_PUBKEY: &str = "pubkey";
pub const STATS_FIELD_LATEST_SLOT: &str = "latest-slot";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("cache backend failure: {0}")]
    Backend(String),
    #[error("malformed cache entry: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The subset of a shared key-value server the relay relies on. All
/// operations are idempotent and safe under concurrent writers.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), Error>;
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Swaps `key` to `value` only if the current content equals `expected`
    /// (`None` meaning the key must be absent). Returns whether the swap
    /// happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, Error>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, Error>;
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, Error>;
    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), Error>;

    /// Creates the field only if absent; returns whether it was created.
    async fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, Error>;

    /// Field-level compare-and-set, used for the registration timestamp map.
    async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, Error>;

    async fn hlen(&self, key: &str) -> Result<usize, Error>;
}

#[derive(Debug, Clone)]
struct Keys {
    prefix_top_bid: String,
    prefix_bid_candidates: String,
    prefix_payload: String,
    known_validators: String,
    registrations: String,
    registration_timestamps: String,
    relay_config: String,
    stats: String,
    proposer_duties: String,
    builder_status: String,
}

impl Keys {
    fn new(network: &str) -> Self {
        let scoped = |name: &str| format!("{CACHE_PREFIX}/{network}:{name}");
        Self {
            prefix_top_bid: scoped("cache-gethead-response"),
            prefix_bid_candidates: scoped("cache-bid-candidates"),
            prefix_payload: scoped("cache-getpayload-response"),
            known_validators: scoped("known-validators"),
            registrations: scoped("validators-registration"),
            registration_timestamps: scoped("validators-registration-timestamp"),
            relay_config: scoped("relay-config"),
            stats: scoped("stats"),
            proposer_duties: scoped("proposer-duties"),
            builder_status: scoped("block-builder-status"),
        }
    }

    fn top_bid(&self, auction: &AuctionRequest) -> String {
        format!(
            "{}:{}_{}_{}",
            self.prefix_top_bid, auction.slot, auction.parent_hash, auction.public_key
        )
    }

    fn bid_candidates(&self, auction: &AuctionRequest) -> String {
        format!(
            "{}:{}_{}_{}",
            self.prefix_bid_candidates, auction.slot, auction.parent_hash, auction.public_key
        )
    }

    fn payload(&self, block: &BlockKey) -> String {
        format!(
            "{}:{}_{}_{}",
            self.prefix_payload, block.slot, block.proposer_public_key, block.block_hash
        )
    }
}

fn field_for(public_key: &BlsPublicKey) -> String {
    // lowercase 0x-prefixed hex is the canonical field form
    format!("{public_key:?}").to_lowercase()
}

/// The payload escrow entry: the trace rides along so the delivered-payload
/// audit record can be written without consulting the bid store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EscrowedPayload {
    pub trace: BidTrace,
    pub execution_payload: ExecutionPayload,
}

#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KeyValueCache>,
    keys: Keys,
}

impl Cache {
    pub fn new(store: Arc<dyn KeyValueCache>, network: &str) -> Self {
        let keys = Keys::new(network);
        Self { store, keys }
    }

    // -- known validators --------------------------------------------------

    pub async fn known_validators(&self) -> Result<HashMap<String, ValidatorIndex>, Error> {
        let entries = self.store.hget_all(&self.keys.known_validators).await?;
        let mut validators = HashMap::with_capacity(entries.len());
        for (public_key, index) in entries {
            if let Ok(index) = String::from_utf8_lossy(&index).parse::<ValidatorIndex>() {
                validators.insert(public_key, index);
            }
        }
        Ok(validators)
    }

    /// Create-only write so that concurrent relay instances do not clobber
    /// each other during refresh.
    pub async fn set_known_validator_nx(
        &self,
        public_key: &BlsPublicKey,
        index: ValidatorIndex,
    ) -> Result<bool, Error> {
        self.store
            .hset_nx(
                &self.keys.known_validators,
                &field_for(public_key),
                index.to_string().as_bytes(),
            )
            .await
    }

    // -- registrations -----------------------------------------------------

    pub async fn registration(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<SignedValidatorRegistration>, Error> {
        let raw = self.store.hget(&self.keys.registrations, &field_for(public_key)).await?;
        raw.map(|raw| serde_json::from_slice(&raw).map_err(From::from)).transpose()
    }

    pub async fn registration_timestamp(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<u64>, Error> {
        let raw =
            self.store.hget(&self.keys.registration_timestamps, &field_for(public_key)).await?;
        Ok(raw.and_then(|raw| String::from_utf8_lossy(&raw).parse().ok()))
    }

    /// Persists `entry` only if it is strictly newer than what the timestamp
    /// map currently holds. The timestamp field is the compare-and-set
    /// guard; the registration object follows once the guard is won.
    pub async fn save_registration(
        &self,
        entry: &SignedValidatorRegistration,
        attempts: usize,
    ) -> Result<bool, Error> {
        let field = field_for(&entry.message.public_key);
        let timestamp = entry.message.timestamp;
        for _ in 0..attempts {
            let current =
                self.store.hget(&self.keys.registration_timestamps, &field).await?;
            let current_timestamp =
                current.as_ref().and_then(|raw| String::from_utf8_lossy(raw).parse::<u64>().ok());
            if let Some(current_timestamp) = current_timestamp {
                if timestamp <= current_timestamp {
                    return Ok(false)
                }
            }
            let swapped = self
                .store
                .hcompare_and_set(
                    &self.keys.registration_timestamps,
                    &field,
                    current.as_deref(),
                    timestamp.to_string().as_bytes(),
                )
                .await?;
            if swapped {
                let encoded = serde_json::to_vec(entry)?;
                self.store.hset(&self.keys.registrations, &field, &encoded, None).await?;
                return Ok(true)
            }
        }
        // another writer kept winning with newer entries
        Ok(false)
    }

    pub async fn num_registered_validators(&self) -> Result<usize, Error> {
        self.store.hlen(&self.keys.registration_timestamps).await
    }

    // -- auction state -----------------------------------------------------

    pub async fn top_bid_raw(&self, auction: &AuctionRequest) -> Result<Option<Vec<u8>>, Error> {
        self.store.get(&self.keys.top_bid(auction)).await
    }

    pub async fn top_bid(&self, auction: &AuctionRequest) -> Result<Option<BidCandidate>, Error> {
        let raw = self.top_bid_raw(auction).await?;
        raw.map(|raw| serde_json::from_slice(&raw).map_err(From::from)).transpose()
    }

    pub async fn top_bid_value(&self, auction: &AuctionRequest) -> Result<U256, Error> {
        let top = self.top_bid(auction).await?;
        Ok(top.map(|candidate| candidate.value).unwrap_or_default())
    }

    pub async fn compare_and_set_top_bid(
        &self,
        auction: &AuctionRequest,
        expected: Option<&[u8]>,
        candidate: &BidCandidate,
    ) -> Result<bool, Error> {
        let encoded = serde_json::to_vec(candidate)?;
        self.store
            .compare_and_set(
                &self.keys.top_bid(auction),
                expected,
                &encoded,
                Some(BID_CACHE_EXPIRY),
            )
            .await
    }

    pub async fn bid_candidates(
        &self,
        auction: &AuctionRequest,
    ) -> Result<Vec<BidCandidate>, Error> {
        let entries = self.store.hget_all(&self.keys.bid_candidates(auction)).await?;
        let mut candidates = Vec::with_capacity(entries.len());
        for raw in entries.into_values() {
            candidates.push(serde_json::from_slice(&raw)?);
        }
        Ok(candidates)
    }

    pub async fn bid_candidate(
        &self,
        auction: &AuctionRequest,
        builder: &BlsPublicKey,
    ) -> Result<Option<BidCandidate>, Error> {
        let raw =
            self.store.hget(&self.keys.bid_candidates(auction), &field_for(builder)).await?;
        raw.map(|raw| serde_json::from_slice(&raw).map_err(From::from)).transpose()
    }

    pub async fn save_bid_candidate(
        &self,
        auction: &AuctionRequest,
        candidate: &BidCandidate,
    ) -> Result<(), Error> {
        let encoded = serde_json::to_vec(candidate)?;
        self.store
            .hset(
                &self.keys.bid_candidates(auction),
                &field_for(&candidate.builder_public_key),
                &encoded,
                Some(BID_CACHE_EXPIRY),
            )
            .await
    }

    pub async fn delete_auction(&self, auction: &AuctionRequest) -> Result<(), Error> {
        self.store.delete(&self.keys.top_bid(auction)).await?;
        self.store.delete(&self.keys.bid_candidates(auction)).await
    }

    // -- payload escrow ----------------------------------------------------

    pub async fn save_payload(
        &self,
        block: &BlockKey,
        payload: &EscrowedPayload,
    ) -> Result<(), Error> {
        let encoded = serde_json::to_vec(payload)?;
        self.store.set(&self.keys.payload(block), &encoded, Some(BID_CACHE_EXPIRY)).await
    }

    pub async fn payload(&self, block: &BlockKey) -> Result<Option<EscrowedPayload>, Error> {
        let raw = self.store.get(&self.keys.payload(block)).await?;
        raw.map(|raw| serde_json::from_slice(&raw).map_err(From::from)).transpose()
    }

    pub async fn delete_payload(&self, block: &BlockKey) -> Result<(), Error> {
        self.store.delete(&self.keys.payload(block)).await
    }

    // -- builder status ----------------------------------------------------

    pub async fn builder_status(&self, builder: &BlsPublicKey) -> Result<BuilderStatus, Error> {
        let raw = self.store.hget(&self.keys.builder_status, &field_for(builder)).await?;
        match raw {
            Some(raw) => serde_json::from_slice(&raw).map_err(From::from),
            None => Ok(BuilderStatus::Normal),
        }
    }

    pub async fn set_builder_status(
        &self,
        builder: &BlsPublicKey,
        status: BuilderStatus,
    ) -> Result<(), Error> {
        let encoded = serde_json::to_vec(&status)?;
        self.store.hset(&self.keys.builder_status, &field_for(builder), &encoded, None).await
    }

    // -- relay config, stats, duties ---------------------------------------

    pub async fn relay_config(&self, field: &str) -> Result<Option<String>, Error> {
        let raw = self.store.hget(&self.keys.relay_config, field).await?;
        Ok(raw.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub async fn set_relay_config(&self, field: &str, value: &str) -> Result<(), Error> {
        self.store.hset(&self.keys.relay_config, field, value.as_bytes(), None).await
    }

    pub async fn set_stats(&self, field: &str, value: &str) -> Result<(), Error> {
        self.store.hset(&self.keys.stats, field, value.as_bytes(), None).await
    }

    pub async fn proposer_duties(&self) -> Result<Vec<ProposerSchedule>, Error> {
        let raw = self.store.get(&self.keys.proposer_duties).await?;
        match raw {
            Some(raw) => serde_json::from_slice(&raw).map_err(From::from),
            None => Ok(Vec::new()),
        }
    }

    pub async fn set_proposer_duties(&self, duties: &[ProposerSchedule]) -> Result<(), Error> {
        let encoded = serde_json::to_vec(duties)?;
        self.store.set(&self.keys.proposer_duties, &encoded, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_consensus::crypto::SecretKey;
    use ethereum_consensus::builder::ValidatorRegistration;

    fn cache() -> Cache {
        Cache::new(Arc::new(InMemoryCache::default()), "mainnet")
    }

    fn registration_with_timestamp(key: &SecretKey, timestamp: u64) -> SignedValidatorRegistration {
        SignedValidatorRegistration {
            message: ValidatorRegistration {
                fee_recipient: Default::default(),
                gas_limit: 30_000_000,
                timestamp,
                public_key: key.public_key(),
            },
            signature: Default::default(),
        }
    }

    #[tokio::test]
    async fn registration_keeps_highest_timestamp() {
        let cache = cache();
        let mut rng = rand::thread_rng();
        let key = SecretKey::random(&mut rng).unwrap();
        let public_key = key.public_key();

        assert!(cache.save_registration(&registration_with_timestamp(&key, 1000), 5).await.unwrap());
        assert_eq!(cache.registration_timestamp(&public_key).await.unwrap(), Some(1000));

        // older update is silently dropped
        assert!(!cache.save_registration(&registration_with_timestamp(&key, 999), 5).await.unwrap());
        assert_eq!(cache.registration_timestamp(&public_key).await.unwrap(), Some(1000));
        let stored = cache.registration(&public_key).await.unwrap().unwrap();
        assert_eq!(stored.message.timestamp, 1000);

        // strictly newer wins
        assert!(cache.save_registration(&registration_with_timestamp(&key, 1001), 5).await.unwrap());
        assert_eq!(cache.registration_timestamp(&public_key).await.unwrap(), Some(1001));
    }

    #[tokio::test]
    async fn known_validator_create_only() {
        let cache = cache();
        let mut rng = rand::thread_rng();
        let key = SecretKey::random(&mut rng).unwrap();
        let public_key = key.public_key();

        assert!(cache.set_known_validator_nx(&public_key, 42).await.unwrap());
        assert!(!cache.set_known_validator_nx(&public_key, 43).await.unwrap());
        let validators = cache.known_validators().await.unwrap();
        assert_eq!(validators.len(), 1);
        assert_eq!(validators.into_values().next(), Some(42));
    }

    #[tokio::test]
    async fn builder_status_defaults_to_normal() {
        let cache = cache();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap().public_key();
        assert_eq!(cache.builder_status(&builder).await.unwrap(), BuilderStatus::Normal);
        cache.set_builder_status(&builder, BuilderStatus::Blacklisted).await.unwrap();
        assert_eq!(cache.builder_status(&builder).await.unwrap(), BuilderStatus::Blacklisted);
    }
}
