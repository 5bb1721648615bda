//! The single data layer the auction core consumes: an in-process mirror of
//! the known-validator set plus read-through to the shared cache. The
//! validator maps are replaced as one atomic pair on refresh so readers
//! never observe a half-swap.

use crate::{
    beacon::BeaconClient,
    cache::{Cache, EscrowedPayload},
    error::Error,
    types::{
        select_top_bid, AuctionRequest, BidCandidate, BlockKey, ProposerSchedule,
        SignedValidatorRegistration,
    },
};
use ethereum_consensus::primitives::{BlsPublicKey, Slot, ValidatorIndex};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, warn};

const REGISTRATION_CAS_ATTEMPTS: usize = 5;
const TOP_BID_CAS_ATTEMPTS: usize = 5;

#[derive(Default)]
pub struct KnownValidators {
    by_public_key: HashMap<BlsPublicKey, ValidatorIndex>,
    by_index: HashMap<ValidatorIndex, BlsPublicKey>,
}

/// Cache keys written by this instance, tracked per slot so the GC pass can
/// delete them once the head moves on.
#[derive(Default)]
struct SlotKeys {
    auctions: HashSet<AuctionRequest>,
    blocks: HashSet<BlockKey>,
}

pub struct Datastore {
    cache: Cache,
    beacon: Arc<dyn BeaconClient>,
    known_validators: RwLock<Arc<KnownValidators>>,
    tracked: Mutex<BTreeMap<Slot, SlotKeys>>,
}

impl Datastore {
    pub fn new(cache: Cache, beacon: Arc<dyn BeaconClient>) -> Self {
        Self {
            cache,
            beacon,
            known_validators: RwLock::new(Arc::new(Default::default())),
            tracked: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    // -- known validators --------------------------------------------------

    /// Warms the local maps from the cache, so restarts serve registrations
    /// before the first full beacon refresh lands.
    pub async fn load_known_validators(&self) -> Result<usize, Error> {
        let entries = self.cache.known_validators().await?;
        let mut next = KnownValidators::default();
        for (public_key_hex, index) in entries {
            match crate::api::parse_public_key(&public_key_hex) {
                Ok(public_key) => {
                    next.by_index.insert(index, public_key.clone());
                    next.by_public_key.insert(public_key, index);
                }
                Err(_) => debug!(field = %public_key_hex, "skipping malformed cache entry"),
            }
        }
        let count = next.by_public_key.len();
        *self.known_validators.write() = Arc::new(next);
        Ok(count)
    }

    /// Full refresh from the beacon node. New pubkeys are written to the
    /// cache create-only so concurrent relay instances cooperate; removal
    /// from the local maps happens only here, on the full swap.
    pub async fn refresh_known_validators(&self) -> Result<usize, Error> {
        let validators = self.beacon.get_validators().await?;

        let mut next = KnownValidators::default();
        next.by_public_key.reserve(validators.len());
        next.by_index.reserve(validators.len());
        for entry in &validators {
            next.by_public_key.insert(entry.validator.public_key.clone(), entry.index);
            next.by_index.insert(entry.index, entry.validator.public_key.clone());
        }

        // compute the delta against the current mirror before swapping
        let new_entries: Vec<(BlsPublicKey, ValidatorIndex)> = {
            let current = self.known_validators.read().clone();
            next.by_public_key
                .iter()
                .filter(|(public_key, _)| !current.by_public_key.contains_key(*public_key))
                .map(|(public_key, index)| (public_key.clone(), *index))
                .collect()
        };

        let count = next.by_public_key.len();
        *self.known_validators.write() = Arc::new(next);

        for (public_key, index) in new_entries {
            if let Err(err) = self.cache.set_known_validator_nx(&public_key, index).await {
                warn!(%err, %public_key, "could not persist known validator");
            }
        }
        Ok(count)
    }

    pub fn validator_index(&self, public_key: &BlsPublicKey) -> Option<ValidatorIndex> {
        self.known_validators.read().by_public_key.get(public_key).copied()
    }

    pub fn public_key_by_index(&self, index: ValidatorIndex) -> Option<BlsPublicKey> {
        self.known_validators.read().by_index.get(&index).cloned()
    }

    pub fn num_known_validators(&self) -> usize {
        self.known_validators.read().by_public_key.len()
    }

    // -- registrations -----------------------------------------------------

    pub async fn registration(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<SignedValidatorRegistration>, Error> {
        self.cache.registration(public_key).await.map_err(From::from)
    }

    pub async fn registration_timestamp(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<u64>, Error> {
        self.cache.registration_timestamp(public_key).await.map_err(From::from)
    }

    /// Stores `entry` if it is strictly newer than the current registration.
    /// Returns whether the entry was written.
    pub async fn save_registration(
        &self,
        entry: &SignedValidatorRegistration,
    ) -> Result<bool, Error> {
        self.cache
            .save_registration(entry, REGISTRATION_CAS_ATTEMPTS)
            .await
            .map_err(From::from)
    }

    // -- auction state -----------------------------------------------------

    /// Applies the per-builder candidate rule: with cancellations the entry
    /// is replaced unconditionally, otherwise only a strictly higher value
    /// replaces the builder's previous candidate.
    pub async fn save_bid_candidate(
        &self,
        auction: &AuctionRequest,
        candidate: BidCandidate,
    ) -> Result<BidCandidate, Error> {
        let current =
            self.cache.bid_candidate(auction, &candidate.builder_public_key).await?;
        if let Some(current) = current {
            if !candidate.cancellations_enabled && current.value >= candidate.value {
                return Ok(current)
            }
        }
        self.cache.save_bid_candidate(auction, &candidate).await?;
        self.track_auction(auction);
        Ok(candidate)
    }

    /// Recomputes the winner from the candidate store and installs it in the
    /// top-bid record under compare-and-set, retrying a bounded number of
    /// times when another writer interleaves.
    pub async fn promote_top_bid(
        &self,
        auction: &AuctionRequest,
    ) -> Result<Option<BidCandidate>, Error> {
        for _ in 0..TOP_BID_CAS_ATTEMPTS {
            let current_raw = self.cache.top_bid_raw(auction).await?;
            let candidates = self.cache.bid_candidates(auction).await?;
            let Some(best) = select_top_bid(&candidates) else { return Ok(None) };

            if let Some(raw) = &current_raw {
                if let Ok(current) = serde_json::from_slice::<BidCandidate>(raw) {
                    if current.block_hash == best.block_hash && current.value == best.value {
                        return Ok(Some(current))
                    }
                }
            }

            let swapped = self
                .cache
                .compare_and_set_top_bid(auction, current_raw.as_deref(), best)
                .await?;
            if swapped {
                self.track_auction(auction);
                return Ok(Some(best.clone()))
            }
        }
        Err(Error::TopBidContention(TOP_BID_CAS_ATTEMPTS))
    }

    pub async fn top_bid(&self, auction: &AuctionRequest) -> Result<Option<BidCandidate>, Error> {
        self.cache.top_bid(auction).await.map_err(From::from)
    }

    // -- payload escrow ----------------------------------------------------

    pub async fn save_payload(
        &self,
        block: &BlockKey,
        payload: &EscrowedPayload,
    ) -> Result<(), Error> {
        self.cache.save_payload(block, payload).await?;
        let mut tracked = self.tracked.lock();
        tracked.entry(block.slot).or_default().blocks.insert(block.clone());
        Ok(())
    }

    pub async fn payload(&self, block: &BlockKey) -> Result<Option<EscrowedPayload>, Error> {
        self.cache.payload(block).await.map_err(From::from)
    }

    // -- proposer duties ---------------------------------------------------

    pub async fn proposer_duties(&self) -> Result<Vec<ProposerSchedule>, Error> {
        self.cache.proposer_duties().await.map_err(From::from)
    }

    pub async fn set_proposer_duties(&self, duties: &[ProposerSchedule]) -> Result<(), Error> {
        self.cache.set_proposer_duties(duties).await.map_err(From::from)
    }

    // -- garbage collection ------------------------------------------------

    fn track_auction(&self, auction: &AuctionRequest) {
        let mut tracked = self.tracked.lock();
        tracked.entry(auction.slot).or_default().auctions.insert(auction.clone());
    }

    /// Purges bids and escrowed payloads for slots the chain has moved past.
    /// Returns (removed keys, remaining tracked keys).
    pub async fn cleanup_old_bids_and_blocks(
        &self,
        head_slot: Slot,
        horizon: Slot,
    ) -> (usize, usize) {
        let stale: Vec<(Slot, SlotKeys)> = {
            let mut tracked = self.tracked.lock();
            let live = tracked.split_off(&head_slot.saturating_sub(horizon));
            std::mem::replace(&mut *tracked, live).into_iter().collect()
        };

        let mut removed = 0;
        for (_, keys) in stale {
            for auction in keys.auctions {
                if let Err(err) = self.cache.delete_auction(&auction).await {
                    warn!(%err, %auction, "could not delete stale auction");
                }
                removed += 1;
            }
            for block in keys.blocks {
                if let Err(err) = self.cache.delete_payload(&block).await {
                    warn!(%err, %block, "could not delete stale payload");
                }
                removed += 1;
            }
        }
        let remaining = {
            let tracked = self.tracked.lock();
            tracked.values().map(|keys| keys.auctions.len() + keys.blocks.len()).sum()
        };
        (removed, remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        beacon::mock::MockBeaconClient,
        beacon::{ValidatorData, ValidatorDescriptor},
        cache::InMemoryCache,
        types::{BuilderBid, ExecutionPayload, SignedBuilderBid},
    };
    use ethereum_consensus::{crypto::SecretKey, ssz::prelude::U256};

    fn datastore() -> (Datastore, Arc<MockBeaconClient>) {
        let cache = Cache::new(Arc::new(InMemoryCache::default()), "mainnet");
        let beacon = Arc::new(MockBeaconClient::new(0));
        (Datastore::new(cache, beacon.clone()), beacon)
    }

    fn candidate(builder: &SecretKey, value: u64, received_at_ms: u64, cancel: bool) -> BidCandidate {
        let bid = BuilderBid {
            header: crate::types::to_header(&ExecutionPayload::Capella(Default::default()))
                .unwrap(),
            value: U256::from(value),
            public_key: builder.public_key(),
        };
        let block_hash =
            ethereum_consensus::primitives::Hash32::try_from([value as u8; 32].as_ref()).unwrap();
        BidCandidate {
            builder_public_key: builder.public_key(),
            block_hash,
            value: U256::from(value),
            received_at_ms,
            cancellations_enabled: cancel,
            signed_builder_bid: SignedBuilderBid { message: bid, signature: Default::default() },
        }
    }

    fn auction() -> AuctionRequest {
        AuctionRequest { slot: 10, ..Default::default() }
    }

    #[tokio::test]
    async fn known_validator_refresh_swaps_the_pair() {
        let (datastore, beacon) = datastore();
        let mut rng = rand::thread_rng();
        let keys: Vec<_> = (0..3).map(|_| SecretKey::random(&mut rng).unwrap()).collect();
        beacon.set_validators(
            keys.iter()
                .enumerate()
                .map(|(index, key)| ValidatorDescriptor {
                    index,
                    status: "active_ongoing".to_string(),
                    validator: ValidatorData { public_key: key.public_key() },
                })
                .collect(),
        );

        assert_eq!(datastore.refresh_known_validators().await.unwrap(), 3);
        assert_eq!(datastore.num_known_validators(), 3);
        assert_eq!(datastore.validator_index(&keys[1].public_key()), Some(1));
        assert_eq!(datastore.public_key_by_index(2), Some(keys[2].public_key()));

        // removal happens on full refresh
        beacon.set_validators(vec![ValidatorDescriptor {
            index: 0,
            status: "active_ongoing".to_string(),
            validator: ValidatorData { public_key: keys[0].public_key() },
        }]);
        assert_eq!(datastore.refresh_known_validators().await.unwrap(), 1);
        assert_eq!(datastore.validator_index(&keys[1].public_key()), None);
    }

    #[tokio::test]
    async fn same_builder_keeps_higher_bid_without_cancellations() {
        let (datastore, _) = datastore();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let auction = auction();

        datastore.save_bid_candidate(&auction, candidate(&builder, 10, 1, false)).await.unwrap();
        let top = datastore.promote_top_bid(&auction).await.unwrap().unwrap();
        assert_eq!(top.value, U256::from(10u64));

        // a lower bid without cancellations does not displace the builder's own
        datastore.save_bid_candidate(&auction, candidate(&builder, 5, 2, false)).await.unwrap();
        let top = datastore.promote_top_bid(&auction).await.unwrap().unwrap();
        assert_eq!(top.value, U256::from(10u64));

        // with cancellations it does
        datastore.save_bid_candidate(&auction, candidate(&builder, 5, 3, true)).await.unwrap();
        let top = datastore.promote_top_bid(&auction).await.unwrap().unwrap();
        assert_eq!(top.value, U256::from(5u64));
    }

    #[tokio::test]
    async fn cancellation_falls_back_to_next_best_candidate() {
        let (datastore, _) = datastore();
        let mut rng = rand::thread_rng();
        let builder_a = SecretKey::random(&mut rng).unwrap();
        let builder_b = SecretKey::random(&mut rng).unwrap();
        let auction = auction();

        datastore.save_bid_candidate(&auction, candidate(&builder_a, 10, 1, false)).await.unwrap();
        datastore.promote_top_bid(&auction).await.unwrap();
        datastore.save_bid_candidate(&auction, candidate(&builder_b, 20, 2, false)).await.unwrap();
        let top = datastore.promote_top_bid(&auction).await.unwrap().unwrap();
        assert_eq!(top.value, U256::from(20u64));

        // builder A lowering its losing bid leaves the top alone
        datastore.save_bid_candidate(&auction, candidate(&builder_a, 3, 3, true)).await.unwrap();
        let top = datastore.promote_top_bid(&auction).await.unwrap().unwrap();
        assert_eq!(top.value, U256::from(20u64));

        // builder B retracting its winning bid falls back to A's remaining one
        datastore.save_bid_candidate(&auction, candidate(&builder_b, 2, 4, true)).await.unwrap();
        let top = datastore.promote_top_bid(&auction).await.unwrap().unwrap();
        assert_eq!(top.value, U256::from(3u64));
        assert_eq!(top.builder_public_key, builder_a.public_key());
    }

    #[tokio::test]
    async fn equal_values_keep_the_first_seen_bid() {
        let (datastore, _) = datastore();
        let mut rng = rand::thread_rng();
        let builder_a = SecretKey::random(&mut rng).unwrap();
        let builder_b = SecretKey::random(&mut rng).unwrap();
        let auction = auction();

        datastore.save_bid_candidate(&auction, candidate(&builder_a, 10, 1, false)).await.unwrap();
        datastore.promote_top_bid(&auction).await.unwrap();
        datastore.save_bid_candidate(&auction, candidate(&builder_b, 10, 2, false)).await.unwrap();
        let top = datastore.promote_top_bid(&auction).await.unwrap().unwrap();
        assert_eq!(top.builder_public_key, builder_a.public_key());
    }

    #[tokio::test]
    async fn cleanup_purges_past_slots() {
        let (datastore, _) = datastore();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let auction = auction();

        datastore.save_bid_candidate(&auction, candidate(&builder, 10, 1, false)).await.unwrap();
        datastore.promote_top_bid(&auction).await.unwrap();
        assert!(datastore.top_bid(&auction).await.unwrap().is_some());

        // head has not passed the slot yet
        let (removed, _) = datastore.cleanup_old_bids_and_blocks(auction.slot, 0).await;
        assert_eq!(removed, 0);
        assert!(datastore.top_bid(&auction).await.unwrap().is_some());

        let (removed, remaining) =
            datastore.cleanup_old_bids_and_blocks(auction.slot + 1, 0).await;
        assert!(removed > 0);
        assert_eq!(remaining, 0);
        assert!(datastore.top_bid(&auction).await.unwrap().is_none());
    }
}
