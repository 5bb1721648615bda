//! The auction core: one sealed-bid auction per (slot, parent hash,
//! proposer). Builders race to become the top bid, proposers redeem the
//! winning payload with a signature over its header. Serialization of
//! top-bid replacement happens through cache compare-and-set, so any number
//! of relay instances can share the auction state.

use crate::{
    audit::{AuditStore, BuilderEntry, DeliveredPayloadEntry, SubmissionEntry, TraceFilters},
    beacon::{unblind_signed_block, BeaconClient},
    cache::{EscrowedPayload, CONFIG_FIELD_PUBKEY, STATS_FIELD_LATEST_SLOT},
    config::FeatureFlags,
    datastore::Datastore,
    error::Error,
    network::NetworkDetails,
    signing::{
        sign_builder_message, verify_signed_builder_message, verify_signed_consensus_message,
        SecretKey,
    },
    simulation::SimulationGate,
    types::{
        to_header, AuctionRequest, BidCandidate, BlockKey, BuilderBid, BuilderStatus,
        ExecutionPayload, ProposerSchedule, SignedBidSubmission, SignedBlindedBeaconBlock,
        SignedBuilderBid, SignedValidatorRegistration, VersionedValue,
    },
};
use ethereum_consensus::primitives::{BlsPublicKey, Hash32, Slot, ValidatorIndex};
use ethereum_consensus::ssz::prelude::U256;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, warn};

/// Registrations may not be stamped further into the future than this.
const MAX_REGISTRATION_TIMESTAMP_AHEAD: u64 = 10;

/// Response padding for rejected-but-masked submissions, so builders cannot
/// time their way to their own status.
const BLACKLIST_RESPONSE_DELAY: Duration = Duration::from_millis(200);

const DUTY_REFRESH_INTERVAL_SLOTS: u64 = 8;

fn unix_time_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

fn unix_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

pub struct RelayOptions {
    pub secret_key: SecretKey,
    pub details: NetworkDetails,
    pub datastore: Datastore,
    pub beacon: Arc<dyn BeaconClient>,
    pub audit: Arc<dyn AuditStore>,
    pub gate: SimulationGate,
    pub flags: FeatureFlags,
    pub gc_horizon_slots: u64,
}

#[derive(Clone)]
pub struct Relay(Arc<Inner>);

impl Deref for Relay {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct Inner {
    secret_key: SecretKey,
    public_key: BlsPublicKey,
    details: NetworkDetails,
    datastore: Datastore,
    beacon: Arc<dyn BeaconClient>,
    audit: Arc<dyn AuditStore>,
    gate: SimulationGate,
    flags: FeatureFlags,
    gc_horizon_slots: u64,

    head_slot: AtomicU64,
    proposer_duties: RwLock<Vec<ProposerSchedule>>,
    duties_slot: AtomicU64,
    updating_duties: AtomicBool,
}

struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Relay {
    pub fn new(options: RelayOptions) -> Self {
        let public_key = options.secret_key.public_key();
        Self(Arc::new(Inner {
            secret_key: options.secret_key,
            public_key,
            details: options.details,
            datastore: options.datastore,
            beacon: options.beacon,
            audit: options.audit,
            gate: options.gate,
            flags: options.flags,
            gc_horizon_slots: options.gc_horizon_slots,
            head_slot: AtomicU64::new(0),
            proposer_duties: RwLock::new(Vec::new()),
            duties_slot: AtomicU64::new(0),
            updating_duties: AtomicBool::new(false),
        }))
    }

    pub fn public_key(&self) -> &BlsPublicKey {
        &self.public_key
    }

    pub fn network_details(&self) -> &NetworkDetails {
        &self.details
    }

    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn head_slot(&self) -> Slot {
        self.head_slot.load(Ordering::SeqCst)
    }

    /// Startup sequence: fail hard if another instance registered a
    /// different relay key, warm the validator mirror, then take the beacon
    /// head and duties before serving.
    pub async fn initialize(&self) -> Result<(), Error> {
        let public_key = format!("{:?}", self.public_key);
        match self.datastore.cache().relay_config(CONFIG_FIELD_PUBKEY).await? {
            None => {
                self.datastore.cache().set_relay_config(CONFIG_FIELD_PUBKEY, &public_key).await?
            }
            Some(existing) if existing.is_empty() => {
                self.datastore.cache().set_relay_config(CONFIG_FIELD_PUBKEY, &public_key).await?
            }
            Some(existing) if existing != public_key => {
                return Err(Error::RelayPubkeyMismatch { new: public_key, old: existing })
            }
            Some(_) => {}
        }
        info!(relay_public_key = %public_key, "relay key checked against shared config");

        match self.datastore.load_known_validators().await {
            Ok(count) => info!(count, "warmed known validators from cache"),
            Err(err) => warn!(%err, "could not warm known validators from cache"),
        }
        let count = self.datastore.refresh_known_validators().await?;
        info!(count, "refreshed known validators");

        let sync_status = self.beacon.sync_status().await?;
        if sync_status.is_syncing {
            warn!(head_slot = sync_status.head_slot, "beacon node is still syncing");
        }
        self.head_slot.store(sync_status.head_slot, Ordering::SeqCst);
        self.refresh_proposer_duties(sync_status.head_slot).await;
        Ok(())
    }

    // -- slot clock --------------------------------------------------------

    pub fn process_new_slot(&self, slot: Slot) {
        let current = self.head_slot.load(Ordering::SeqCst);
        if slot <= current {
            return
        }
        if current > 0 {
            for missed in current + 1..slot {
                warn!(missed_slot = missed, "missed slot");
            }
        }
        self.head_slot.store(slot, Ordering::SeqCst);
        let epoch = slot / self.details.slots_per_epoch();
        info!(epoch, head_slot = slot, "updated head slot");

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) =
                this.datastore.cache().set_stats(STATS_FIELD_LATEST_SLOT, &slot.to_string()).await
            {
                warn!(%err, "could not record latest slot");
            }
            this.update_proposer_duties(slot).await;
        });
    }

    /// Single-flight duty refresh: a refresh that finds another one running
    /// is dropped, not queued. Refreshes fire on every eighth slot or when a
    /// gap of at least eight slots has built up.
    pub async fn update_proposer_duties(&self, head_slot: Slot) {
        if self.updating_duties.swap(true, Ordering::SeqCst) {
            return
        }
        let _clear = ClearOnDrop(&self.updating_duties);

        let last_refresh = self.duties_slot.load(Ordering::SeqCst);
        if head_slot % DUTY_REFRESH_INTERVAL_SLOTS != 0 &&
            head_slot.saturating_sub(last_refresh) < DUTY_REFRESH_INTERVAL_SLOTS
        {
            return
        }
        self.refresh_proposer_duties(head_slot).await;
    }

    async fn refresh_proposer_duties(&self, head_slot: Slot) {
        match self.fetch_registered_duties(head_slot).await {
            Ok(duties) => {
                let slots: Vec<Slot> = duties.iter().map(|duty| duty.slot).collect();
                if let Err(err) = self.datastore.set_proposer_duties(&duties).await {
                    warn!(%err, "could not publish proposer duties to cache");
                }
                *self.proposer_duties.write() = duties;
                self.duties_slot.store(head_slot, Ordering::SeqCst);
                info!(?slots, "proposer duties updated");
            }
            Err(err) => error!(%err, "failed to update proposer duties"),
        }
    }

    /// Duties for the current and next epoch, restricted to proposers that
    /// have a live registration.
    async fn fetch_registered_duties(
        &self,
        head_slot: Slot,
    ) -> Result<Vec<ProposerSchedule>, Error> {
        let epoch = head_slot / self.details.slots_per_epoch();
        let mut duties = self.beacon.get_proposer_duties(epoch).await?;
        duties.extend(self.beacon.get_proposer_duties(epoch + 1).await?);

        let mut schedules = Vec::with_capacity(duties.len());
        for duty in duties {
            if duty.slot <= head_slot {
                continue
            }
            if let Some(entry) = self.datastore.registration(&duty.public_key).await? {
                schedules.push(ProposerSchedule {
                    slot: duty.slot,
                    validator_index: duty.validator_index,
                    entry,
                });
            }
        }
        Ok(schedules)
    }

    pub fn proposer_schedule(&self) -> Vec<ProposerSchedule> {
        self.proposer_duties.read().clone()
    }

    // -- background maintenance -------------------------------------------

    pub async fn run_gc_once(&self) {
        let head_slot = self.head_slot();
        let (removed, remaining) =
            self.datastore.cleanup_old_bids_and_blocks(head_slot, self.gc_horizon_slots).await;
        info!(removed, remaining, "cleaned up old bids and blocks");
    }

    pub async fn refresh_known_validators(&self) {
        match self.datastore.refresh_known_validators().await {
            Ok(count) => info!(count, "updated known validators"),
            Err(err) => error!(%err, "error refreshing known validators"),
        }
    }

    // -- block submission (§ builder API) ----------------------------------

    /// Full submission pipeline; `Ok(())` means HTTP 200, which deliberately
    /// covers masked rejections (blacklist, low-prio, empty, outbid).
    pub async fn submit_block(
        &self,
        submission: SignedBidSubmission,
        cancellations_enabled: bool,
    ) -> Result<(), Error> {
        let received_at_ms = unix_time_ms();
        let message = &submission.message;
        let builder = message.builder_public_key.clone();

        let status = self.datastore.cache().builder_status(&builder).await.unwrap_or_else(|err| {
            warn!(%err, "could not get builder status");
            BuilderStatus::Normal
        });
        if status.is_blacklisted() {
            info!(builder_public_key = %builder, "builder is blacklisted");
            tokio::time::sleep(BLACKLIST_RESPONSE_DELAY).await;
            return Ok(())
        }
        if self.flags.disable_low_prio_builders && !status.is_high_prio() {
            info!(builder_public_key = %builder, "rejecting low-prio builder");
            tokio::time::sleep(BLACKLIST_RESPONSE_DELAY).await;
            return Ok(())
        }

        if message.slot <= self.head_slot() {
            return Err(Error::SubmissionForPastSlot)
        }

        if message.value == U256::from(0u64) || submission.transaction_count() == 0 {
            debug!(%submission, "dropping submission with no value or transactions");
            return Ok(())
        }

        let payload = &submission.execution_payload;
        if &message.block_hash != payload.block_hash() {
            return Err(Error::BlockHashMismatch)
        }
        if &message.parent_hash != payload.parent_hash() {
            return Err(Error::ParentHashMismatch)
        }
        if &message.proposer_fee_recipient != payload.fee_recipient() {
            return Err(Error::FeeRecipientMismatch)
        }

        verify_signed_builder_message(message, &submission.signature, &builder, &self.details)
            .map_err(|_| Error::InvalidSignature)?;

        if let Err(err) = self.gate.simulate(&submission).await {
            warn!(%submission, %err, "block simulation failed");
            self.spawn_submission_audit(&submission, Some(err.to_string()), false, received_at_ms);
            return Err(err)
        }

        let auction = AuctionRequest {
            slot: message.slot,
            parent_hash: message.parent_hash.clone(),
            public_key: message.proposer_public_key.clone(),
        };
        let block_key = BlockKey {
            slot: message.slot,
            proposer_public_key: message.proposer_public_key.clone(),
            block_hash: message.block_hash.clone(),
        };

        // escrow before the bid becomes visible, so any served header can be
        // redeemed even after cancellation fallback
        let escrow = EscrowedPayload {
            trace: message.clone(),
            execution_payload: submission.execution_payload.clone(),
        };
        self.datastore.save_payload(&block_key, &escrow).await?;

        let header = to_header(&submission.execution_payload)?;
        let bid = BuilderBid { header, value: message.value, public_key: self.public_key.clone() };
        let signature = sign_builder_message(&bid, &self.secret_key, &self.details)?;
        let signed_builder_bid = SignedBuilderBid { message: bid, signature };

        let candidate = BidCandidate {
            builder_public_key: builder.clone(),
            block_hash: message.block_hash.clone(),
            value: message.value,
            received_at_ms,
            cancellations_enabled,
            signed_builder_bid,
        };
        self.datastore.save_bid_candidate(&auction, candidate).await?;
        let top = self.datastore.promote_top_bid(&auction).await?;
        let was_top_bid =
            top.as_ref().is_some_and(|top| top.block_hash == message.block_hash);

        info!(%submission, was_top_bid, "received block from builder");
        self.spawn_submission_audit(&submission, None, was_top_bid, received_at_ms);
        Ok(())
    }

    fn spawn_submission_audit(
        &self,
        submission: &SignedBidSubmission,
        sim_error: Option<String>,
        was_top_bid: bool,
        received_at_ms: u64,
    ) {
        let entry = SubmissionEntry {
            inserted_at_ms: unix_time_ms(),
            trace: submission.message.clone(),
            block_number: payload_block_number(&submission.execution_payload),
            num_tx: submission.transaction_count(),
            timestamp_ms: received_at_ms,
            optimistic_submission: false,
            sim_success: sim_error.is_none(),
            sim_error: sim_error.unwrap_or_default(),
            was_top_bid,
        };
        let audit = self.audit.clone();
        tokio::spawn(async move {
            let builder = entry.trace.builder_public_key.clone();
            let slot = entry.trace.slot;
            let sim_failed = !entry.sim_success;
            if let Err(err) = audit.save_submission(entry).await {
                error!(%err, "saving builder block submission failed");
                return
            }
            if let Err(err) =
                audit.upsert_builder_after_submission(&builder, slot, sim_failed).await
            {
                error!(%err, "failed to upsert block builder entry");
            }
        });
    }

    // -- proposer API ------------------------------------------------------

    /// Bulk registration. Any hard failure rejects the whole batch before
    /// anything persists; entries that merely carry an outdated timestamp
    /// are skipped silently.
    pub async fn register_validators(
        &self,
        registrations: Vec<SignedValidatorRegistration>,
    ) -> Result<(), Error> {
        let started_at = std::time::Instant::now();
        let cutoff = unix_time_secs() + MAX_REGISTRATION_TIMESTAMP_AHEAD;
        let total = registrations.len();

        let mut pending = Vec::new();
        for registration in registrations {
            let message = &registration.message;
            if message.timestamp > cutoff {
                return Err(Error::TimestampTooFarInFuture)
            }
            if self.datastore.validator_index(&message.public_key).is_none() {
                return Err(Error::UnknownValidator(message.public_key.clone()))
            }
            let previous = self.datastore.registration_timestamp(&message.public_key).await?;
            if previous.is_some_and(|previous| message.timestamp <= previous) {
                continue
            }
            pending.push(registration);
        }

        pending.par_iter().try_for_each(|registration| {
            verify_signed_builder_message(
                &registration.message,
                &registration.signature,
                &registration.message.public_key,
                &self.details,
            )
            .map_err(|_| Error::InvalidSignature)
        })?;

        for registration in &pending {
            self.datastore.save_registration(registration).await?;
        }
        let audit = self.audit.clone();
        let entries = pending.clone();
        tokio::spawn(async move {
            for entry in &entries {
                if let Err(err) = audit.save_registration(entry).await {
                    error!(%err, "failed to record validator registration");
                }
            }
        });

        info!(
            num_registrations = total,
            num_registrations_new = pending.len(),
            elapsed = ?started_at.elapsed(),
            "validator registrations processed"
        );
        Ok(())
    }

    /// The read side of the auction. Never blocks on anything but the cache.
    pub async fn fetch_best_bid(
        &self,
        auction: &AuctionRequest,
    ) -> Result<Option<VersionedValue<SignedBuilderBid>>, Error> {
        if auction.slot < self.head_slot() {
            return Err(Error::SlotTooOld)
        }
        if self.flags.force_get_header_204 {
            info!(%auction, "forced getHeader 204 response");
            return Ok(None)
        }
        let Some(top) = self.datastore.top_bid(auction).await? else { return Ok(None) };
        if top.value == U256::from(0u64) {
            return Ok(None)
        }
        info!(%auction, bid = %top.signed_builder_bid, "bid delivered");
        let version = top.signed_builder_bid.version();
        Ok(Some(VersionedValue { version, data: top.signed_builder_bid }))
    }

    /// Commit/reveal: a valid proposer signature over the blinded block is
    /// exchanged for the escrowed payload. The escrow entry survives the
    /// read, so retries of the same block key see the same payload.
    pub async fn open_bid(
        &self,
        signed_block: SignedBlindedBeaconBlock,
    ) -> Result<VersionedValue<ExecutionPayload>, Error> {
        let (slot, proposer_index, block_hash) = blinded_block_parts(&signed_block)?;
        let proposer = self
            .datastore
            .public_key_by_index(proposer_index)
            .ok_or(Error::UnknownProposerIndex(proposer_index))?;

        verify_blinded_block(&signed_block, &proposer, &self.details)
            .map_err(|_| Error::InvalidSignature)?;

        let block_key =
            BlockKey { slot, proposer_public_key: proposer, block_hash: block_hash.clone() };
        let Some(escrow) = self.datastore.payload(&block_key).await? else {
            info!(%block_key, "no execution payload for this request");
            return Err(Error::MissingPayload)
        };

        info!(%block_key, num_tx = crate::types::transaction_count(&escrow.execution_payload),
            "execution payload delivered");

        let this = self.clone();
        let payload = escrow.execution_payload.clone();
        tokio::spawn(async move {
            // the delivered-payload record lands before publishing begins
            this.record_delivered_payload(&escrow).await;
            if this.flags.disable_block_publishing {
                info!("publishing the block is disabled");
                return
            }
            match unblind_signed_block(&signed_block, &escrow.execution_payload) {
                Ok(block) => {
                    if let Err(err) = this.beacon.publish_block(&block).await {
                        error!(%err, "failed to publish beacon block");
                    }
                }
                Err(err) => error!(%err, "could not reconstruct beacon block for publishing"),
            }
        });

        Ok(VersionedValue { version: payload.version(), data: payload })
    }

    async fn record_delivered_payload(&self, escrow: &EscrowedPayload) {
        let entry = DeliveredPayloadEntry {
            inserted_at_ms: unix_time_ms(),
            trace: escrow.trace.clone(),
            block_number: payload_block_number(&escrow.execution_payload),
            num_tx: crate::types::transaction_count(&escrow.execution_payload),
        };
        for attempt in 0..3 {
            match self.audit.save_delivered_payload(entry.clone()).await {
                Ok(()) => {
                    if let Err(err) =
                        self.audit.inc_builder_delivered(&entry.trace.builder_public_key).await
                    {
                        warn!(%err, "could not increment builder delivery stats");
                    }
                    return
                }
                Err(err) => {
                    error!(%err, attempt, "failed to save delivered payload");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    // -- internal API ------------------------------------------------------

    pub async fn builder_entry(&self, builder: &BlsPublicKey) -> Result<BuilderEntry, Error> {
        self.audit.builder_entry(builder).await?.ok_or(Error::UnknownBuilder)
    }

    /// Updates both the cache (submission fast path) and the audit store
    /// (authoritative record).
    pub async fn set_builder_status(
        &self,
        builder: &BlsPublicKey,
        status: BuilderStatus,
    ) -> Result<(), Error> {
        info!(builder_public_key = %builder, %status, "updating builder status");
        self.datastore.cache().set_builder_status(builder, status).await?;
        self.audit.set_builder_status(builder, status).await?;
        Ok(())
    }

    // -- data API ----------------------------------------------------------

    pub async fn delivered_payloads(
        &self,
        filters: &TraceFilters,
    ) -> Result<Vec<DeliveredPayloadEntry>, Error> {
        self.audit.delivered_payloads(filters).await.map_err(From::from)
    }

    pub async fn builder_submissions(
        &self,
        filters: &TraceFilters,
    ) -> Result<Vec<SubmissionEntry>, Error> {
        self.audit.submissions(filters).await.map_err(From::from)
    }

    pub async fn registration(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<SignedValidatorRegistration, Error> {
        self.datastore
            .registration(public_key)
            .await?
            .ok_or_else(|| Error::MissingRegistration(public_key.clone()))
    }
}

fn payload_block_number(payload: &ExecutionPayload) -> u64 {
    match payload {
        ExecutionPayload::Bellatrix(inner) => inner.block_number,
        ExecutionPayload::Capella(inner) => inner.block_number,
        ExecutionPayload::Deneb(inner) => inner.block_number,
        _ => 0,
    }
}

fn blinded_block_parts(
    signed_block: &SignedBlindedBeaconBlock,
) -> Result<(Slot, ValidatorIndex, Hash32), Error> {
    match signed_block {
        SignedBlindedBeaconBlock::Bellatrix(inner) => Ok((
            inner.message.slot,
            inner.message.proposer_index,
            inner.message.body.execution_payload_header.block_hash.clone(),
        )),
        SignedBlindedBeaconBlock::Capella(inner) => Ok((
            inner.message.slot,
            inner.message.proposer_index,
            inner.message.body.execution_payload_header.block_hash.clone(),
        )),
        SignedBlindedBeaconBlock::Deneb(inner) => Ok((
            inner.message.slot,
            inner.message.proposer_index,
            inner.message.body.execution_payload_header.block_hash.clone(),
        )),
        _ => Err(Error::InvalidFork),
    }
}

fn verify_blinded_block(
    signed_block: &SignedBlindedBeaconBlock,
    proposer: &BlsPublicKey,
    details: &NetworkDetails,
) -> Result<(), Error> {
    match signed_block {
        SignedBlindedBeaconBlock::Bellatrix(inner) => verify_signed_consensus_message(
            &inner.message,
            &inner.signature,
            proposer,
            details,
            inner.message.slot,
        ),
        SignedBlindedBeaconBlock::Capella(inner) => verify_signed_consensus_message(
            &inner.message,
            &inner.signature,
            proposer,
            details,
            inner.message.slot,
        ),
        SignedBlindedBeaconBlock::Deneb(inner) => verify_signed_consensus_message(
            &inner.message,
            &inner.signature,
            proposer,
            details,
            inner.message.slot,
        ),
        _ => Err(Error::InvalidFork),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::InMemoryAuditStore,
        beacon::mock::MockBeaconClient,
        beacon::{BeaconProposerDuty, ValidatorData, ValidatorDescriptor},
        cache::{Cache, InMemoryCache},
        network::Network,
        simulation::BlockSimulator,
        types::BidTrace,
    };
    use async_trait::async_trait;
    use ethereum_consensus::capella::mainnet as capella;

    struct StubSimulator {
        fail_with: parking_lot::Mutex<Option<String>>,
    }

    #[async_trait]
    impl BlockSimulator for StubSimulator {
        async fn simulate(&self, _submission: &SignedBidSubmission) -> Result<(), Error> {
            match self.fail_with.lock().clone() {
                Some(message) => Err(Error::SimulationFailed(message)),
                None => Ok(()),
            }
        }
    }

    struct Harness {
        relay: Relay,
        beacon: Arc<MockBeaconClient>,
        simulator: Arc<StubSimulator>,
        proposers: Vec<SecretKey>,
    }

    async fn harness(head_slot: Slot) -> Harness {
        let details = NetworkDetails::try_from_network(Network::Mainnet).unwrap();
        let mut rng = rand::thread_rng();
        let secret_key = SecretKey::random(&mut rng).unwrap();

        let proposers: Vec<SecretKey> =
            (0..4).map(|_| SecretKey::random(&mut rng).unwrap()).collect();
        let beacon = Arc::new(MockBeaconClient::new(head_slot));
        beacon.set_validators(
            proposers
                .iter()
                .enumerate()
                .map(|(index, key)| ValidatorDescriptor {
                    index,
                    status: "active_ongoing".to_string(),
                    validator: ValidatorData { public_key: key.public_key() },
                })
                .collect(),
        );
        beacon.set_duties(
            proposers
                .iter()
                .enumerate()
                .map(|(index, key)| BeaconProposerDuty {
                    public_key: key.public_key(),
                    slot: head_slot + 1 + index as u64,
                    validator_index: index,
                })
                .collect(),
        );

        let cache = Cache::new(Arc::new(InMemoryCache::default()), "mainnet");
        let datastore = Datastore::new(cache, beacon.clone());
        let audit = Arc::new(InMemoryAuditStore::new());
        let simulator = Arc::new(StubSimulator { fail_with: parking_lot::Mutex::new(None) });
        let gate = SimulationGate::new(simulator.clone(), 4);

        let relay = Relay::new(RelayOptions {
            secret_key,
            details,
            datastore,
            beacon: beacon.clone(),
            audit,
            gate,
            flags: FeatureFlags::default(),
            gc_horizon_slots: 0,
        });
        relay.initialize().await.unwrap();
        Harness { relay, beacon, simulator, proposers }
    }

    fn registration(
        key: &SecretKey,
        timestamp: u64,
        details: &NetworkDetails,
    ) -> SignedValidatorRegistration {
        let message = crate::types::ValidatorRegistration {
            fee_recipient: Default::default(),
            gas_limit: 30_000_000,
            timestamp,
            public_key: key.public_key(),
        };
        let signature = sign_builder_message(&message, key, details).unwrap();
        SignedValidatorRegistration { message, signature }
    }

    fn submission(
        builder: &SecretKey,
        proposer: &BlsPublicKey,
        slot: Slot,
        value: u64,
        details: &NetworkDetails,
    ) -> SignedBidSubmission {
        let mut payload = capella::ExecutionPayload::default();
        payload.block_hash = Hash32::try_from([value as u8; 32].as_ref()).unwrap();
        let transaction = capella::Transaction::try_from([0x02u8; 8].as_ref()).unwrap();
        payload.transactions = TryFrom::try_from(vec![transaction]).unwrap();
        let message = BidTrace {
            slot,
            parent_hash: Default::default(),
            block_hash: payload.block_hash.clone(),
            builder_public_key: builder.public_key(),
            proposer_public_key: proposer.clone(),
            proposer_fee_recipient: Default::default(),
            gas_limit: payload.gas_limit,
            gas_used: payload.gas_used,
            value: U256::from(value),
        };
        let signature = sign_builder_message(&message, builder, details).unwrap();
        SignedBidSubmission {
            message,
            execution_payload: ExecutionPayload::Capella(payload),
            signature,
        }
    }

    #[tokio::test]
    async fn submission_round_trips_through_get_header() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let proposer = harness.proposers[0].public_key();

        let submission = submission(&builder, &proposer, 33, 10, &details);
        relay.submit_block(submission.clone(), false).await.unwrap();

        let auction = AuctionRequest { slot: 33, parent_hash: Default::default(), public_key: proposer };
        let bid = relay.fetch_best_bid(&auction).await.unwrap().unwrap();
        assert_eq!(bid.data.message.value, U256::from(10u64));
        assert_eq!(
            bid.data.message.header.block_hash(),
            &submission.message.block_hash
        );
        // the relay's own signature over the served header verifies
        bid.data.verify_signature(&details).unwrap();
        assert_eq!(bid.data.message.public_key, *relay.public_key());
    }

    #[tokio::test]
    async fn stale_and_empty_submissions_are_filtered() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let proposer = harness.proposers[0].public_key();

        // past slot is a hard error
        let stale = submission(&builder, &proposer, 32, 10, &details);
        assert!(matches!(
            relay.submit_block(stale, false).await,
            Err(Error::SubmissionForPastSlot)
        ));

        // zero value is accepted but not stored
        let empty = submission(&builder, &proposer, 33, 0, &details);
        relay.submit_block(empty, false).await.unwrap();
        let auction = AuctionRequest { slot: 33, parent_hash: Default::default(), public_key: proposer };
        assert!(relay.fetch_best_bid(&auction).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hash_mismatches_and_bad_signatures_are_rejected() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let proposer = harness.proposers[0].public_key();

        let mut tampered = submission(&builder, &proposer, 33, 10, &details);
        tampered.message.block_hash = Hash32::try_from([0xffu8; 32].as_ref()).unwrap();
        // hash mismatch reported before any signature check
        assert!(matches!(
            relay.submit_block(tampered, false).await,
            Err(Error::BlockHashMismatch)
        ));

        let mut unsigned = submission(&builder, &proposer, 33, 10, &details);
        unsigned.signature = Default::default();
        assert!(matches!(
            relay.submit_block(unsigned, false).await,
            Err(Error::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn simulation_failures_are_audited() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let proposer = harness.proposers[0].public_key();

        *harness.simulator.fail_with.lock() = Some("nonce too low".to_string());
        let submission = submission(&builder, &proposer, 33, 10, &details);
        let err = relay.submit_block(submission, false).await.unwrap_err();
        assert!(matches!(err, Error::SimulationFailed(message) if message.contains("nonce")));

        // audit write happens in the background
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rows = relay
            .builder_submissions(&TraceFilters::with_limit(200))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].sim_success);
        assert!(rows[0].sim_error.contains("nonce"));

        let auction = AuctionRequest { slot: 33, parent_hash: Default::default(), public_key: proposer };
        assert!(relay.fetch_best_bid(&auction).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blacklisted_builders_get_masked_200() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let proposer = harness.proposers[0].public_key();

        relay
            .set_builder_status(&builder.public_key(), BuilderStatus::Blacklisted)
            .await
            .unwrap();

        let started_at = std::time::Instant::now();
        let submission = submission(&builder, &proposer, 33, 10, &details);
        relay.submit_block(submission, false).await.unwrap();
        assert!(started_at.elapsed() >= BLACKLIST_RESPONSE_DELAY);

        // nothing stored, nothing audited
        let auction = AuctionRequest { slot: 33, parent_hash: Default::default(), public_key: proposer };
        assert!(relay.fetch_best_bid(&auction).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let rows = relay.builder_submissions(&TraceFilters::with_limit(200)).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn registration_batch_is_fail_fast() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let now = unix_time_secs();

        let good = registration(&harness.proposers[0], now, &details);
        let mut unknown = registration(&harness.proposers[1], now, &details);
        let mut rng = rand::thread_rng();
        let stranger = SecretKey::random(&mut rng).unwrap();
        unknown.message.public_key = stranger.public_key();

        let err = relay
            .register_validators(vec![good.clone(), unknown])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownValidator(..)));
        // fail-fast: the valid entry from the failed batch is not persisted
        assert!(relay
            .datastore()
            .registration(&good.message.public_key)
            .await
            .unwrap()
            .is_none());

        // a clean batch lands
        relay.register_validators(vec![good.clone()]).await.unwrap();
        let stored =
            relay.datastore().registration(&good.message.public_key).await.unwrap().unwrap();
        assert_eq!(stored.message.timestamp, now);

        // future timestamps beyond the allowance are rejected outright
        let future = registration(&harness.proposers[2], now + 11, &details);
        assert!(matches!(
            relay.register_validators(vec![future]).await,
            Err(Error::TimestampTooFarInFuture)
        ));
    }

    #[tokio::test]
    async fn registration_timestamps_are_monotonic() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let proposer = &harness.proposers[0];
        let now = unix_time_secs();

        relay.register_validators(vec![registration(proposer, now, &details)]).await.unwrap();
        // older registration is skipped silently
        relay
            .register_validators(vec![registration(proposer, now - 1, &details)])
            .await
            .unwrap();
        let stored = relay.datastore().registration(&proposer.public_key()).await.unwrap().unwrap();
        assert_eq!(stored.message.timestamp, now);

        relay.register_validators(vec![registration(proposer, now + 1, &details)]).await.unwrap();
        let stored = relay.datastore().registration(&proposer.public_key()).await.unwrap().unwrap();
        assert_eq!(stored.message.timestamp, now + 1);
    }

    #[tokio::test]
    async fn get_payload_requires_known_proposer_and_signature() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let proposer_key = &harness.proposers[0];
        let proposer = proposer_key.public_key();

        let submission = submission(&builder, &proposer, 33, 10, &details);
        let block_hash = submission.message.block_hash.clone();
        relay.submit_block(submission, false).await.unwrap();

        let make_blinded = |proposer_index: usize, signing_key: &SecretKey| {
            let mut header = capella::ExecutionPayloadHeader::default();
            header.block_hash = block_hash.clone();
            let message = capella::BlindedBeaconBlock {
                slot: 33,
                proposer_index,
                body: capella::BlindedBeaconBlockBody {
                    execution_payload_header: header,
                    ..Default::default()
                },
                ..Default::default()
            };
            let domain = details.proposer_domain(33).unwrap();
            let signature =
                ethereum_consensus::signing::sign_with_domain(&message, signing_key, domain)
                    .unwrap();
            SignedBlindedBeaconBlock::Capella(capella::SignedBlindedBeaconBlock {
                message,
                signature,
            })
        };

        // unknown proposer index
        let err = relay.open_bid(make_blinded(99, proposer_key)).await.unwrap_err();
        assert!(matches!(err, Error::UnknownProposerIndex(99)));

        // wrong signer
        let stranger = SecretKey::random(&mut rng).unwrap();
        let err = relay.open_bid(make_blinded(0, &stranger)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));

        // the real proposer gets the payload, and a retry sees it again
        let response = relay.open_bid(make_blinded(0, proposer_key)).await.unwrap();
        assert_eq!(response.data.block_hash(), &block_hash);
        let response = relay.open_bid(make_blinded(0, proposer_key)).await.unwrap();
        assert_eq!(response.data.block_hash(), &block_hash);

        // background: audit row written and block published
        tokio::time::sleep(Duration::from_millis(100)).await;
        let delivered = relay.delivered_payloads(&TraceFilters::with_limit(200)).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].trace.block_hash, block_hash);
        assert_eq!(harness.beacon.published_blocks().len(), 2);
    }

    #[tokio::test]
    async fn gc_purges_bids_once_head_advances() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let mut rng = rand::thread_rng();
        let builder = SecretKey::random(&mut rng).unwrap();
        let proposer = harness.proposers[0].public_key();

        let submission = submission(&builder, &proposer, 33, 10, &details);
        relay.submit_block(submission, false).await.unwrap();

        relay.process_new_slot(34);
        relay.run_gc_once().await;

        let auction =
            AuctionRequest { slot: 33, parent_hash: Default::default(), public_key: proposer };
        // the auction is for a past slot now
        assert!(matches!(relay.fetch_best_bid(&auction).await, Err(Error::SlotTooOld)));
        assert!(relay.datastore().top_bid(&auction).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duty_refresh_joins_duties_with_registrations() {
        let harness = harness(32).await;
        let relay = &harness.relay;
        let details = relay.network_details().clone();
        let now = unix_time_secs();

        // no registrations yet: schedule is empty
        assert!(relay.proposer_schedule().is_empty());

        relay
            .register_validators(vec![registration(&harness.proposers[0], now, &details)])
            .await
            .unwrap();
        harness.beacon.set_duties(vec![BeaconProposerDuty {
            public_key: harness.proposers[0].public_key(),
            slot: 41,
            validator_index: 0,
        }]);
        relay.update_proposer_duties(40).await;

        let schedule = relay.proposer_schedule();
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].slot, 41);
        assert_eq!(schedule[0].validator_index, 0);
        assert_eq!(
            schedule[0].entry.message.public_key,
            harness.proposers[0].public_key()
        );
    }
}
