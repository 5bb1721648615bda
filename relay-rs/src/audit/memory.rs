use super::{
    BuilderEntry, DeliveredPayloadEntry, Error, SubmissionEntry, TraceFilters, ValueOrdering,
};
use crate::types::{BuilderStatus, SignedValidatorRegistration};
use async_trait::async_trait;
use ethereum_consensus::primitives::{BlsPublicKey, Slot};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Audit store over process memory, keeping the uniqueness rules a SQL
/// deployment would enforce with constraints: one registration per pubkey
/// (newest timestamp), one delivery per (slot, proposer, block hash).
#[derive(Default)]
pub struct InMemoryAuditStore {
    registrations: Mutex<HashMap<BlsPublicKey, SignedValidatorRegistration>>,
    submissions: Mutex<Vec<SubmissionEntry>>,
    delivered: Mutex<Vec<DeliveredPayloadEntry>>,
    builders: Mutex<HashMap<BlsPublicKey, BuilderEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_trace_filters<'a, T>(
    rows: impl Iterator<Item = &'a T>,
    filters: &TraceFilters,
    trace_of: impl Fn(&T) -> (&crate::types::BidTrace, u64),
) -> Vec<T>
where
    T: Clone + 'a,
{
    let mut matched: Vec<T> = rows
        .filter(|row| {
            let (trace, block_number) = trace_of(row);
            filters.matches(trace, block_number)
        })
        .cloned()
        .collect();
    match filters.order_by_value {
        Some(ValueOrdering::Ascending) => {
            matched.sort_by(|a, b| trace_of(a).0.value.cmp(&trace_of(b).0.value))
        }
        Some(ValueOrdering::Descending) => {
            matched.sort_by(|a, b| trace_of(b).0.value.cmp(&trace_of(a).0.value))
        }
        // most recent first, like the backing index scan
        None => matched.sort_by(|a, b| trace_of(b).0.slot.cmp(&trace_of(a).0.slot)),
    }
    matched.truncate(filters.limit as usize);
    matched
}

#[async_trait]
impl super::AuditStore for InMemoryAuditStore {
    async fn save_registration(&self, entry: &SignedValidatorRegistration) -> Result<(), Error> {
        let mut registrations = self.registrations.lock();
        let current = registrations.get(&entry.message.public_key);
        // unique on pubkey, updated only for newer timestamps
        if current.is_some_and(|current| current.message.timestamp >= entry.message.timestamp) {
            return Ok(())
        }
        registrations.insert(entry.message.public_key.clone(), entry.clone());
        Ok(())
    }

    async fn registration(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<SignedValidatorRegistration>, Error> {
        Ok(self.registrations.lock().get(public_key).cloned())
    }

    async fn save_submission(&self, entry: SubmissionEntry) -> Result<(), Error> {
        self.submissions.lock().push(entry);
        Ok(())
    }

    async fn save_delivered_payload(&self, entry: DeliveredPayloadEntry) -> Result<(), Error> {
        let mut delivered = self.delivered.lock();
        let duplicate = delivered.iter().any(|existing| {
            existing.trace.slot == entry.trace.slot &&
                existing.trace.proposer_public_key == entry.trace.proposer_public_key &&
                existing.trace.block_hash == entry.trace.block_hash
        });
        if !duplicate {
            delivered.push(entry);
        }
        Ok(())
    }

    async fn delivered_payloads(
        &self,
        filters: &TraceFilters,
    ) -> Result<Vec<DeliveredPayloadEntry>, Error> {
        let delivered = self.delivered.lock();
        Ok(apply_trace_filters(delivered.iter(), filters, |entry| {
            (&entry.trace, entry.block_number)
        }))
    }

    async fn submissions(&self, filters: &TraceFilters) -> Result<Vec<SubmissionEntry>, Error> {
        let submissions = self.submissions.lock();
        Ok(apply_trace_filters(submissions.iter(), filters, |entry| {
            (&entry.trace, entry.block_number)
        }))
    }

    async fn builder_entry(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<BuilderEntry>, Error> {
        Ok(self.builders.lock().get(public_key).cloned())
    }

    async fn set_builder_status(
        &self,
        public_key: &BlsPublicKey,
        status: BuilderStatus,
    ) -> Result<(), Error> {
        let mut builders = self.builders.lock();
        let entry = builders.entry(public_key.clone()).or_insert_with(|| BuilderEntry {
            public_key: public_key.clone(),
            is_high_prio: false,
            is_blacklisted: false,
            num_submissions: 0,
            num_sim_failures: 0,
            num_delivered: 0,
            last_submission_slot: 0,
        });
        entry.is_high_prio = status.is_high_prio();
        entry.is_blacklisted = status.is_blacklisted();
        Ok(())
    }

    async fn upsert_builder_after_submission(
        &self,
        public_key: &BlsPublicKey,
        slot: Slot,
        sim_failed: bool,
    ) -> Result<(), Error> {
        let mut builders = self.builders.lock();
        let entry = builders.entry(public_key.clone()).or_insert_with(|| BuilderEntry {
            public_key: public_key.clone(),
            is_high_prio: false,
            is_blacklisted: false,
            num_submissions: 0,
            num_sim_failures: 0,
            num_delivered: 0,
            last_submission_slot: 0,
        });
        entry.num_submissions += 1;
        if sim_failed {
            entry.num_sim_failures += 1;
        }
        entry.last_submission_slot = entry.last_submission_slot.max(slot);
        Ok(())
    }

    async fn inc_builder_delivered(&self, public_key: &BlsPublicKey) -> Result<(), Error> {
        if let Some(entry) = self.builders.lock().get_mut(public_key) {
            entry.num_delivered += 1;
        }
        Ok(())
    }
}
