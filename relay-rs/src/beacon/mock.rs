//! A scriptable beacon client for tests: fixed validator set and duties,
//! head events fed through a channel, published blocks captured for
//! inspection.

use super::{BeaconClient, BeaconProposerDuty, Error, HeadEvent, SyncStatus, ValidatorDescriptor};
use crate::types::SignedBeaconBlock;
use async_trait::async_trait;
use ethereum_consensus::primitives::{Epoch, Slot};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct MockBeaconClient {
    head_slot: Mutex<Slot>,
    validators: Mutex<Vec<ValidatorDescriptor>>,
    duties: Mutex<Vec<BeaconProposerDuty>>,
    published: Mutex<Vec<SignedBeaconBlock>>,
    head_events: Mutex<Option<mpsc::Receiver<HeadEvent>>>,
    fail_publish: Mutex<bool>,
}

impl MockBeaconClient {
    pub fn new(head_slot: Slot) -> Self {
        Self {
            head_slot: Mutex::new(head_slot),
            validators: Default::default(),
            duties: Default::default(),
            published: Default::default(),
            head_events: Mutex::new(None),
            fail_publish: Mutex::new(false),
        }
    }

    pub fn set_validators(&self, validators: Vec<ValidatorDescriptor>) {
        *self.validators.lock() = validators;
    }

    pub fn set_duties(&self, duties: Vec<BeaconProposerDuty>) {
        *self.duties.lock() = duties;
    }

    pub fn set_head_slot(&self, slot: Slot) {
        *self.head_slot.lock() = slot;
    }

    pub fn fail_publish(&self, fail: bool) {
        *self.fail_publish.lock() = fail;
    }

    /// Returns the sender side of the head-event stream served by
    /// `stream_head_events`.
    pub fn head_event_channel(&self, capacity: usize) -> mpsc::Sender<HeadEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.head_events.lock() = Some(rx);
        tx
    }

    pub fn published_blocks(&self) -> Vec<SignedBeaconBlock> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl BeaconClient for MockBeaconClient {
    async fn sync_status(&self) -> Result<SyncStatus, Error> {
        Ok(SyncStatus { head_slot: *self.head_slot.lock(), is_syncing: false })
    }

    async fn get_validators(&self) -> Result<Vec<ValidatorDescriptor>, Error> {
        Ok(self.validators.lock().clone())
    }

    async fn get_proposer_duties(&self, epoch: Epoch) -> Result<Vec<BeaconProposerDuty>, Error> {
        let slots_per_epoch = 32;
        let duties = self
            .duties
            .lock()
            .iter()
            .filter(|duty| duty.slot / slots_per_epoch == epoch)
            .cloned()
            .collect();
        Ok(duties)
    }

    async fn publish_block(&self, block: &SignedBeaconBlock) -> Result<(), Error> {
        if *self.fail_publish.lock() {
            return Err(Error::Api("mock publish failure".to_string()))
        }
        self.published.lock().push(block.clone());
        Ok(())
    }

    async fn stream_head_events(&self, sender: mpsc::Sender<HeadEvent>) {
        let Some(mut receiver) = self.head_events.lock().take() else { return };
        while let Some(event) = receiver.recv().await {
            if sender.send(event).await.is_err() {
                return
            }
        }
    }
}
