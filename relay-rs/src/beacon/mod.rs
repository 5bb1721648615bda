//! Adapter over the upstream beacon node(s): head-event stream, validator
//! set and proposer-duty queries, and block publishing. The relay only ever
//! talks to this trait; production runs use [`HttpBeaconClient`] endpoints
//! behind a [`MultiBeaconClient`].

mod http;
pub mod mock;
mod unblind;

pub use http::HttpBeaconClient;
pub use unblind::unblind_signed_block;

use crate::types::SignedBeaconBlock;
use async_trait::async_trait;
use ethereum_consensus::primitives::{BlsPublicKey, Epoch, Slot, ValidatorIndex};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("beacon node error: {0}")]
    Api(String),
    #[error("no beacon node available for request")]
    NoAvailableNode,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// The `head` topic of the beacon event stream; only the slot matters here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HeadEvent {
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SyncStatus {
    #[serde(with = "crate::serde::as_str")]
    pub head_slot: Slot,
    pub is_syncing: bool,
}

/// An entry of `/eth/v1/beacon/states/head/validators`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatorDescriptor {
    #[serde(with = "crate::serde::as_str")]
    pub index: ValidatorIndex,
    pub status: String,
    pub validator: ValidatorData,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatorData {
    #[serde(rename = "pubkey")]
    pub public_key: BlsPublicKey,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BeaconProposerDuty {
    #[serde(rename = "pubkey")]
    pub public_key: BlsPublicKey,
    #[serde(with = "crate::serde::as_str")]
    pub slot: Slot,
    #[serde(with = "crate::serde::as_str")]
    pub validator_index: ValidatorIndex,
}

#[async_trait]
pub trait BeaconClient: Send + Sync {
    async fn sync_status(&self) -> Result<SyncStatus, Error>;
    async fn get_validators(&self) -> Result<Vec<ValidatorDescriptor>, Error>;
    async fn get_proposer_duties(&self, epoch: Epoch) -> Result<Vec<BeaconProposerDuty>, Error>;
    async fn publish_block(&self, block: &SignedBeaconBlock) -> Result<(), Error>;

    /// Streams head events into `sender` until the receiving side goes away.
    /// Implementations reconnect indefinitely and never deliver slots out of
    /// order; intermediate slots may be dropped when the consumer lags.
    async fn stream_head_events(&self, sender: mpsc::Sender<HeadEvent>);

    async fn current_slot(&self) -> Result<Slot, Error> {
        Ok(self.sync_status().await?.head_slot)
    }
}

/// Fans out over several beacon nodes: reads prefer the most synced node,
/// publishes try each node until one accepts.
pub struct MultiBeaconClient {
    clients: Vec<Arc<HttpBeaconClient>>,
}

impl MultiBeaconClient {
    pub fn new(clients: Vec<Arc<HttpBeaconClient>>) -> Self {
        Self { clients }
    }

    pub fn from_endpoints(endpoints: &[url::Url]) -> Self {
        let clients =
            endpoints.iter().map(|endpoint| Arc::new(HttpBeaconClient::new(endpoint.clone()))).collect();
        Self::new(clients)
    }
}

#[async_trait]
impl BeaconClient for MultiBeaconClient {
    async fn sync_status(&self) -> Result<SyncStatus, Error> {
        let mut best: Option<SyncStatus> = None;
        for client in &self.clients {
            match client.sync_status().await {
                Ok(status) => {
                    if best.is_none_or(|current| status.head_slot > current.head_slot) {
                        best = Some(status);
                    }
                }
                Err(err) => warn!(endpoint = %client.endpoint(), %err, "failed to get sync status"),
            }
        }
        best.ok_or(Error::NoAvailableNode)
    }

    async fn get_validators(&self) -> Result<Vec<ValidatorDescriptor>, Error> {
        let mut last_error = Error::NoAvailableNode;
        for client in &self.clients {
            match client.get_validators().await {
                Ok(validators) => return Ok(validators),
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }

    async fn get_proposer_duties(&self, epoch: Epoch) -> Result<Vec<BeaconProposerDuty>, Error> {
        let mut last_error = Error::NoAvailableNode;
        for client in &self.clients {
            match client.get_proposer_duties(epoch).await {
                Ok(duties) => return Ok(duties),
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }

    async fn publish_block(&self, block: &SignedBeaconBlock) -> Result<(), Error> {
        let mut last_error = Error::NoAvailableNode;
        for client in &self.clients {
            match client.publish_block(block).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(endpoint = %client.endpoint(), %err, "failed to publish block");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn stream_head_events(&self, sender: mpsc::Sender<HeadEvent>) {
        let mut tasks = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            let client = client.clone();
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                client.stream_head_events(sender).await;
            }));
        }
        drop(sender);
        for task in tasks {
            let _ = task.await;
        }
    }
}
