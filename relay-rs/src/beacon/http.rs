use super::{BeaconClient, BeaconProposerDuty, Error, HeadEvent, SyncStatus, ValidatorDescriptor};
use crate::types::SignedBeaconBlock;
use async_trait::async_trait;
use ethereum_consensus::primitives::Epoch;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, serde::Deserialize)]
struct ApiResponse<T> {
    data: T,
}

pub struct HttpBeaconClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpBeaconClient {
    pub fn new(endpoint: Url) -> Self {
        Self { http: reqwest::Client::new(), endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint.as_str().trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let response = self.http.get(self.url(path)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("{path} returned {status}: {body}")))
        }
        let wrapper: ApiResponse<T> = response.json().await?;
        Ok(wrapper.data)
    }

    /// One subscription attempt; returns when the server closes the stream
    /// or the consumer goes away (signalled by `Ok(false)`).
    async fn subscribe_head_events_once(
        &self,
        sender: &mpsc::Sender<HeadEvent>,
    ) -> Result<bool, Error> {
        let response = self
            .http
            .get(self.url("/eth/v1/events?topics=head"))
            .header("accept", "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Api(format!("event stream returned {}", response.status())))
        }

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(boundary) = find_event_boundary(&buffer) {
                let event: Vec<u8> = buffer.drain(..boundary).collect();
                let Some(data) = event_data(&event) else { continue };
                match serde_json::from_str::<HeadEvent>(&data) {
                    Ok(head_event) => match sender.try_send(head_event) {
                        Ok(()) => {}
                        // consumer lags; drop this slot rather than stall the stream
                        Err(mpsc::error::TrySendError::Full(event)) => {
                            debug!(slot = event.slot, "head event consumer is behind, dropping")
                        }
                        Err(mpsc::error::TrySendError::Closed(..)) => return Ok(false),
                    },
                    Err(err) => warn!(%err, "could not decode head event"),
                }
            }
        }
        Ok(true)
    }
}

/// Events on the stream are separated by a blank line.
fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n").map(|position| position + 2)
}

fn event_data(event: &[u8]) -> Option<String> {
    for line in event.split(|byte| *byte == b'\n') {
        let line = std::str::from_utf8(line).ok()?;
        if let Some(data) = line.strip_prefix("data:") {
            return Some(data.trim().to_string())
        }
    }
    None
}

#[async_trait]
impl BeaconClient for HttpBeaconClient {
    async fn sync_status(&self) -> Result<SyncStatus, Error> {
        self.get_json("/eth/v1/node/syncing").await
    }

    async fn get_validators(&self) -> Result<Vec<ValidatorDescriptor>, Error> {
        self.get_json("/eth/v1/beacon/states/head/validators?status=active,pending").await
    }

    async fn get_proposer_duties(&self, epoch: Epoch) -> Result<Vec<BeaconProposerDuty>, Error> {
        self.get_json(&format!("/eth/v1/validator/duties/proposer/{epoch}")).await
    }

    async fn publish_block(&self, block: &SignedBeaconBlock) -> Result<(), Error> {
        let response =
            self.http.post(self.url("/eth/v1/beacon/blocks")).json(block).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("publish returned {status}: {body}")))
        }
        Ok(())
    }

    async fn stream_head_events(&self, sender: mpsc::Sender<HeadEvent>) {
        loop {
            match self.subscribe_head_events_once(&sender).await {
                Ok(false) => {
                    // consumer gone; close out the stream
                    return
                }
                Ok(true) => {
                    warn!(endpoint = %self.endpoint, "head event stream ended, reconnecting")
                }
                Err(err) => {
                    warn!(endpoint = %self.endpoint, %err, "head event stream failed, reconnecting")
                }
            }
            if sender.is_closed() {
                return
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_sent_event_frames() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"event: head\ndata: {\"slot\":\"827256\"}\n\nevent: head\n");
        let boundary = find_event_boundary(&buffer).unwrap();
        let frame: Vec<u8> = buffer.drain(..boundary).collect();
        let data = event_data(&frame).unwrap();
        let event: HeadEvent = serde_json::from_str(&data).unwrap();
        assert_eq!(event.slot, 827256);
        // the partial frame stays buffered
        assert!(find_event_boundary(&buffer).is_none());
    }

    #[test]
    fn ignores_frames_without_data() {
        assert!(event_data(b": keep-alive\n").is_none());
    }
}
