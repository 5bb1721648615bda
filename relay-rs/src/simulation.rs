//! Admission-controlled access to the external block simulator. The gate is
//! a counting semaphore: at most `max_concurrent` submissions are in flight,
//! the rest wait their turn or get cancelled along with their request.

use crate::{error::Error, types::SignedBidSubmission};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use url::Url;

pub const DEFAULT_MAX_CONCURRENT_SIMULATIONS: usize = 4;

#[async_trait]
pub trait BlockSimulator: Send + Sync {
    async fn simulate(&self, submission: &SignedBidSubmission) -> Result<(), Error>;
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'static str,
    params: (&'a SignedBidSubmission,),
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcError {
    message: String,
}

/// Speaks `flashbots_validateBuilderSubmissionV1` to the simulator endpoint.
pub struct HttpBlockSimulator {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpBlockSimulator {
    pub fn new(endpoint: Url) -> Self {
        Self { http: reqwest::Client::new(), endpoint }
    }
}

#[async_trait]
impl BlockSimulator for HttpBlockSimulator {
    async fn simulate(&self, submission: &SignedBidSubmission) -> Result<(), Error> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "1",
            method: "flashbots_validateBuilderSubmissionV1",
            params: (submission,),
        };
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|err| Error::SimulationFailed(err.to_string()))?;
        let response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|err| Error::SimulationFailed(err.to_string()))?;
        match response.error {
            Some(error) => Err(Error::SimulationFailed(error.message)),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct SimulationGate {
    simulator: Arc<dyn BlockSimulator>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl SimulationGate {
    pub fn new(simulator: Arc<dyn BlockSimulator>, max_concurrent: usize) -> Self {
        Self { simulator, permits: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    /// Number of submissions currently admitted.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Waits for admission, then runs the simulation. Dropping the returned
    /// future while waiting gives the slot up cleanly; a closed gate
    /// surfaces as `request_closed`.
    pub async fn simulate(&self, submission: &SignedBidSubmission) -> Result<(), Error> {
        let _permit = self.permits.acquire().await.map_err(|_| Error::RequestClosed)?;
        self.simulator.simulate(submission).await
    }

    /// Shuts the gate; all waiters fail with `request_closed`.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct SlowSimulator {
        running: AtomicUsize,
        peak: AtomicUsize,
        fail_with: Option<String>,
    }

    impl SlowSimulator {
        fn new(fail_with: Option<String>) -> Self {
            Self { running: AtomicUsize::new(0), peak: AtomicUsize::new(0), fail_with }
        }
    }

    #[async_trait]
    impl BlockSimulator for SlowSimulator {
        async fn simulate(&self, _submission: &SignedBidSubmission) -> Result<(), Error> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(message) => Err(Error::SimulationFailed(message.clone())),
                None => Ok(()),
            }
        }
    }

    fn submission() -> SignedBidSubmission {
        SignedBidSubmission {
            message: Default::default(),
            execution_payload: crate::types::ExecutionPayload::Capella(Default::default()),
            signature: Default::default(),
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let simulator = Arc::new(SlowSimulator::new(None));
        let gate = SimulationGate::new(simulator.clone(), 2);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move { gate.simulate(&submission()).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(simulator.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn simulator_errors_pass_through() {
        let simulator = Arc::new(SlowSimulator::new(Some("block exceeds gas limit".to_string())));
        let gate = SimulationGate::new(simulator, 1);
        let err = gate.simulate(&submission()).await.unwrap_err();
        assert!(matches!(err, Error::SimulationFailed(message) if message.contains("gas limit")));
    }

    #[tokio::test]
    async fn closed_gate_rejects_waiters() {
        let simulator = Arc::new(SlowSimulator::new(None));
        let gate = SimulationGate::new(simulator, 1);
        gate.close();
        let err = gate.simulate(&submission()).await.unwrap_err();
        assert!(matches!(err, Error::RequestClosed));
    }

    #[tokio::test]
    async fn cancelled_waiters_release_their_place() {
        let simulator = Arc::new(SlowSimulator::new(None));
        let gate = SimulationGate::new(simulator, 1);

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.simulate(&submission()).await })
        };
        tokio::task::yield_now().await;

        // a waiter that gets cancelled before admission
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.simulate(&submission()).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        // the gate still serves new requests afterwards
        holder.await.unwrap().unwrap();
        gate.simulate(&submission()).await.unwrap();
    }
}
