use crate::{
    api,
    audit::{AuditStore, InMemoryAuditStore},
    beacon::{BeaconClient, MultiBeaconClient},
    cache::{Cache, InMemoryCache},
    config::Config,
    datastore::Datastore,
    error::Error,
    network::NetworkDetails,
    relay::{Relay, RelayOptions},
    signing::SecretKey,
    simulation::{HttpBlockSimulator, SimulationGate},
};
use ethereum_consensus::serde::try_bytes_from_hex_str;
use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tracing::info;
use url::Url;

const HEAD_EVENT_CHANNEL_SIZE: usize = 16;
const GC_INTERVAL: Duration = Duration::from_secs(2 * 60);

fn parse_secret_key(hex: &str) -> Result<SecretKey, Error> {
    if hex.is_empty() {
        return Err(Error::Custom("missing BLS secret key in configuration".to_string()))
    }
    let bytes = try_bytes_from_hex_str(hex)
        .map_err(|_| Error::Custom("malformed BLS secret key".to_string()))?;
    SecretKey::try_from(bytes.as_ref())
        .map_err(|_| Error::Custom("invalid BLS secret key".to_string()))
}

pub struct Service {
    config: Config,
}

impl Service {
    pub fn from(config: Config) -> Self {
        Self { config }
    }

    /// Builds every component, runs the startup checks, and spawns the HTTP
    /// server plus the background tasks: head-event consumer, known-validator
    /// refresher, and the bid/escrow garbage collector.
    pub async fn spawn(self) -> Result<ServiceHandle, Error> {
        let config = self.config;
        info!(network = %config.network, "configuring relay");
        let details = NetworkDetails::try_from_network(config.network)?;
        let secret_key = parse_secret_key(&config.secret_key)?;

        let endpoints: Vec<Url> = config
            .beacon_endpoints
            .iter()
            .filter_map(|endpoint| match endpoint.parse() {
                Ok(url) => Some(url),
                Err(err) => {
                    tracing::warn!(endpoint, %err, "skipping unparseable beacon endpoint");
                    None
                }
            })
            .collect();
        if endpoints.is_empty() {
            return Err(Error::Custom("no valid beacon endpoints provided".to_string()))
        }
        let beacon: Arc<dyn BeaconClient> =
            Arc::new(MultiBeaconClient::from_endpoints(&endpoints));

        let network_name = config.network.to_string();
        let cache = Cache::new(Arc::new(InMemoryCache::default()), &network_name);
        let audit: Arc<dyn AuditStore> = Arc::new(InMemoryAuditStore::new());
        let datastore = Datastore::new(cache, beacon.clone());

        let block_sim_url: Url = config
            .block_sim_url
            .parse()
            .map_err(|_| Error::Custom("invalid block simulator URL".to_string()))?;
        let simulator = Arc::new(HttpBlockSimulator::new(block_sim_url));
        let gate = SimulationGate::new(simulator, config.blocksim_max_concurrent);

        let relay = Relay::new(RelayOptions {
            secret_key,
            details,
            datastore,
            beacon: beacon.clone(),
            audit,
            gate,
            flags: (&config).into(),
            gc_horizon_slots: config.gc_horizon_slots,
        });
        relay.initialize().await?;

        let server = api::Server::new(config.listen_addr, relay.clone()).spawn();

        let (head_tx, mut head_rx) = mpsc::channel(HEAD_EVENT_CHANNEL_SIZE);
        {
            let beacon = beacon.clone();
            tokio::spawn(async move { beacon.stream_head_events(head_tx).await });
        }
        let head = {
            let relay = relay.clone();
            tokio::spawn(async move {
                while let Some(event) = head_rx.recv().await {
                    relay.process_new_slot(event.slot);
                }
            })
        };

        {
            let relay = relay.clone();
            tokio::spawn(async move {
                let details = relay.network_details();
                let interval = Duration::from_secs(
                    details.slots_per_epoch() * details.seconds_per_slot() / 2,
                );
                loop {
                    tokio::time::sleep(interval).await;
                    relay.refresh_known_validators().await;
                }
            });
        }

        {
            let relay = relay.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(GC_INTERVAL).await;
                    relay.run_gc_once().await;
                }
            });
        }

        Ok(ServiceHandle { server, head })
    }
}

/// Contains the handles to the spawned server and head-event tasks.
///
/// This struct is created by the [`Service::spawn`] function
#[pin_project::pin_project]
pub struct ServiceHandle {
    #[pin]
    server: JoinHandle<()>,
    #[pin]
    head: JoinHandle<()>,
}

impl Future for ServiceHandle {
    type Output = Result<(), JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let server = this.server.poll(cx);
        if server.is_ready() {
            return server
        }
        this.head.poll(cx)
    }
}
