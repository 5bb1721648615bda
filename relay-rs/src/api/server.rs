use super::{builder, data, internal, proposer, timeout::ReadTimeoutLayer};
use crate::relay::Relay;
use axum::{
    routing::{get, post, IntoMakeService},
    Router,
};
use hyper::server::conn::AddrIncoming;
use std::{net::SocketAddr, time::Duration};
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

/// Type alias for the configured axum server
pub type RelayServer = axum::Server<AddrIncoming, IntoMakeService<Router>>;

// The four server deadlines: headers on the connection builder, the request
// body in middleware, and a whole-request ceiling standing in for the write
// timeout (responses are buffered before hyper writes them). Connection
// keep-alive idle time is the one knob hyper's http1 builder does not
// expose; see DESIGN.md.
const READ_TIMEOUT: Duration = Duration::from_millis(600);
const READ_HEADER_TIMEOUT: Duration = Duration::from_millis(400);
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

async fn handle_root() -> &'static str {
    "block auction relay"
}

pub struct Server {
    listen_addr: SocketAddr,
    relay: Relay,
}

impl Server {
    pub fn new(listen_addr: SocketAddr, relay: Relay) -> Self {
        Self { listen_addr, relay }
    }

    pub fn router(relay: Relay) -> Router {
        Router::new()
            .route("/", get(handle_root))
            // proposer API
            .route("/eth/v1/builder/status", get(proposer::handle_status))
            .route("/eth/v1/builder/validators", post(proposer::handle_register_validators))
            .route(
                "/eth/v1/builder/header/:slot/:parent_hash/:pubkey",
                get(proposer::handle_get_header),
            )
            .route("/eth/v1/builder/blinded_blocks", post(proposer::handle_open_bid))
            // block builder API
            .route("/relay/v1/builder/validators", get(builder::handle_get_validators))
            .route("/relay/v1/builder/blocks", post(builder::handle_submit_block))
            // data API
            .route(
                "/relay/v1/data/bidtraces/proposer_payload_delivered",
                get(data::handle_payloads_delivered),
            )
            .route(
                "/relay/v1/data/bidtraces/builder_blocks_received",
                get(data::handle_blocks_received),
            )
            .route(
                "/relay/v1/data/validator_registration",
                get(data::handle_validator_registration),
            )
            // internal API
            .route(
                "/internal/v1/builder/:pubkey",
                get(internal::handle_get_builder)
                    .post(internal::handle_update_builder)
                    .put(internal::handle_update_builder)
                    .patch(internal::handle_update_builder),
            )
            .layer(TimeoutLayer::new(WRITE_TIMEOUT))
            .layer(ReadTimeoutLayer::new(READ_TIMEOUT))
            .with_state(relay)
    }

    /// Configures and returns the axum server
    pub fn serve(&self) -> RelayServer {
        let router = Self::router(self.relay.clone());
        axum::Server::bind(&self.listen_addr)
            .http1_header_read_timeout(READ_HEADER_TIMEOUT)
            .serve(router.into_make_service())
    }

    /// Spawns the server on a new task returning the handle for it
    pub fn spawn(&self) -> JoinHandle<()> {
        let server = self.serve();
        let addr = server.local_addr();
        tokio::spawn(async move {
            info!("listening at {addr}...");
            if let Err(err) = server.await {
                error!(%err, "error while listening for incoming")
            }
        })
    }
}
