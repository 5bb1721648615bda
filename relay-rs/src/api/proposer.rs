use super::{parse_hash, parse_public_key, parse_slot};
use crate::{
    error::Error,
    relay::Relay,
    types::{
        AuctionRequest, ExecutionPayload, SignedBlindedBeaconBlock, SignedValidatorRegistration,
        VersionedValue,
    },
};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::trace;

pub(crate) async fn handle_status() -> impl IntoResponse {
    StatusCode::OK
}

pub(crate) async fn handle_register_validators(
    State(relay): State<Relay>,
    Json(registrations): Json<Vec<SignedValidatorRegistration>>,
) -> Result<StatusCode, Error> {
    trace!(count = registrations.len(), "processing validator registrations");
    relay.register_validators(registrations).await?;
    Ok(StatusCode::OK)
}

pub(crate) async fn handle_get_header(
    State(relay): State<Relay>,
    Path((slot, parent_hash, public_key)): Path<(String, String, String)>,
) -> Result<Response, Error> {
    let auction = AuctionRequest {
        slot: parse_slot(&slot)?,
        parent_hash: parse_hash(&parent_hash)?,
        public_key: parse_public_key(&public_key)?,
    };
    trace!(%auction, "getHeader request received");
    match relay.fetch_best_bid(&auction).await? {
        Some(bid) => Ok(Json(bid).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub(crate) async fn handle_open_bid(
    State(relay): State<Relay>,
    Json(signed_block): Json<SignedBlindedBeaconBlock>,
) -> Result<Json<VersionedValue<ExecutionPayload>>, Error> {
    trace!("getPayload request received");
    relay.open_bid(signed_block).await.map(Json)
}
