use crate::{
    error::Error,
    relay::Relay,
    types::{ProposerSchedule, SignedBidSubmission},
};
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
};
use tracing::trace;

#[derive(Debug, serde::Deserialize)]
pub(crate) struct SubmitBlockQuery {
    cancellations: Option<String>,
}

pub(crate) async fn handle_get_validators(
    State(relay): State<Relay>,
) -> Json<Vec<ProposerSchedule>> {
    trace!("serving proposer duties for current and next epoch");
    Json(relay.proposer_schedule())
}

pub(crate) async fn handle_submit_block(
    State(relay): State<Relay>,
    Query(query): Query<SubmitBlockQuery>,
    Json(submission): Json<SignedBidSubmission>,
) -> Result<StatusCode, Error> {
    let cancellations_enabled =
        matches!(query.cancellations.as_deref(), Some("1") | Some("true"));
    trace!(%submission, cancellations_enabled, "handling block submission");
    relay.submit_block(submission, cancellations_enabled).await?;
    Ok(StatusCode::OK)
}
