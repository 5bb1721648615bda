use super::parse_public_key;
use crate::{audit::BuilderEntry, error::Error, relay::Relay, types::BuilderStatus};
use axum::extract::{Json, Path, Query, State};

pub(crate) async fn handle_get_builder(
    State(relay): State<Relay>,
    Path(pubkey): Path<String>,
) -> Result<Json<BuilderEntry>, Error> {
    let public_key = parse_public_key(&pubkey)?;
    relay.builder_entry(&public_key).await.map(Json)
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct BuilderStatusQuery {
    high_prio: Option<String>,
    blacklisted: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct BuilderStatusUpdated {
    #[serde(rename = "newStatus")]
    new_status: BuilderStatus,
}

pub(crate) async fn handle_update_builder(
    State(relay): State<Relay>,
    Path(pubkey): Path<String>,
    Query(query): Query<BuilderStatusQuery>,
) -> Result<Json<BuilderStatusUpdated>, Error> {
    let public_key = parse_public_key(&pubkey)?;
    let status = BuilderStatus::from_flags(
        query.high_prio.as_deref() == Some("true"),
        query.blacklisted.as_deref() == Some("true"),
    );
    relay.set_builder_status(&public_key, status).await?;
    Ok(Json(BuilderStatusUpdated { new_status: status }))
}
