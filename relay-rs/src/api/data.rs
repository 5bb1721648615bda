use super::{parse_hash, parse_public_key};
use crate::{
    audit::{TraceFilters, ValueOrdering, MAX_QUERY_LIMIT},
    error::Error,
    relay::Relay,
    types::{BidTrace, SignedValidatorRegistration},
};
use axum::extract::{Json, Query, State};

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct TraceQuery {
    slot: Option<String>,
    cursor: Option<String>,
    block_hash: Option<String>,
    block_number: Option<String>,
    proposer_pubkey: Option<String>,
    builder_pubkey: Option<String>,
    limit: Option<String>,
    order_by: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct DeliveredTrace {
    #[serde(flatten)]
    trace: BidTrace,
    #[serde(with = "crate::serde::as_str")]
    block_number: u64,
    #[serde(with = "crate::serde::as_str")]
    num_tx: usize,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct SubmissionTrace {
    #[serde(flatten)]
    trace: BidTrace,
    #[serde(with = "crate::serde::as_str")]
    block_number: u64,
    #[serde(with = "crate::serde::as_str")]
    num_tx: usize,
    #[serde(with = "crate::serde::as_str")]
    timestamp_ms: u64,
    optimistic_submission: bool,
}

fn bad_argument(name: &str) -> Error {
    Error::Custom(format!("invalid {name} argument"))
}

impl TraceQuery {
    fn into_filters(self, allow_cursor: bool) -> Result<TraceFilters, Error> {
        let mut filters = TraceFilters::with_limit(MAX_QUERY_LIMIT);

        if !allow_cursor && self.cursor.is_some() {
            return Err(Error::Custom("cursor argument not supported on this API".to_string()))
        }
        if self.slot.is_some() && self.cursor.is_some() {
            return Err(Error::Custom("cannot specify both slot and cursor".to_string()))
        }
        if let Some(slot) = &self.slot {
            filters.slot = Some(slot.parse().map_err(|_| bad_argument("slot"))?);
        } else if let Some(cursor) = &self.cursor {
            filters.cursor = Some(cursor.parse().map_err(|_| bad_argument("cursor"))?);
        }

        if let Some(block_hash) = &self.block_hash {
            filters.block_hash =
                Some(parse_hash(block_hash).map_err(|_| bad_argument("block_hash"))?);
        }
        if let Some(block_number) = &self.block_number {
            filters.block_number =
                Some(block_number.parse().map_err(|_| bad_argument("block_number"))?);
        }
        if let Some(proposer_pubkey) = &self.proposer_pubkey {
            filters.proposer_public_key = Some(
                parse_public_key(proposer_pubkey).map_err(|_| bad_argument("proposer_pubkey"))?,
            );
        }
        if let Some(builder_pubkey) = &self.builder_pubkey {
            filters.builder_public_key = Some(
                parse_public_key(builder_pubkey).map_err(|_| bad_argument("builder_pubkey"))?,
            );
        }

        if let Some(limit) = &self.limit {
            let limit: u64 = limit.parse().map_err(|_| bad_argument("limit"))?;
            if limit > MAX_QUERY_LIMIT {
                return Err(Error::Custom(format!("maximum limit is {MAX_QUERY_LIMIT}")))
            }
            filters.limit = limit;
        }

        filters.order_by_value = match self.order_by.as_deref() {
            Some("value") => Some(ValueOrdering::Ascending),
            Some("-value") => Some(ValueOrdering::Descending),
            _ => None,
        };
        Ok(filters)
    }
}

pub(crate) async fn handle_payloads_delivered(
    State(relay): State<Relay>,
    Query(query): Query<TraceQuery>,
) -> Result<Json<Vec<DeliveredTrace>>, Error> {
    let filters = query.into_filters(true)?;
    let rows = relay.delivered_payloads(&filters).await?;
    let response = rows
        .into_iter()
        .map(|entry| DeliveredTrace {
            trace: entry.trace,
            block_number: entry.block_number,
            num_tx: entry.num_tx,
        })
        .collect();
    Ok(Json(response))
}

pub(crate) async fn handle_blocks_received(
    State(relay): State<Relay>,
    Query(query): Query<TraceQuery>,
) -> Result<Json<Vec<SubmissionTrace>>, Error> {
    let filters = query.into_filters(false)?;
    let rows = relay.builder_submissions(&filters).await?;
    let response = rows
        .into_iter()
        .map(|entry| SubmissionTrace {
            trace: entry.trace,
            block_number: entry.block_number,
            num_tx: entry.num_tx,
            timestamp_ms: entry.timestamp_ms,
            optimistic_submission: entry.optimistic_submission,
        })
        .collect();
    Ok(Json(response))
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct RegistrationQuery {
    pubkey: Option<String>,
}

pub(crate) async fn handle_validator_registration(
    State(relay): State<Relay>,
    Query(query): Query<RegistrationQuery>,
) -> Result<Json<SignedValidatorRegistration>, Error> {
    let Some(pubkey) = query.pubkey else {
        return Err(Error::Custom("missing pubkey argument".to_string()))
    };
    let public_key = parse_public_key(&pubkey)?;
    relay.registration(&public_key).await.map(Json)
}
