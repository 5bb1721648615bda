use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ethereum_consensus::{
    primitives::{BlsPublicKey, ValidatorIndex},
    Error as ConsensusError,
};
use thiserror::Error;

/// Wire format for failed requests: `{"code": 400, "message": "..."}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("block hash mismatch")]
    BlockHashMismatch,
    #[error("parent hash mismatch")]
    ParentHashMismatch,
    #[error("fee recipient mismatch")]
    FeeRecipientMismatch,
    #[error("submission for past slot")]
    SubmissionForPastSlot,
    #[error("slot is too old")]
    SlotTooOld,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("timestamp too far in the future")]
    TimestampTooFarInFuture,
    #[error("not a known validator: {0}")]
    UnknownValidator(BlsPublicKey),
    #[error("could not match proposer index to pubkey")]
    UnknownProposerIndex(ValidatorIndex),
    #[error("no execution payload for this request")]
    MissingPayload,
    #[error("no registration found for validator {0}")]
    MissingRegistration(BlsPublicKey),
    #[error("builder not found")]
    UnknownBuilder,
    #[error("invalid slot")]
    InvalidSlot,
    #[error("invalid hash")]
    InvalidHash,
    #[error("invalid pubkey")]
    InvalidPublicKey,
    #[error("data for an unexpected fork was provided")]
    InvalidFork,
    #[error("simulation failed: {0}")]
    SimulationFailed(String),
    #[error("request context closed")]
    RequestClosed,
    #[error("could not update top bid after {0} attempts")]
    TopBidContention(usize),
    #[error("relay pubkey does not match existing one: new={new} old={old}")]
    RelayPubkeyMismatch { new: String, old: String },
    #[error("{0}")]
    Custom(String),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Cache(#[from] crate::cache::Error),
    #[error(transparent)]
    Audit(#[from] crate::audit::Error),
    #[error(transparent)]
    Beacon(#[from] crate::beacon::Error),
}

impl Error {
    /// Status code per the API contract. Missing data is a client error
    /// (400), not a 404; infrastructure failures surface as 500.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BlockHashMismatch |
            Self::ParentHashMismatch |
            Self::FeeRecipientMismatch |
            Self::SubmissionForPastSlot |
            Self::SlotTooOld |
            Self::InvalidSignature |
            Self::TimestampTooFarInFuture |
            Self::UnknownValidator(..) |
            Self::UnknownProposerIndex(..) |
            Self::MissingPayload |
            Self::MissingRegistration(..) |
            Self::UnknownBuilder |
            Self::InvalidSlot |
            Self::InvalidHash |
            Self::InvalidPublicKey |
            Self::InvalidFork |
            Self::SimulationFailed(..) |
            Self::Custom(..) |
            Self::Consensus(..) => StatusCode::BAD_REQUEST,
            Self::RequestClosed |
            Self::TopBidContention(..) |
            Self::RelayPubkeyMismatch { .. } |
            Self::Cache(..) |
            Self::Audit(..) |
            Self::Beacon(..) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let body = ErrorResponse { code: code.as_u16(), message: self.to_string() };
        (code, Json(body)).into_response()
    }
}
