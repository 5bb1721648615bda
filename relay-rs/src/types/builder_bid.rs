use crate::{
    error::Error,
    network::NetworkDetails,
    signing::{verify_signed_builder_message, SecretKey},
    types::{ExecutionPayload, ExecutionPayloadHeader},
};
use ethereum_consensus::{
    primitives::{BlsPublicKey, BlsSignature},
    ssz::prelude::*,
    Fork,
};
use std::fmt;

#[derive(Debug, Clone, Serializable, HashTreeRoot)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct BuilderBid {
    pub header: ExecutionPayloadHeader,
    #[serde(with = "crate::serde::as_str")]
    pub value: U256,
    #[serde(rename = "pubkey")]
    pub public_key: BlsPublicKey,
}

impl BuilderBid {
    pub fn sign(
        self,
        secret_key: &SecretKey,
        details: &NetworkDetails,
    ) -> Result<SignedBuilderBid, Error> {
        let signature = crate::signing::sign_builder_message(&self, secret_key, details)?;
        Ok(SignedBuilderBid { message: self, signature })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignedBuilderBid {
    pub message: BuilderBid,
    pub signature: BlsSignature,
}

impl SignedBuilderBid {
    pub fn version(&self) -> Fork {
        self.message.header.version()
    }

    pub fn verify_signature(&self, details: &NetworkDetails) -> Result<(), Error> {
        let public_key = &self.message.public_key;
        verify_signed_builder_message(&self.message, &self.signature, public_key, details)
    }
}

impl fmt::Display for SignedBuilderBid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let block_hash = self.message.header.block_hash();
        let value = &self.message.value;
        write!(f, "block hash {block_hash} and value {value}")
    }
}

/// Summarizes a payload into the header form served to proposers.
pub fn to_header(execution_payload: &ExecutionPayload) -> Result<ExecutionPayloadHeader, Error> {
    let header = match execution_payload {
        ExecutionPayload::Bellatrix(payload) => {
            ExecutionPayloadHeader::Bellatrix(payload.try_into()?)
        }
        ExecutionPayload::Capella(payload) => ExecutionPayloadHeader::Capella(payload.try_into()?),
        ExecutionPayload::Deneb(payload) => ExecutionPayloadHeader::Deneb(payload.try_into()?),
        _ => return Err(Error::InvalidFork),
    };
    Ok(header)
}
