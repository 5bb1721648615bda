mod builder;
mod data;
mod internal;
mod proposer;
mod server;
mod timeout;

pub use server::{RelayServer, Server};

use crate::error::Error;
use ethereum_consensus::{
    primitives::{BlsPublicKey, Hash32, Slot},
    serde::try_bytes_from_hex_str,
};

/// `[0-9]+`
pub(crate) fn parse_slot(input: &str) -> Result<Slot, Error> {
    if input.is_empty() || !input.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(Error::InvalidSlot)
    }
    input.parse().map_err(|_| Error::InvalidSlot)
}

/// `0x` + 64 hex characters, case-insensitive.
pub(crate) fn parse_hash(input: &str) -> Result<Hash32, Error> {
    if input.len() != 66 {
        return Err(Error::InvalidHash)
    }
    let bytes = try_bytes_from_hex_str(input).map_err(|_| Error::InvalidHash)?;
    Hash32::try_from(bytes.as_ref()).map_err(|_| Error::InvalidHash)
}

/// `0x` + 96 hex characters, case-insensitive.
pub fn parse_public_key(input: &str) -> Result<BlsPublicKey, Error> {
    if input.len() != 98 {
        return Err(Error::InvalidPublicKey)
    }
    let bytes = try_bytes_from_hex_str(input).map_err(|_| Error::InvalidPublicKey)?;
    BlsPublicKey::try_from(bytes.as_ref()).map_err(|_| Error::InvalidPublicKey)
}
