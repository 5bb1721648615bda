use crate::{error::Error, network::NetworkDetails};
use ethereum_consensus::{
    primitives::{BlsPublicKey, BlsSignature, Slot},
    signing::{sign_with_domain, verify_signed_data},
    ssz::prelude::HashTreeRoot,
};
pub use ethereum_consensus::crypto::SecretKey;

/// Signs `message` under the application-builder domain with the relay key.
pub fn sign_builder_message<T: HashTreeRoot>(
    message: &T,
    signing_key: &SecretKey,
    details: &NetworkDetails,
) -> Result<BlsSignature, Error> {
    sign_with_domain(message, signing_key, details.builder_domain.clone()).map_err(From::from)
}

pub fn verify_signed_builder_message<T: HashTreeRoot>(
    message: &T,
    signature: &BlsSignature,
    public_key: &BlsPublicKey,
    details: &NetworkDetails,
) -> Result<(), Error> {
    verify_signed_data(message, signature, public_key, details.builder_domain.clone())
        .map_err(From::from)
}

/// Verifies a proposer-signed consensus message under the beacon-proposer
/// domain for the fork active at `slot`.
pub fn verify_signed_consensus_message<T: HashTreeRoot>(
    message: &T,
    signature: &BlsSignature,
    public_key: &BlsPublicKey,
    details: &NetworkDetails,
    slot: Slot,
) -> Result<(), Error> {
    let domain = details.proposer_domain(slot)?;
    verify_signed_data(message, signature, public_key, domain).map_err(From::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use ethereum_consensus::builder::ValidatorRegistration;

    #[test]
    fn builder_message_round_trip() {
        let details = NetworkDetails::try_from_network(Network::Sepolia).unwrap();
        let mut rng = rand::thread_rng();
        let signing_key = SecretKey::random(&mut rng).unwrap();
        let public_key = signing_key.public_key();

        let message = ValidatorRegistration {
            fee_recipient: Default::default(),
            gas_limit: 30_000_000,
            timestamp: 1_000_000,
            public_key: public_key.clone(),
        };
        let signature = sign_builder_message(&message, &signing_key, &details).unwrap();
        assert!(verify_signed_builder_message(&message, &signature, &public_key, &details).is_ok());

        // the same bytes must not verify under the proposer domain
        assert!(
            verify_signed_consensus_message(&message, &signature, &public_key, &details, 0).is_err()
        );
    }
}
