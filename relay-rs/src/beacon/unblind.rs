use crate::{
    error::Error,
    types::{ExecutionPayload, SignedBeaconBlock, SignedBlindedBeaconBlock},
};
use ethereum_consensus::{bellatrix, capella, deneb};

/// Reconstructs the publishable block from the proposer-signed blinded block
/// and the escrowed payload. The two must be from the same fork; the header
/// inside the blinded body is replaced by the full payload.
pub fn unblind_signed_block(
    signed_block: &SignedBlindedBeaconBlock,
    execution_payload: &ExecutionPayload,
) -> Result<SignedBeaconBlock, Error> {
    match (signed_block, execution_payload) {
        (SignedBlindedBeaconBlock::Bellatrix(block), ExecutionPayload::Bellatrix(payload)) => {
            Ok(SignedBeaconBlock::Bellatrix(unblind_bellatrix(block, payload)))
        }
        (SignedBlindedBeaconBlock::Capella(block), ExecutionPayload::Capella(payload)) => {
            Ok(SignedBeaconBlock::Capella(unblind_capella(block, payload)))
        }
        (SignedBlindedBeaconBlock::Deneb(block), ExecutionPayload::Deneb(payload)) => {
            Ok(SignedBeaconBlock::Deneb(unblind_deneb(block, payload)))
        }
        _ => Err(Error::InvalidFork),
    }
}

fn unblind_bellatrix(
    signed_block: &bellatrix::mainnet::SignedBlindedBeaconBlock,
    payload: &bellatrix::mainnet::ExecutionPayload,
) -> bellatrix::mainnet::SignedBeaconBlock {
    let message = &signed_block.message;
    let body = &message.body;
    bellatrix::mainnet::SignedBeaconBlock {
        message: bellatrix::mainnet::BeaconBlock {
            slot: message.slot,
            proposer_index: message.proposer_index,
            parent_root: message.parent_root,
            state_root: message.state_root,
            body: bellatrix::mainnet::BeaconBlockBody {
                randao_reveal: body.randao_reveal.clone(),
                eth1_data: body.eth1_data.clone(),
                graffiti: body.graffiti.clone(),
                proposer_slashings: body.proposer_slashings.clone(),
                attester_slashings: body.attester_slashings.clone(),
                attestations: body.attestations.clone(),
                deposits: body.deposits.clone(),
                voluntary_exits: body.voluntary_exits.clone(),
                sync_aggregate: body.sync_aggregate.clone(),
                execution_payload: payload.clone(),
            },
        },
        signature: signed_block.signature.clone(),
    }
}

fn unblind_capella(
    signed_block: &capella::mainnet::SignedBlindedBeaconBlock,
    payload: &capella::mainnet::ExecutionPayload,
) -> capella::mainnet::SignedBeaconBlock {
    let message = &signed_block.message;
    let body = &message.body;
    capella::mainnet::SignedBeaconBlock {
        message: capella::mainnet::BeaconBlock {
            slot: message.slot,
            proposer_index: message.proposer_index,
            parent_root: message.parent_root,
            state_root: message.state_root,
            body: capella::mainnet::BeaconBlockBody {
                randao_reveal: body.randao_reveal.clone(),
                eth1_data: body.eth1_data.clone(),
                graffiti: body.graffiti.clone(),
                proposer_slashings: body.proposer_slashings.clone(),
                attester_slashings: body.attester_slashings.clone(),
                attestations: body.attestations.clone(),
                deposits: body.deposits.clone(),
                voluntary_exits: body.voluntary_exits.clone(),
                sync_aggregate: body.sync_aggregate.clone(),
                execution_payload: payload.clone(),
                bls_to_execution_changes: body.bls_to_execution_changes.clone(),
            },
        },
        signature: signed_block.signature.clone(),
    }
}

fn unblind_deneb(
    signed_block: &deneb::mainnet::SignedBlindedBeaconBlock,
    payload: &deneb::mainnet::ExecutionPayload,
) -> deneb::mainnet::SignedBeaconBlock {
    let message = &signed_block.message;
    let body = &message.body;
    deneb::mainnet::SignedBeaconBlock {
        message: deneb::mainnet::BeaconBlock {
            slot: message.slot,
            proposer_index: message.proposer_index,
            parent_root: message.parent_root,
            state_root: message.state_root,
            body: deneb::mainnet::BeaconBlockBody {
                randao_reveal: body.randao_reveal.clone(),
                eth1_data: body.eth1_data.clone(),
                graffiti: body.graffiti.clone(),
                proposer_slashings: body.proposer_slashings.clone(),
                attester_slashings: body.attester_slashings.clone(),
                attestations: body.attestations.clone(),
                deposits: body.deposits.clone(),
                voluntary_exits: body.voluntary_exits.clone(),
                sync_aggregate: body.sync_aggregate.clone(),
                execution_payload: payload.clone(),
                bls_to_execution_changes: body.bls_to_execution_changes.clone(),
                blob_kzg_commitments: body.blob_kzg_commitments.clone(),
            },
        },
        signature: signed_block.signature.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unblinds_matching_forks_and_rejects_mismatches() {
        let blinded = SignedBlindedBeaconBlock::Bellatrix(Default::default());
        let payload = ExecutionPayload::Bellatrix(Default::default());
        let block = unblind_signed_block(&blinded, &payload).unwrap();
        assert!(matches!(block, SignedBeaconBlock::Bellatrix(..)));

        let wrong_fork = ExecutionPayload::Capella(Default::default());
        assert!(unblind_signed_block(&blinded, &wrong_fork).is_err());
    }

    #[test]
    fn payload_lands_in_the_body() {
        let blinded = SignedBlindedBeaconBlock::Capella(Default::default());
        let mut payload = capella::mainnet::ExecutionPayload::default();
        payload.gas_limit = 30_000_000;
        let block =
            unblind_signed_block(&blinded, &ExecutionPayload::Capella(payload)).unwrap();
        match block {
            SignedBeaconBlock::Capella(block) => {
                assert_eq!(block.message.body.execution_payload.gas_limit, 30_000_000)
            }
            _ => unreachable!(),
        }
    }
}
