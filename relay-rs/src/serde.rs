pub(crate) use ethereum_consensus::serde::as_str;
