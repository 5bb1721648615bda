use crate::error::Error;
use ethereum_consensus::{
    builder::compute_builder_domain,
    domains::DomainType,
    phase0::mainnet::compute_domain,
    primitives::{Domain, Root, Version},
    serde::try_bytes_from_hex_str,
    state_transition::Context,
    Fork,
};

// Genesis validators roots are not part of the consensus `Context`; they are
// fixed per network and bind the beacon-proposer domain.
const GENESIS_VALIDATORS_ROOT_MAINNET: &str =
    "0x4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95";
const GENESIS_VALIDATORS_ROOT_GOERLI: &str =
    "0x043db0d9a83813551ee2f33450d23797757d430911a9320530ad8a0eabc43efb";
const GENESIS_VALIDATORS_ROOT_SEPOLIA: &str =
    "0xd8ea171f3c94aea21ebc42a1ed61052acf3f9209c00e4efbaaddac09ed9b8078";
const GENESIS_VALIDATORS_ROOT_ZHEJIANG: &str =
    "0x53a92d8f2bb1d85f62d16a156e6ebcd1bcaba652d0900b2c2f387826f3481f6f";

const GENESIS_FORK_VERSION_ZHEJIANG: &str = "0x00000069";
const BELLATRIX_FORK_VERSION_ZHEJIANG: &str = "0x00000071";
const CAPELLA_FORK_VERSION_ZHEJIANG: &str = "0x00000072";

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Goerli,
    Sepolia,
    Zhejiang,
    Custom,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Goerli => write!(f, "goerli"),
            Self::Sepolia => write!(f, "sepolia"),
            Self::Zhejiang => write!(f, "zhejiang"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "goerli" => Ok(Self::Goerli),
            "sepolia" => Ok(Self::Sepolia),
            "zhejiang" => Ok(Self::Zhejiang),
            "custom" => Ok(Self::Custom),
            other => Err(Error::Custom(format!("unknown network `{other}`"))),
        }
    }
}

/// Fork versions that override the ones carried by the consensus `Context`,
/// used for networks the upstream presets do not cover.
#[derive(Debug, Clone)]
struct ForkVersionOverrides {
    genesis: Version,
    bellatrix: Version,
    capella: Version,
    deneb: Option<Version>,
}

/// Everything signature verification needs to know about the network: the
/// consensus context (fork schedule) plus the genesis validators root and
/// the precomputed builder domain.
#[derive(Debug, Clone)]
pub struct NetworkDetails {
    pub network: Network,
    pub context: Context,
    pub genesis_validators_root: Root,
    pub builder_domain: Domain,
    overrides: Option<ForkVersionOverrides>,
}

fn parse_root(input: &str) -> Result<Root, Error> {
    let bytes = try_bytes_from_hex_str(input).map_err(|_| Error::InvalidHash)?;
    Root::try_from(bytes.as_ref()).map_err(|_| Error::InvalidHash)
}

fn parse_version(input: &str) -> Result<Version, Error> {
    let bytes = try_bytes_from_hex_str(input)
        .map_err(|_| Error::Custom(format!("invalid fork version `{input}`")))?;
    Version::try_from(bytes.as_ref())
        .map_err(|_| Error::Custom(format!("invalid fork version `{input}`")))
}

fn version_from_env(name: &str) -> Result<Version, Error> {
    let value = std::env::var(name)
        .map_err(|_| Error::Custom(format!("missing environment variable `{name}`")))?;
    parse_version(&value)
}

impl NetworkDetails {
    pub fn try_from_network(network: Network) -> Result<Self, Error> {
        let (context, genesis_validators_root, overrides) = match network {
            Network::Mainnet => {
                (Context::for_mainnet(), parse_root(GENESIS_VALIDATORS_ROOT_MAINNET)?, None)
            }
            Network::Goerli => {
                (Context::for_goerli(), parse_root(GENESIS_VALIDATORS_ROOT_GOERLI)?, None)
            }
            Network::Sepolia => {
                (Context::for_sepolia(), parse_root(GENESIS_VALIDATORS_ROOT_SEPOLIA)?, None)
            }
            Network::Zhejiang => {
                let overrides = ForkVersionOverrides {
                    genesis: parse_version(GENESIS_FORK_VERSION_ZHEJIANG)?,
                    bellatrix: parse_version(BELLATRIX_FORK_VERSION_ZHEJIANG)?,
                    capella: parse_version(CAPELLA_FORK_VERSION_ZHEJIANG)?,
                    deneb: None,
                };
                // the fork schedule rides on the mainnet preset; domains always
                // use the explicit versions above
                (
                    Context::for_mainnet(),
                    parse_root(GENESIS_VALIDATORS_ROOT_ZHEJIANG)?,
                    Some(overrides),
                )
            }
            Network::Custom => {
                let overrides = ForkVersionOverrides {
                    genesis: version_from_env("GENESIS_FORK_VERSION")?,
                    bellatrix: version_from_env("BELLATRIX_FORK_VERSION")?,
                    capella: version_from_env("CAPELLA_FORK_VERSION")?,
                    deneb: version_from_env("DENEB_FORK_VERSION").ok(),
                };
                let root = std::env::var("GENESIS_VALIDATORS_ROOT").map_err(|_| {
                    Error::Custom("missing environment variable `GENESIS_VALIDATORS_ROOT`".into())
                })?;
                (Context::for_mainnet(), parse_root(&root)?, Some(overrides))
            }
        };

        let builder_domain = match &overrides {
            Some(versions) => compute_domain(
                DomainType::ApplicationBuilder,
                Some(versions.genesis.clone()),
                Some(Root::default()),
                &context,
            )?,
            None => compute_builder_domain(&context)?,
        };

        Ok(Self { network, context, genesis_validators_root, builder_domain, overrides })
    }

    fn fork_version(&self, fork: Fork) -> Version {
        if let Some(overrides) = &self.overrides {
            match fork {
                Fork::Bellatrix => return overrides.bellatrix.clone(),
                Fork::Capella => return overrides.capella.clone(),
                Fork::Deneb => {
                    if let Some(version) = &overrides.deneb {
                        return version.clone()
                    }
                }
                _ => return overrides.genesis.clone(),
            }
        }
        self.context.fork_version_for(fork)
    }

    /// Domain binding a proposer signature to the fork active at `slot`.
    pub fn proposer_domain(&self, slot: u64) -> Result<Domain, Error> {
        let fork = self.context.fork_for(slot);
        let fork_version = self.fork_version(fork);
        compute_domain(
            DomainType::BeaconProposer,
            Some(fork_version),
            Some(self.genesis_validators_root),
            &self.context,
        )
        .map_err(From::from)
    }

    pub fn slots_per_epoch(&self) -> u64 {
        self.context.slots_per_epoch
    }

    pub fn seconds_per_slot(&self) -> u64 {
        self.context.seconds_per_slot
    }
}
