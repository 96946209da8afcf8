//! Engine configuration, loaded once at start-up and shared immutably.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::capabilities::{Capabilities, Capability};
use crate::error::ConfigError;
use crate::filter::Filter;
use crate::protocol::dispute::{RefundAgent, RefundAgentRegistry};
use crate::types::{NodeAddress, PubKeyRing};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    pub banned_protocol_versions: Vec<u32>,
    pub banned_nodes: Vec<String>,
    /// Hex encoded payment account hashes.
    pub banned_payment_accounts: Vec<String>,
    pub availability_timeout_secs: u64,
    /// Creating a fee or deposit tx is refused above this many pending own txs.
    pub max_unconfirmed_own_txs: usize,
    pub mailbox_ttl_days: u64,
    pub persistence_backups: usize,
    pub use_v5_protocol: bool,
    pub capabilities: Vec<String>,
    pub refund_agents: Vec<RefundAgentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundAgentConfig {
    pub node: String,
    pub signature_pub_key: String,
    pub encryption_pub_key: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./trade-data"),
            protocol_version: 4,
            min_protocol_version: 4,
            banned_protocol_versions: Vec::new(),
            banned_nodes: Vec::new(),
            banned_payment_accounts: Vec::new(),
            availability_timeout_secs: 90,
            max_unconfirmed_own_txs: 10,
            mailbox_ttl_days: 15,
            persistence_backups: 10,
            use_v5_protocol: true,
            capabilities: vec![
                "trade_statistics".into(),
                "refund_agent".into(),
                "bsq_swap_offer".into(),
                "protocol_v5".into(),
                "mailbox_messages".into(),
            ],
            refund_agents: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_protocol_version > self.protocol_version {
            return Err(ConfigError::Invalid {
                key: "min_protocol_version",
                reason: format!(
                    "{} is newer than protocol_version {}",
                    self.min_protocol_version, self.protocol_version
                ),
            });
        }
        if self.availability_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "availability_timeout_secs",
                reason: "must be positive".into(),
            });
        }
        self.advertised_capabilities()?;
        self.refund_agents()?;
        Ok(())
    }

    pub fn availability_timeout(&self) -> Duration {
        Duration::from_secs(self.availability_timeout_secs)
    }

    pub fn mailbox_ttl(&self) -> Duration {
        DAY * self.mailbox_ttl_days as u32
    }

    pub fn advertised_capabilities(&self) -> Result<Capabilities, ConfigError> {
        parse_capabilities("capabilities", &self.capabilities)
    }

    pub fn filter(&self) -> Filter {
        Filter::from_config(self)
    }

    pub fn refund_agents(&self) -> Result<RefundAgentRegistry, ConfigError> {
        let agents = self
            .refund_agents
            .iter()
            .map(|agent| {
                let decode = |key: &'static str, value: &str| {
                    hex::decode(value).map_err(|e| ConfigError::Invalid {
                        key,
                        reason: e.to_string(),
                    })
                };
                Ok(RefundAgent {
                    node: NodeAddress::new(agent.node.clone()),
                    pub_key_ring: PubKeyRing::new(
                        decode("refund_agents.signature_pub_key", &agent.signature_pub_key)?,
                        decode("refund_agents.encryption_pub_key", &agent.encryption_pub_key)?,
                    ),
                    capabilities: parse_capabilities("refund_agents.capabilities", &agent.capabilities)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(RefundAgentRegistry::new(agents))
    }
}

fn parse_capabilities(key: &'static str, names: &[String]) -> Result<Capabilities, ConfigError> {
    names
        .iter()
        .map(|name| {
            name.parse::<Capability>()
                .map_err(|reason| ConfigError::Invalid { key, reason })
        })
        .collect()
}
