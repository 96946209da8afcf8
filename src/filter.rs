//! Filter and protocol version enforcement.
//!
//! Applied to every incoming envelope before a task runs, and again by the
//! `ApplyFilter` tasks once the peer's payment account is known.
use std::collections::BTreeSet;

use crate::config::EngineConfig;
use crate::error::ValidationError;
use crate::types::NodeAddress;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    own_version: u32,
    min_version: u32,
    banned_versions: BTreeSet<u32>,
    banned_nodes: BTreeSet<String>,
    banned_payment_accounts: BTreeSet<String>,
}

impl Filter {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            own_version: config.protocol_version,
            min_version: config.min_protocol_version,
            banned_versions: config.banned_protocol_versions.iter().copied().collect(),
            banned_nodes: config.banned_nodes.iter().cloned().collect(),
            banned_payment_accounts: config
                .banned_payment_accounts
                .iter()
                .map(|h| h.to_lowercase())
                .collect(),
        }
    }

    pub fn check_version(&self, version: u32) -> Result<(), ValidationError> {
        if self.banned_versions.contains(&version) {
            return Err(ValidationError::BannedProtocolVersion(version));
        }
        if version < self.min_version || version > self.own_version {
            return Err(ValidationError::UnsupportedProtocolVersion(version));
        }
        Ok(())
    }

    pub fn check_node(&self, node: &NodeAddress) -> Result<(), ValidationError> {
        if self.banned_nodes.contains(node.as_str()) {
            return Err(ValidationError::BannedNode(node.to_string()));
        }
        Ok(())
    }

    pub fn check_payment_account(&self, account_hash: &[u8]) -> Result<(), ValidationError> {
        let hash = hex::encode(account_hash);
        if self.banned_payment_accounts.contains(&hash) {
            return Err(ValidationError::BannedPaymentAccount(hash));
        }
        Ok(())
    }

    /// Full peer check used by the `ApplyFilter` tasks.
    pub fn check_peer(
        &self,
        node: &NodeAddress,
        account_hash: Option<&[u8]>,
    ) -> Result<(), ValidationError> {
        self.check_node(node)?;
        if let Some(hash) = account_hash {
            self.check_payment_account(hash)?;
        }
        Ok(())
    }
}
