//! Wallet, key ring and account-age collaborators.
//!
//! The engine never builds or signs transactions itself; it describes what it
//! needs with a [`TxRequest`] and hands the resulting [`PreparedTx`] around.
use async_trait::async_trait;
use tracing::warn;

use crate::error::{TradeError, WalletError};
use crate::types::{Coin, PubKeyRing, TradeId, TxId};

/// Tag a wallet key is allocated under, together with the trade id.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressPurpose {
    #[n(0)]
    MultiSig,
    #[n(1)]
    TradePayout,
    #[n(2)]
    FeeBump,
    #[n(3)]
    BsqSwap,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    #[n(0)]
    pub purpose: AddressPurpose,
    #[n(1)]
    pub pub_key: Vec<u8>,
    #[n(2)]
    pub address: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    #[n(0)]
    TradeFee,
    #[n(1)]
    Deposit,
    #[n(2)]
    Payout,
    #[n(3)]
    Warning,
    #[n(4)]
    Redirect,
    #[n(5)]
    BsqSwap,
}

/// Everything the wallet needs to build one transaction.
///
/// Building is deterministic: both peers derive identical transactions from
/// identical requests, which is how co-signing works without shipping every
/// transaction back and forth.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    #[n(0)]
    pub kind: TxKind,
    #[n(1)]
    pub trade_id: TradeId,
    #[n(2)]
    pub amount: Coin,
    /// Multisig keys in maker, taker order.
    #[n(3)]
    pub keys: Vec<Vec<u8>>,
    #[n(4)]
    pub parent: Option<TxId>,
    #[n(5)]
    pub lock_time_ms: u64,
    #[n(6)]
    pub outputs: Vec<String>,
    #[n(7)]
    pub inputs: Vec<Vec<u8>>,
}

impl TxRequest {
    pub fn new(kind: TxKind, trade_id: TradeId, amount: Coin) -> Self {
        Self {
            kind,
            trade_id,
            amount,
            keys: Vec::new(),
            parent: None,
            lock_time_ms: 0,
            outputs: Vec::new(),
            inputs: Vec::new(),
        }
    }
    pub fn keys(mut self, keys: Vec<Vec<u8>>) -> Self {
        self.keys = keys;
        self
    }
    pub fn parent(mut self, parent: TxId) -> Self {
        self.parent = Some(parent);
        self
    }
    pub fn lock_time_ms(mut self, lock_time_ms: u64) -> Self {
        self.lock_time_ms = lock_time_ms;
        self
    }
    pub fn outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }
    pub fn inputs(mut self, inputs: Vec<Vec<u8>>) -> Self {
        self.inputs = inputs;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PreparedTx {
    #[n(0)]
    pub id: TxId,
    #[n(1)]
    pub kind: TxKind,
    #[n(2)]
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait WalletPort: Send + Sync {
    /// Allocate, or return the already allocated, key for `(trade_id, purpose)`.
    fn key_entry(&self, trade_id: &TradeId, purpose: AddressPurpose) -> Result<KeyEntry, WalletError>;

    /// Own transactions broadcast but not yet confirmed.
    fn unconfirmed_own_tx_count(&self) -> usize;

    fn build_tx(&self, request: &TxRequest) -> Result<PreparedTx, WalletError>;

    /// Inputs the wallet contributes to an atomic swap of `amount`.
    fn swap_inputs(&self, trade_id: &TradeId, amount: Coin) -> Result<Vec<Vec<u8>>, WalletError>;

    fn sign_tx(&self, key: &KeyEntry, tx: &PreparedTx) -> Result<Vec<u8>, WalletError>;

    fn verify_tx_signature(&self, pub_key: &[u8], tx: &PreparedTx, signature: &[u8]) -> bool;

    /// Resolves once the network accepted the transaction.
    async fn broadcast(&self, tx: &PreparedTx, signatures: &[Vec<u8>]) -> Result<TxId, WalletError>;
}

/// Our own identity keys; signs contracts and account-age proofs.
pub trait KeyRing: Send + Sync {
    fn pub_key_ring(&self) -> PubKeyRing;
    fn sign(&self, data: &[u8]) -> Vec<u8>;
    fn verify(&self, signer: &PubKeyRing, data: &[u8], signature: &[u8]) -> bool;
}

pub trait AccountAgeWitnessPort: Send + Sync {
    /// Age of the payment account in ms, `None` if no witness was ever published.
    fn account_age_ms(&self, payment_account_hash: &[u8], owner: &PubKeyRing) -> Option<u64>;
}

/// Refuse new fee or deposit transactions while too many of ours are pending.
pub fn check_unconfirmed_limit(wallet: &dyn WalletPort, limit: usize) -> Result<(), TradeError> {
    let count = wallet.unconfirmed_own_tx_count();
    if count > limit {
        warn!(count, limit, "too many unconfirmed transactions");
        return Err(TradeError::TooManyUnconfirmedTransactions { count, limit });
    }
    Ok(())
}
