//! Per-trade scratch state: our key material and partially built transactions,
//! and the mirror of what the trading peer contributed.
use crate::offer::{PaymentAccount, PaymentMethod};
use crate::types::{NodeAddress, PubKeyRing, TxId, Uid};
use crate::wallet::{KeyEntry, PreparedTx};

/// What the counterparty contributed. Filled only from authenticated messages.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TradingPeer {
    #[n(0)]
    pub node: NodeAddress,
    #[n(1)]
    pub pub_key_ring: PubKeyRing,
    #[n(2)]
    pub multisig_pub_key: Option<Vec<u8>>,
    #[n(3)]
    pub payment_account_hash: Option<Vec<u8>>,
    #[n(4)]
    pub payment_method: Option<PaymentMethod>,
    #[n(5)]
    pub account_age_signature: Option<Vec<u8>>,
    #[n(6)]
    pub account_age_ms: Option<u64>,
    #[n(7)]
    pub payout_address: Option<String>,
    #[n(8)]
    pub fee_tx_id: Option<TxId>,
    #[n(9)]
    pub contract_signature: Option<Vec<u8>>,
    #[n(10)]
    pub deposit_signature: Option<Vec<u8>>,
    /// Peer's signature on our warning tx.
    #[n(11)]
    pub warning_signature: Option<Vec<u8>>,
    /// Peer's signature on our redirect tx.
    #[n(12)]
    pub redirect_signature: Option<Vec<u8>>,
    #[n(13)]
    pub fee_bump_address: Option<String>,
    #[n(14)]
    pub payout_signature: Option<Vec<u8>>,
}

impl TradingPeer {
    pub fn new(node: NodeAddress, pub_key_ring: PubKeyRing) -> Self {
        Self {
            node,
            pub_key_ring,
            multisig_pub_key: None,
            payment_account_hash: None,
            payment_method: None,
            account_age_signature: None,
            account_age_ms: None,
            payout_address: None,
            fee_tx_id: None,
            contract_signature: None,
            deposit_signature: None,
            warning_signature: None,
            redirect_signature: None,
            fee_bump_address: None,
            payout_signature: None,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProcessModel {
    #[n(0)]
    pub peer: TradingPeer,
    #[n(1)]
    pub payment_account: PaymentAccount,
    #[n(2)]
    pub multisig_key: Option<KeyEntry>,
    #[n(3)]
    pub payout_address: Option<String>,
    #[n(4)]
    pub fee_bump_address: Option<String>,
    #[n(5)]
    pub fee_tx_id: Option<TxId>,
    #[n(6)]
    pub prepared_deposit_tx: Option<PreparedTx>,
    #[n(7)]
    pub deposit_signature: Option<Vec<u8>>,
    #[n(8)]
    pub deposit_tx_id: Option<TxId>,
    /// Ours to publish if the peer disappears after the deposit.
    #[n(9)]
    pub warning_tx: Option<PreparedTx>,
    #[n(10)]
    pub redirect_tx: Option<PreparedTx>,
    #[n(11)]
    pub payout_tx: Option<PreparedTx>,
    #[n(12)]
    pub payout_signature: Option<Vec<u8>>,
    #[n(13)]
    pub payout_tx_id: Option<TxId>,
    /// Uids of messages whose task sequence completed.
    #[n(14)]
    pub processed_uids: Vec<Uid>,
}

impl ProcessModel {
    pub fn new(peer: TradingPeer, payment_account: PaymentAccount) -> Self {
        Self {
            peer,
            payment_account,
            multisig_key: None,
            payout_address: None,
            fee_bump_address: None,
            fee_tx_id: None,
            prepared_deposit_tx: None,
            deposit_signature: None,
            deposit_tx_id: None,
            warning_tx: None,
            redirect_tx: None,
            payout_tx: None,
            payout_signature: None,
            payout_tx_id: None,
            processed_uids: Vec::new(),
        }
    }

    pub fn is_processed(&self, uid: &Uid) -> bool {
        self.processed_uids.contains(uid)
    }

    pub fn mark_processed(&mut self, uid: Uid) {
        if !self.is_processed(&uid) {
            self.processed_uids.push(uid);
        }
    }
}
