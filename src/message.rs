//! Wire envelope and typed protocol messages.
use crate::capabilities::Capabilities;
use crate::error::CodecError;
use crate::offer::PaymentMethod;
use crate::protocol::dispute::Dispute;
use crate::types::{Coin, NodeAddress, OfferId, Price, PubKeyRing, TradeId, TxId, Uid};
use crate::utils;
use crate::wallet::PreparedTx;

/// Every message on the wire. Identity is the `uid`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct NetworkEnvelope {
    #[n(0)]
    pub protocol_version: u32,
    #[n(1)]
    pub uid: Uid,
    #[n(2)]
    pub sender: NodeAddress,
    /// Authenticated by the messaging layer.
    #[n(3)]
    pub sender_pub_key_ring: PubKeyRing,
    #[n(4)]
    pub payload: Payload,
}

impl PartialEq for NetworkEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for NetworkEnvelope {}

impl NetworkEnvelope {
    pub fn new(
        protocol_version: u32,
        sender: NodeAddress,
        sender_pub_key_ring: PubKeyRing,
        payload: Payload,
    ) -> Self {
        Self {
            protocol_version,
            uid: utils::new_uid(),
            sender,
            sender_pub_key_ring,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        minicbor::to_vec(self).map_err(|e| CodecError::Encode {
            what: "network envelope",
            reason: e.to_string(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        minicbor::decode(bytes).map_err(|e| CodecError::Decode {
            what: "network envelope",
            reason: e.to_string(),
        })
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    #[n(0)]
    OfferAvailabilityRequest(#[n(0)] OfferAvailabilityRequest),
    #[n(1)]
    OfferAvailabilityResponse(#[n(0)] OfferAvailabilityResponse),
    #[n(2)]
    PayDepositRequest(#[n(0)] PayDepositRequest),
    #[n(3)]
    PublishDepositTxRequest(#[n(0)] PublishDepositTxRequest),
    #[n(4)]
    PreparedTxSignaturesRequest(#[n(0)] PreparedTxSignaturesRequest),
    #[n(5)]
    PreparedTxSignaturesResponse(#[n(0)] PreparedTxSignaturesResponse),
    #[n(6)]
    DepositTxPublished(#[n(0)] DepositTxPublishedMessage),
    #[n(7)]
    PaymentStarted(#[n(0)] PaymentStartedMessage),
    #[n(8)]
    PayoutTxPublished(#[n(0)] PayoutTxPublishedMessage),
    #[n(9)]
    BsqSwapTakeRequest(#[n(0)] BsqSwapTakeRequest),
    #[n(10)]
    BsqSwapInputsResponse(#[n(0)] BsqSwapInputsResponse),
    #[n(11)]
    BsqSwapFinalized(#[n(0)] BsqSwapFinalizedMessage),
    #[n(12)]
    OpenDispute(#[n(0)] OpenDisputeMessage),
    #[n(13)]
    PeerOpenedDispute(#[n(0)] PeerOpenedDisputeMessage),
    #[n(14)]
    DisputeResult(#[n(0)] DisputeResultMessage),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::OfferAvailabilityRequest(_) => "OfferAvailabilityRequest",
            Payload::OfferAvailabilityResponse(_) => "OfferAvailabilityResponse",
            Payload::PayDepositRequest(_) => "PayDepositRequest",
            Payload::PublishDepositTxRequest(_) => "PublishDepositTxRequest",
            Payload::PreparedTxSignaturesRequest(_) => "PreparedTxSignaturesRequest",
            Payload::PreparedTxSignaturesResponse(_) => "PreparedTxSignaturesResponse",
            Payload::DepositTxPublished(_) => "DepositTxPublishedMessage",
            Payload::PaymentStarted(_) => "PaymentStartedMessage",
            Payload::PayoutTxPublished(_) => "PayoutTxPublishedMessage",
            Payload::BsqSwapTakeRequest(_) => "BsqSwapTakeRequest",
            Payload::BsqSwapInputsResponse(_) => "BsqSwapInputsResponse",
            Payload::BsqSwapFinalized(_) => "BsqSwapFinalizedMessage",
            Payload::OpenDispute(_) => "OpenDisputeMessage",
            Payload::PeerOpenedDispute(_) => "PeerOpenedDisputeMessage",
            Payload::DisputeResult(_) => "DisputeResultMessage",
        }
    }

    /// Trade the message belongs to; `None` for offer level messages.
    pub fn trade_id(&self) -> Option<&TradeId> {
        match self {
            Payload::OfferAvailabilityRequest(_) | Payload::OfferAvailabilityResponse(_) => None,
            Payload::PayDepositRequest(m) => Some(&m.trade_id),
            Payload::PublishDepositTxRequest(m) => Some(&m.trade_id),
            Payload::PreparedTxSignaturesRequest(m) => Some(&m.trade_id),
            Payload::PreparedTxSignaturesResponse(m) => Some(&m.trade_id),
            Payload::DepositTxPublished(m) => Some(&m.trade_id),
            Payload::PaymentStarted(m) => Some(&m.trade_id),
            Payload::PayoutTxPublished(m) => Some(&m.trade_id),
            Payload::BsqSwapTakeRequest(m) => Some(&m.trade_id),
            Payload::BsqSwapInputsResponse(m) => Some(&m.trade_id),
            Payload::BsqSwapFinalized(m) => Some(&m.trade_id),
            Payload::OpenDispute(m) => Some(&m.dispute.trade_id),
            Payload::PeerOpenedDispute(m) => Some(&m.trade_id),
            Payload::DisputeResult(m) => Some(&m.trade_id),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityResult {
    #[n(0)]
    Available,
    #[n(1)]
    OfferTaken,
    #[n(2)]
    PriceOutOfTolerance,
    #[n(3)]
    NoRefundAgents,
    #[n(4)]
    MissingMandatoryCapability,
    #[n(5)]
    UserIgnored,
    #[n(6)]
    UnconfTxLimitHit,
    #[n(7)]
    UnknownFailure,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OfferAvailabilityRequest {
    #[n(0)]
    pub offer_id: OfferId,
    #[n(1)]
    pub taker_pub_key_ring: PubKeyRing,
    #[n(2)]
    pub price: Price,
    #[n(3)]
    pub capabilities: Capabilities,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OfferAvailabilityResponse {
    #[n(0)]
    pub offer_id: OfferId,
    #[n(1)]
    pub result: AvailabilityResult,
    #[n(2)]
    pub refund_agent: Option<NodeAddress>,
    #[n(3)]
    pub maker_capabilities: Capabilities,
}

/// Taker to maker, opens the deposit protocol.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PayDepositRequest {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub offer_id: OfferId,
    #[n(2)]
    pub amount: Coin,
    #[n(3)]
    pub price: Price,
    #[n(4)]
    pub taker_fee_tx_id: TxId,
    #[n(5)]
    pub multisig_pub_key: Vec<u8>,
    #[n(6)]
    pub payment_account_hash: Vec<u8>,
    #[n(7)]
    pub payment_method: PaymentMethod,
    /// Signature over `hash(trade_id, taker_fee_tx_id)`.
    #[n(8)]
    pub account_age_signature: Vec<u8>,
    #[n(9)]
    pub payout_address: String,
    #[n(10)]
    pub refund_agent: NodeAddress,
}

/// Maker to taker, carries the prepared deposit tx and the maker's terms.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PublishDepositTxRequest {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub multisig_pub_key: Vec<u8>,
    #[n(2)]
    pub payment_account_hash: Vec<u8>,
    #[n(3)]
    pub payment_method: PaymentMethod,
    /// Signature over `hash(trade_id, deposit_tx_id)`.
    #[n(4)]
    pub account_age_signature: Vec<u8>,
    #[n(5)]
    pub contract_signature: Vec<u8>,
    #[n(6)]
    pub prepared_deposit_tx: PreparedTx,
    /// Withheld in the v5 variant until the prepared txs are exchanged.
    #[n(7)]
    pub maker_deposit_signature: Option<Vec<u8>>,
    #[n(8)]
    pub payout_address: String,
    #[n(9)]
    pub payout_delay_ms: u64,
    #[n(10)]
    pub maker_fee_tx_id: Option<TxId>,
}

/// Taker's signatures on the maker's warning and redirect txs (v5).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PreparedTxSignaturesRequest {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub warning_signature: Vec<u8>,
    #[n(2)]
    pub redirect_signature: Vec<u8>,
    #[n(3)]
    pub fee_bump_address: String,
}

/// Maker's signatures on the taker's warning and redirect txs, plus the deposit (v5).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PreparedTxSignaturesResponse {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub warning_signature: Vec<u8>,
    #[n(2)]
    pub redirect_signature: Vec<u8>,
    #[n(3)]
    pub deposit_signature: Vec<u8>,
    #[n(4)]
    pub fee_bump_address: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DepositTxPublishedMessage {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub deposit_tx_id: TxId,
    #[n(2)]
    pub contract_signature: Vec<u8>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PaymentStartedMessage {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub payout_signature: Vec<u8>,
    #[n(2)]
    pub payout_address: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PayoutTxPublishedMessage {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub payout_tx_id: TxId,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BsqSwapTakeRequest {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub offer_id: OfferId,
    #[n(2)]
    pub amount: Coin,
    #[n(3)]
    pub price: Price,
    #[n(4)]
    pub inputs: Vec<Vec<u8>>,
    #[n(5)]
    pub receive_address: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BsqSwapInputsResponse {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub inputs: Vec<Vec<u8>>,
    #[n(2)]
    pub receive_address: String,
    /// Maker's signature over the assembled swap tx.
    #[n(3)]
    pub signature: Vec<u8>,
    #[n(4)]
    pub pub_key: Vec<u8>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BsqSwapFinalizedMessage {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub tx_id: TxId,
}

/// Trader to refund agent.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OpenDisputeMessage {
    #[n(0)]
    pub dispute: Dispute,
}

/// Trader to trading peer, after opening a dispute.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PeerOpenedDisputeMessage {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub refund_agent: NodeAddress,
    #[n(2)]
    pub reason: String,
}

/// Refund agent to trader, closes the dispute.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DisputeResultMessage {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub buyer_payout: Coin,
    #[n(2)]
    pub seller_payout: Coin,
    #[n(3)]
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_identity_is_uid() {
        let payload = Payload::PayoutTxPublished(PayoutTxPublishedMessage {
            trade_id: "trade1abc".into(),
            payout_tx_id: "tx".into(),
        });
        let keys = PubKeyRing::new(vec![1], vec![2]);
        let a = NetworkEnvelope::new(4, "a.onion:1".into(), keys.clone(), payload.clone());
        let b = NetworkEnvelope::new(4, "a.onion:1".into(), keys, payload);

        assert_ne!(a, b);
        let decoded = NetworkEnvelope::from_bytes(&a.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, a);
        assert_eq!(decoded.payload, a.payload);
        assert_eq!(decoded.payload.trade_id(), Some(&TradeId::from("trade1abc")));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            NetworkEnvelope::from_bytes(&[0xff, 0x00]),
            Err(CodecError::Decode { .. })
        ));
    }
}
