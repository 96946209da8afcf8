//! The persisted trade aggregate and its state machine.
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{CodecError, TradeError};
use crate::offer::{Offer, PaymentMethod};
use crate::process_model::ProcessModel;
use crate::types::{Coin, Direction, NodeAddress, OfferId, Price, PubKeyRing, TimeStamp, TradeId};
use crate::utils;

/// Coarse progress of a trade. Transitions never go to an earlier phase.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    #[n(0)]
    Init,
    #[n(1)]
    TakerFeePublished,
    #[n(2)]
    DepositPublished,
    #[n(3)]
    DepositConfirmed,
    #[n(4)]
    FiatSent,
    #[n(5)]
    FiatReceived,
    #[n(6)]
    PayoutPublished,
    #[n(7)]
    Closed,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeState {
    #[n(0)]
    Preparation,
    #[n(1)]
    TakerPublishedTakerFeeTx,
    #[n(2)]
    MakerSentPublishDepositTxRequest,
    #[n(3)]
    MakerSawArrivedPublishDepositTxRequest,
    #[n(4)]
    MakerStoredInMailboxPublishDepositTxRequest,
    #[n(5)]
    MakerSendFailedPublishDepositTxRequest,
    #[n(6)]
    TakerReceivedPublishDepositTxRequest,
    #[n(7)]
    TakerSentPreparedTxSignatures,
    #[n(8)]
    MakerSentPreparedTxSignatures,
    #[n(9)]
    TakerReceivedPreparedTxSignatures,

    #[n(10)]
    TakerPublishedDepositTx,
    #[n(11)]
    TakerSentDepositTxPublishedMsg,
    #[n(12)]
    TakerSawArrivedDepositTxPublishedMsg,
    #[n(13)]
    TakerStoredInMailboxDepositTxPublishedMsg,
    #[n(14)]
    TakerSendFailedDepositTxPublishedMsg,
    #[n(15)]
    MakerReceivedDepositTxPublishedMsg,

    #[n(16)]
    DepositConfirmedInBlockChain,

    #[n(17)]
    BuyerConfirmedPaymentInitiated,
    #[n(18)]
    BuyerSentPaymentStartedMsg,
    #[n(19)]
    BuyerSawArrivedPaymentStartedMsg,
    #[n(20)]
    BuyerStoredInMailboxPaymentStartedMsg,
    #[n(21)]
    BuyerSendFailedPaymentStartedMsg,
    #[n(22)]
    SellerReceivedPaymentStartedMsg,

    #[n(23)]
    SellerConfirmedPaymentReceipt,

    #[n(24)]
    SellerPublishedPayoutTx,
    #[n(25)]
    SellerSentPayoutTxPublishedMsg,
    #[n(26)]
    SellerSawArrivedPayoutTxPublishedMsg,
    #[n(27)]
    SellerStoredInMailboxPayoutTxPublishedMsg,
    #[n(28)]
    SellerSendFailedPayoutTxPublishedMsg,
    #[n(29)]
    BuyerReceivedPayoutTxPublishedMsg,

    #[n(30)]
    Completed,
    #[n(31)]
    DisputeClosed,
    /// Aborted at the given phase, always before any funds moved.
    #[n(32)]
    Failed(#[n(0)] Phase),
    /// Maker found the deposit tx in its wallet before the taker's message.
    #[n(33)]
    MakerSawDepositTxInWallet,
}

impl TradeState {
    pub fn phase(self) -> Phase {
        use TradeState::*;
        match self {
            Preparation => Phase::Init,
            TakerPublishedTakerFeeTx
            | MakerSentPublishDepositTxRequest
            | MakerSawArrivedPublishDepositTxRequest
            | MakerStoredInMailboxPublishDepositTxRequest
            | MakerSendFailedPublishDepositTxRequest
            | TakerReceivedPublishDepositTxRequest
            | TakerSentPreparedTxSignatures
            | MakerSentPreparedTxSignatures
            | TakerReceivedPreparedTxSignatures => Phase::TakerFeePublished,
            TakerPublishedDepositTx
            | TakerSentDepositTxPublishedMsg
            | TakerSawArrivedDepositTxPublishedMsg
            | TakerStoredInMailboxDepositTxPublishedMsg
            | TakerSendFailedDepositTxPublishedMsg
            | MakerReceivedDepositTxPublishedMsg
            | MakerSawDepositTxInWallet => Phase::DepositPublished,
            DepositConfirmedInBlockChain => Phase::DepositConfirmed,
            BuyerConfirmedPaymentInitiated
            | BuyerSentPaymentStartedMsg
            | BuyerSawArrivedPaymentStartedMsg
            | BuyerStoredInMailboxPaymentStartedMsg
            | BuyerSendFailedPaymentStartedMsg
            | SellerReceivedPaymentStartedMsg => Phase::FiatSent,
            SellerConfirmedPaymentReceipt => Phase::FiatReceived,
            SellerPublishedPayoutTx
            | SellerSentPayoutTxPublishedMsg
            | SellerSawArrivedPayoutTxPublishedMsg
            | SellerStoredInMailboxPayoutTxPublishedMsg
            | SellerSendFailedPayoutTxPublishedMsg
            | BuyerReceivedPayoutTxPublishedMsg => Phase::PayoutPublished,
            Completed | DisputeClosed => Phase::Closed,
            Failed(at) => at,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeState::Completed | TradeState::DisputeClosed | TradeState::Failed(_)
        )
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeState {
    #[n(0)]
    NoDispute,
    #[n(1)]
    RefundRequested,
    #[n(2)]
    RefundRequestStartedByPeer,
    #[n(3)]
    RefundRequestClosed,
}

impl DisputeState {
    pub fn is_open(self) -> bool {
        matches!(
            self,
            DisputeState::RefundRequested | DisputeState::RefundRequestStartedByPeer
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TradePeriodState {
    #[n(0)]
    FirstHalf,
    #[n(1)]
    SecondHalf,
    #[n(2)]
    TradePeriodOver,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeRole {
    #[n(0)]
    Maker,
    #[n(1)]
    Taker,
}

/// Terms both parties sign. Identical bytes on both sides.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub offer_id: OfferId,
    #[n(2)]
    pub amount: Coin,
    #[n(3)]
    pub price: Price,
    #[n(4)]
    pub offer_direction: Direction,
    #[n(5)]
    pub payment_method: PaymentMethod,
    #[n(6)]
    pub maker_node: NodeAddress,
    #[n(7)]
    pub taker_node: NodeAddress,
    #[n(8)]
    pub maker_pub_key_ring: PubKeyRing,
    #[n(9)]
    pub taker_pub_key_ring: PubKeyRing,
    #[n(10)]
    pub maker_multisig_pub_key: Vec<u8>,
    #[n(11)]
    pub taker_multisig_pub_key: Vec<u8>,
    #[n(12)]
    pub maker_payment_account_hash: Vec<u8>,
    #[n(13)]
    pub taker_payment_account_hash: Vec<u8>,
    #[n(14)]
    pub maker_payout_address: String,
    #[n(15)]
    pub taker_payout_address: String,
    #[n(16)]
    pub refund_agent: NodeAddress,
    #[n(17)]
    pub payout_delay_ms: u64,
    #[n(18)]
    pub use_v5_protocol: bool,
}

impl Contract {
    pub fn hash(&self) -> Result<Vec<u8>, CodecError> {
        let contents = minicbor::to_vec(self).map_err(|e| CodecError::Encode {
            what: "contract",
            reason: e.to_string(),
        })?;
        Ok(utils::sha256_bytes(&contents))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SignedContract {
    #[n(0)]
    pub terms: Contract,
    #[n(1)]
    pub hash: Vec<u8>,
    #[n(2)]
    pub maker_signature: Vec<u8>,
    #[n(3)]
    pub taker_signature: Option<Vec<u8>>,
}

impl SignedContract {
    pub fn is_fully_signed(&self) -> bool {
        self.taker_signature.is_some()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct Trade {
    #[n(0)]
    pub id: TradeId,
    #[n(1)]
    pub offer: Offer,
    #[n(2)]
    pub role: TradeRole,
    #[n(3)]
    pub amount: Coin,
    #[n(4)]
    pub price: Price,
    #[n(5)]
    pub peer_address: NodeAddress,
    #[n(6)]
    pub contract: Option<SignedContract>,
    #[n(7)]
    state: TradeState,
    #[n(8)]
    dispute_state: DisputeState,
    #[n(9)]
    error_message: Option<String>,
    #[n(10)]
    pub process_model: ProcessModel,
    #[n(11)]
    pub created_at: TimeStamp<Utc>,
    #[n(12)]
    pub deposit_published_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    period_state: TradePeriodState,
    #[n(14)]
    pub refund_agent: Option<NodeAddress>,
}

impl Trade {
    pub fn new(
        id: TradeId,
        offer: Offer,
        role: TradeRole,
        amount: Coin,
        peer_address: NodeAddress,
        process_model: ProcessModel,
    ) -> Self {
        Self {
            id,
            price: offer.price,
            offer,
            role,
            amount,
            peer_address,
            contract: None,
            state: TradeState::Preparation,
            dispute_state: DisputeState::NoDispute,
            error_message: None,
            process_model,
            created_at: TimeStamp::new(),
            deposit_published_at: None,
            period_state: TradePeriodState::FirstHalf,
            refund_agent: None,
        }
    }

    pub fn state(&self) -> TradeState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn dispute_state(&self) -> DisputeState {
        self.dispute_state
    }

    pub fn period_state(&self) -> TradePeriodState {
        self.period_state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_maker(&self) -> bool {
        self.role == TradeRole::Maker
    }

    /// Our side of the trade, in BTC terms.
    pub fn direction(&self) -> Direction {
        match self.role {
            TradeRole::Maker => self.offer.direction,
            TradeRole::Taker => self.offer.direction.mirror(),
        }
    }

    pub fn is_buyer(&self) -> bool {
        self.direction() == Direction::Buy
    }

    pub fn is_deposit_published(&self) -> bool {
        self.process_model.deposit_tx_id.is_some()
            || (self.phase() >= Phase::DepositPublished && !matches!(self.state, TradeState::Failed(_)))
    }

    /// The peer holds everything needed to lock our funds: either the deposit
    /// is published, or we are the maker and sent our signed deposit inputs.
    pub fn is_deposit_committed(&self) -> bool {
        use TradeState::*;
        self.is_deposit_published()
            || (self.is_maker()
                && self.process_model.deposit_signature.is_some()
                && matches!(
                    self.state,
                    MakerSentPublishDepositTxRequest
                        | MakerSawArrivedPublishDepositTxRequest
                        | MakerStoredInMailboxPublishDepositTxRequest
                        | MakerSentPreparedTxSignatures
                ))
    }

    pub fn is_payout_published(&self) -> bool {
        self.phase() >= Phase::PayoutPublished || self.process_model.payout_tx_id.is_some()
    }

    pub fn record_name(&self) -> String {
        format!("trade_{}", self.id)
    }

    /// Record the trade is moved to once it reached a terminal state.
    pub fn archive_record_name(&self) -> Option<String> {
        match self.state {
            TradeState::Completed | TradeState::DisputeClosed => Some(format!("closed_{}", self.id)),
            TradeState::Failed(_) => Some(format!("failed_{}", self.id)),
            _ => None,
        }
    }

    /// Move to `next`. Rejected when it would go to an earlier phase or leave a terminal state.
    pub fn set_state(&mut self, next: TradeState) -> Result<(), TradeError> {
        if self.state == next {
            return Ok(());
        }
        if self.state.is_terminal() || next.phase() < self.state.phase() {
            warn!(trade_id = %self.id.short(), from = %self.state, to = %next, "rejected state transition");
            return Err(TradeError::InvalidTransition {
                trade_id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(trade_id = %self.id.short(), from = %self.state, to = %next, "trade state changed");
        self.state = next;
        if next.phase() >= Phase::DepositPublished
            && !next.is_terminal()
            && self.deposit_published_at.is_none()
        {
            self.deposit_published_at = Some(TimeStamp::new());
        }
        Ok(())
    }

    /// Mark the trade failed at its current phase.
    pub fn fail(&mut self, reason: &str) -> Result<(), TradeError> {
        self.append_error_message(reason);
        self.set_state(TradeState::Failed(self.phase()))
    }

    pub fn set_dispute_state(&mut self, next: DisputeState) {
        if self.dispute_state != next {
            info!(trade_id = %self.id.short(), from = ?self.dispute_state, to = ?next, "dispute state changed");
            self.dispute_state = next;
        }
    }

    pub fn append_error_message(&mut self, message: &str) {
        match &mut self.error_message {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(message);
            }
            None => self.error_message = Some(message.to_owned()),
        }
    }

    pub fn max_trade_period(&self) -> Duration {
        self.offer.payment_method.max_trade_period()
    }

    /// Recompute the trade period state at `now`. Only advances.
    pub fn update_period_state(&mut self, now: &TimeStamp<Utc>) -> TradePeriodState {
        let Some(start) = &self.deposit_published_at else {
            return self.period_state;
        };
        let elapsed = now.since(start);
        let max = self.max_trade_period();
        let next = if elapsed >= max {
            TradePeriodState::TradePeriodOver
        } else if elapsed >= max / 2 {
            TradePeriodState::SecondHalf
        } else {
            TradePeriodState::FirstHalf
        };
        if next > self.period_state {
            info!(trade_id = %self.id.short(), period = ?next, "trade period state changed");
            self.period_state = next;
        }
        self.period_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::{OfferBuilder, PaymentAccount};
    use crate::process_model::TradingPeer;

    fn trade() -> Trade {
        let offer = OfferBuilder::new()
            .set_maker("maker.onion:1".into(), PubKeyRing::new(vec![1], vec![2]))
            .set_direction(Direction::Buy)
            .set_amount(100_000)
            .set_price(60_000)
            .set_currency_code("EUR")
            .set_payment_method(PaymentMethod::Sepa)
            .validate_and_finalise()
            .unwrap();
        let peer = TradingPeer::new("maker.onion:1".into(), offer.maker_pub_key_ring.clone());
        let account = PaymentAccount::new(PaymentMethod::Sepa, "Bob", vec![7]);
        Trade::new(
            utils::new_trade_id(),
            offer,
            TradeRole::Taker,
            Coin(100_000),
            "maker.onion:1".into(),
            ProcessModel::new(peer, account),
        )
    }

    #[test]
    fn taker_of_buy_offer_is_seller() {
        let trade = trade();
        assert!(!trade.is_buyer());
        assert_eq!(trade.direction(), Direction::Sell);
    }

    #[test]
    fn forward_transitions_within_and_across_phases() {
        let mut trade = trade();
        trade.set_state(TradeState::TakerPublishedTakerFeeTx).unwrap();
        trade.set_state(TradeState::TakerReceivedPublishDepositTxRequest).unwrap();
        trade.set_state(TradeState::TakerPublishedDepositTx).unwrap();

        assert!(trade.is_deposit_published());
        assert!(trade.deposit_published_at.is_some());
    }

    #[test]
    fn no_transition_back_before_the_deposit() {
        let mut trade = trade();
        trade.set_state(TradeState::TakerPublishedDepositTx).unwrap();

        assert!(matches!(
            trade.set_state(TradeState::Preparation),
            Err(TradeError::InvalidTransition { .. })
        ));
        assert!(trade.set_state(TradeState::Failed(Phase::Init)).is_err());
        assert_eq!(trade.state(), TradeState::TakerPublishedDepositTx);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let mut trade = trade();
        trade.fail("peer vanished").unwrap();

        assert_eq!(trade.state(), TradeState::Failed(Phase::Init));
        assert!(trade.set_state(TradeState::TakerPublishedTakerFeeTx).is_err());
        assert_eq!(trade.archive_record_name(), Some(format!("failed_{}", trade.id)));
    }

    #[test]
    fn error_messages_append() {
        let mut trade = trade();
        trade.append_error_message("first");
        trade.append_error_message("second");

        assert_eq!(trade.error_message(), Some("first\nsecond"));
    }

    #[test]
    fn period_state_follows_max_trade_period() {
        let mut trade = trade();
        let start = TimeStamp::new_with(2024, 1, 1, 0, 0, 0);
        trade.deposit_published_at = Some(start.clone());

        // sepa allows six days
        let day = Duration::from_secs(24 * 60 * 60);
        assert_eq!(trade.update_period_state(&start.plus(day)), TradePeriodState::FirstHalf);
        assert_eq!(trade.update_period_state(&start.plus(day * 3)), TradePeriodState::SecondHalf);
        assert_eq!(
            trade.update_period_state(&start.plus(day * 6)),
            TradePeriodState::TradePeriodOver
        );
    }

    #[test]
    fn contract_hash_is_stable() {
        let trade = trade();
        let contract = Contract {
            trade_id: trade.id.clone(),
            offer_id: trade.offer.id.clone(),
            amount: trade.amount,
            price: trade.price,
            offer_direction: trade.offer.direction,
            payment_method: trade.offer.payment_method,
            maker_node: "maker.onion:1".into(),
            taker_node: "taker.onion:1".into(),
            maker_pub_key_ring: PubKeyRing::new(vec![1], vec![2]),
            taker_pub_key_ring: PubKeyRing::new(vec![3], vec![4]),
            maker_multisig_pub_key: vec![5],
            taker_multisig_pub_key: vec![6],
            maker_payment_account_hash: vec![7],
            taker_payment_account_hash: vec![8],
            maker_payout_address: "m".into(),
            taker_payout_address: "t".into(),
            refund_agent: "agent.onion:1".into(),
            payout_delay_ms: 0,
            use_v5_protocol: false,
        };
        let mut other = contract.clone();

        assert_eq!(contract.hash().unwrap(), other.hash().unwrap());
        other.payout_delay_ms = 1;
        assert_ne!(contract.hash().unwrap(), other.hash().unwrap());
    }
}
