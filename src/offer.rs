//! Offers, payment methods and payment accounts.
use std::time::Duration;

use chrono::Utc;

use crate::capabilities::Capabilities;
use crate::error::ValidationError;
use crate::types::{Coin, Direction, NodeAddress, OfferId, Price, PubKeyRing, TimeStamp, TxId};
use crate::utils;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChargebackRisk {
    #[n(0)]
    VeryLow,
    #[n(1)]
    Low,
    #[n(2)]
    Moderate,
    #[n(3)]
    High,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    #[n(0)]
    Sepa,
    #[n(1)]
    NationalBank,
    #[n(2)]
    Zelle,
    #[n(3)]
    Revolut,
    #[n(4)]
    CashDeposit,
    /// Altcoin trades, settled on another chain.
    #[n(5)]
    Blockchains,
    #[n(6)]
    BsqSwap,
}

impl PaymentMethod {
    pub fn id(self) -> &'static str {
        match self {
            PaymentMethod::Sepa => "SEPA",
            PaymentMethod::NationalBank => "NATIONAL_BANK",
            PaymentMethod::Zelle => "ZELLE",
            PaymentMethod::Revolut => "REVOLUT",
            PaymentMethod::CashDeposit => "CASH_DEPOSIT",
            PaymentMethod::Blockchains => "BLOCK_CHAINS",
            PaymentMethod::BsqSwap => "BSQ_SWAP",
        }
    }

    pub fn chargeback_risk(self) -> ChargebackRisk {
        match self {
            PaymentMethod::Blockchains | PaymentMethod::BsqSwap => ChargebackRisk::VeryLow,
            PaymentMethod::CashDeposit => ChargebackRisk::Low,
            PaymentMethod::Sepa | PaymentMethod::NationalBank => ChargebackRisk::Moderate,
            PaymentMethod::Zelle | PaymentMethod::Revolut => ChargebackRisk::High,
        }
    }

    /// Time the buyer has to complete the payment after the deposit confirmed.
    pub fn max_trade_period(self) -> Duration {
        match self {
            PaymentMethod::Blockchains | PaymentMethod::BsqSwap | PaymentMethod::Revolut => DAY,
            PaymentMethod::Zelle | PaymentMethod::NationalBank | PaymentMethod::CashDeposit => DAY * 4,
            PaymentMethod::Sepa => DAY * 6,
        }
    }

    pub fn is_crypto(self) -> bool {
        matches!(self, PaymentMethod::Blockchains | PaymentMethod::BsqSwap)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PaymentAccount {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub payment_method: PaymentMethod,
    #[n(2)]
    pub holder_name: String,
    #[n(3)]
    pub salt: Vec<u8>,
}

impl PaymentAccount {
    pub fn new(payment_method: PaymentMethod, holder_name: impl Into<String>, salt: Vec<u8>) -> Self {
        Self {
            id: utils::new_uid().to_string(),
            payment_method,
            holder_name: holder_name.into(),
            salt,
        }
    }

    /// Salted hash the peer sees instead of the account details.
    pub fn hash(&self) -> Vec<u8> {
        utils::hash_parts(&[
            self.payment_method.id().as_bytes(),
            self.holder_name.as_bytes(),
            &self.salt,
        ])
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    #[n(0)]
    Unknown,
    #[n(1)]
    OfferFeePaid,
    #[n(2)]
    Available,
    #[n(3)]
    NotAvailable,
    #[n(4)]
    Removed,
    #[n(5)]
    MakerOffline,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    #[n(0)]
    pub id: OfferId,
    #[n(1)]
    pub maker_node: NodeAddress,
    #[n(2)]
    pub maker_pub_key_ring: PubKeyRing,
    /// Direction from the maker's point of view.
    #[n(3)]
    pub direction: Direction,
    #[n(4)]
    pub amount: Coin,
    #[n(5)]
    pub min_amount: Coin,
    #[n(6)]
    pub price: Price,
    #[n(7)]
    pub currency_code: String,
    #[n(8)]
    pub payment_method: PaymentMethod,
    #[n(9)]
    pub use_v5_protocol: bool,
    #[n(10)]
    pub required_capabilities: Capabilities,
    #[n(11)]
    pub state: OfferState,
    #[n(12)]
    pub maker_fee_tx_id: Option<TxId>,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
}

impl Offer {
    pub fn is_bsq_swap(&self) -> bool {
        self.payment_method == PaymentMethod::BsqSwap
    }

    pub fn is_crypto(&self) -> bool {
        self.payment_method.is_crypto()
    }

    /// Record key in the persistence store.
    pub fn record_name(&self) -> String {
        format!("offer_{}", self.id)
    }
}

/// Trading fee paid by maker and taker: 0.7% of the amount, at least 5000 sats.
pub fn trade_fee(amount: Coin) -> Coin {
    Coin((amount.sats() / 1000 * 7).max(5_000))
}

/// Security deposit each side locks in the deposit tx: 15% of the amount.
pub fn security_deposit(amount: Coin) -> Coin {
    Coin(amount.sats() / 100 * 15)
}

/// Collects offer terms before they are validated into an [`Offer`].
#[derive(Default, Debug)]
pub struct OfferBuilder {
    maker_node: Option<NodeAddress>,
    maker_pub_key_ring: Option<PubKeyRing>,
    direction: Option<Direction>,
    amount: u64,
    min_amount: Option<u64>,
    price: u64,
    currency_code: Option<String>,
    payment_method: Option<PaymentMethod>,
    use_v5_protocol: bool,
    required_capabilities: Capabilities,
}

impl OfferBuilder {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_maker(mut self, node: NodeAddress, pub_key_ring: PubKeyRing) -> Self {
        self.maker_node = Some(node);
        self.maker_pub_key_ring = Some(pub_key_ring);
        self
    }
    pub fn set_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }
    pub fn set_amount(mut self, sats: u64) -> Self {
        self.amount = sats;
        self
    }
    pub fn set_min_amount(mut self, sats: u64) -> Self {
        self.min_amount = Some(sats);
        self
    }
    pub fn set_price(mut self, price: u64) -> Self {
        self.price = price;
        self
    }
    pub fn set_currency_code(mut self, code: &str) -> Self {
        self.currency_code = Some(code.to_owned());
        self
    }
    pub fn set_payment_method(mut self, method: PaymentMethod) -> Self {
        self.payment_method = Some(method);
        self
    }
    pub fn use_v5_protocol(mut self, enabled: bool) -> Self {
        self.use_v5_protocol = enabled;
        self
    }
    pub fn require_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    // Checks fields and returns the offer with a fresh id
    pub fn validate_and_finalise(self) -> Result<Offer, ValidationError> {
        let maker_node = self.maker_node.ok_or(ValidationError::InvalidOffer("maker is not set"))?;
        let maker_pub_key_ring = self
            .maker_pub_key_ring
            .ok_or(ValidationError::InvalidOffer("maker keys are not set"))?;
        let direction = self.direction.ok_or(ValidationError::InvalidOffer("direction is not set"))?;
        let payment_method = self
            .payment_method
            .ok_or(ValidationError::InvalidOffer("payment method is not set"))?;
        let currency_code = self
            .currency_code
            .ok_or(ValidationError::InvalidOffer("currency is not set"))?;
        if self.amount == 0 {
            return Err(ValidationError::InvalidOffer("amount is set to zero"));
        }
        if self.price == 0 {
            return Err(ValidationError::InvalidOffer("price is set to zero"));
        }
        let min_amount = self.min_amount.unwrap_or(self.amount);
        if min_amount == 0 || min_amount > self.amount {
            return Err(ValidationError::InvalidOffer("min amount outside 1..=amount"));
        }

        let id = utils::new_uuid_to_bech32("offer")
            .map_err(|_| ValidationError::InvalidOffer("failed to allocate offer id"))?;

        Ok(Offer {
            id: OfferId::new(id),
            maker_node,
            maker_pub_key_ring,
            direction,
            amount: Coin(self.amount),
            min_amount: Coin(min_amount),
            price: Price(self.price),
            currency_code,
            // bsq swaps settle in one transaction and never use the deposit protocol
            use_v5_protocol: self.use_v5_protocol && payment_method != PaymentMethod::BsqSwap,
            payment_method,
            required_capabilities: self.required_capabilities,
            state: OfferState::Unknown,
            maker_fee_tx_id: None,
            created_at: TimeStamp::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> OfferBuilder {
        OfferBuilder::new()
            .set_maker("maker.onion:1".into(), PubKeyRing::new(vec![1], vec![2]))
            .set_direction(Direction::Buy)
            .set_amount(100_000)
            .set_price(60_000)
            .set_currency_code("EUR")
            .set_payment_method(PaymentMethod::Sepa)
    }

    #[test]
    fn finalise_defaults_min_amount() {
        let offer = builder().validate_and_finalise().unwrap();

        assert_eq!(offer.min_amount, Coin(100_000));
        assert!(offer.id.as_str().starts_with("offer1"));
        assert_eq!(offer.state, OfferState::Unknown);
    }

    #[test]
    fn finalise_rejects_missing_terms() {
        assert!(builder().set_amount(0).validate_and_finalise().is_err());
        assert!(builder().set_min_amount(200_000).validate_and_finalise().is_err());
        assert!(OfferBuilder::new().validate_and_finalise().is_err());
    }

    #[test]
    fn account_hash_depends_on_salt() {
        let a = PaymentAccount::new(PaymentMethod::Sepa, "Alice", vec![1]);
        let b = PaymentAccount::new(PaymentMethod::Sepa, "Alice", vec![2]);

        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn bsq_swap_offers_never_use_v5() {
        let offer = builder()
            .set_payment_method(PaymentMethod::BsqSwap)
            .use_v5_protocol(true)
            .validate_and_finalise()
            .unwrap();

        assert!(offer.is_bsq_swap());
        assert!(!offer.use_v5_protocol);
    }
}
