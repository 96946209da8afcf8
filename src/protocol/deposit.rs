//! Deposit and payout protocol tasks, classic and v5 variants.
//!
//! Every step is a [`DepositStep`] run against a [`TradeModel`]. Which steps
//! run for a given message or action is decided by [`tasks_for_message`] and
//! [`tasks_for_action`] from the trade's role, state and protocol variant.
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::account_age;
use crate::error::{TradeError, ValidationError};
use crate::message::{
    DepositTxPublishedMessage, PayDepositRequest, Payload, PaymentStartedMessage,
    PayoutTxPublishedMessage, PreparedTxSignaturesRequest, PreparedTxSignaturesResponse,
    PublishDepositTxRequest,
};
use crate::messaging::SendOutcome;
use crate::offer::{security_deposit, trade_fee};
use crate::task::{Step, TaskModel, TaskOutcome};
use crate::trade::{Contract, Phase, SignedContract, Trade, TradeState};
use crate::types::{Coin, Direction, NodeAddress, PubKeyRing, TradeId, TxId};
use crate::utils;
use crate::wallet::{AddressPurpose, PreparedTx, TxKind, TxRequest, check_unconfirmed_limit};

use super::{ServiceProvider, TradeModel};

/// Local events and user actions that start a task sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    TakeOffer,
    DepositConfirmed,
    PaymentStarted,
    PaymentReceived,
}

impl TradeAction {
    pub fn label(self) -> &'static str {
        match self {
            TradeAction::TakeOffer => "take_offer",
            TradeAction::DepositConfirmed => "deposit_confirmed",
            TradeAction::PaymentStarted => "payment_started",
            TradeAction::PaymentReceived => "payment_received",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositStep {
    CreateTakerFeeTx,
    CreateMultisigKey,
    SendPayDepositRequest,

    ApplyFilter,
    ProcessPayDepositRequest,
    VerifyPeerAccountAge,
    CreateContract,
    CreateDepositTx,
    SendPublishDepositTxRequest,

    ProcessPublishDepositTxRequest,
    SignContract,
    CreatePreparedTxs,
    SendPreparedTxSignaturesRequest,
    ProcessPreparedTxSignaturesRequest,
    SignDepositTx,
    SendPreparedTxSignaturesResponse,
    ProcessPreparedTxSignaturesResponse,
    SignAndPublishDepositTx,
    SendDepositTxPublishedMessage,
    ProcessDepositTxPublishedMessage,

    SetDepositConfirmed,

    BuyerSignPayoutTx,
    SendPaymentStartedMessage,
    ProcessPaymentStartedMessage,
    SellerSignAndPublishPayoutTx,
    SendPayoutTxPublishedMessage,
    ProcessPayoutTxPublishedMessage,
    CompleteTrade,
}

pub fn tasks_for_action(trade: &Trade, action: TradeAction) -> Result<Vec<DepositStep>, TradeError> {
    use DepositStep::*;

    let state = trade.state();
    let allowed = match action {
        TradeAction::TakeOffer => !trade.is_maker() && state == TradeState::Preparation,
        TradeAction::DepositConfirmed => !state.is_terminal() && trade.phase() >= Phase::DepositPublished,
        TradeAction::PaymentStarted => trade.is_buyer() && trade.phase() == Phase::DepositConfirmed,
        TradeAction::PaymentReceived => {
            !trade.is_buyer() && state == TradeState::SellerReceivedPaymentStartedMsg
        }
    };
    if !allowed {
        return Err(TradeError::InvalidTransition {
            trade_id: trade.id.clone(),
            from: state.to_string(),
            to: action.label().to_owned(),
        });
    }

    Ok(match action {
        TradeAction::TakeOffer => vec![CreateTakerFeeTx, CreateMultisigKey, SendPayDepositRequest],
        // the seller may already have moved on when the buyer's message came first
        TradeAction::DepositConfirmed if trade.phase() > Phase::DepositPublished => vec![],
        TradeAction::DepositConfirmed => vec![SetDepositConfirmed],
        TradeAction::PaymentStarted => vec![BuyerSignPayoutTx, SendPaymentStartedMessage],
        TradeAction::PaymentReceived => {
            vec![SellerSignAndPublishPayoutTx, SendPayoutTxPublishedMessage, CompleteTrade]
        }
    })
}

pub fn tasks_for_message(trade: &Trade, payload: &Payload) -> Result<Vec<DepositStep>, TradeError> {
    use DepositStep::*;
    use TradeState::*;

    let state = trade.state();
    let maker = trade.is_maker();
    let v5 = trade.offer.use_v5_protocol;
    let tasks = match payload {
        Payload::PayDepositRequest(_) if maker && state == Preparation => vec![
            ApplyFilter,
            ProcessPayDepositRequest,
            VerifyPeerAccountAge,
            CreateMultisigKey,
            CreateContract,
            CreateDepositTx,
            SendPublishDepositTxRequest,
        ],
        Payload::PublishDepositTxRequest(_) if !maker && state == TakerPublishedTakerFeeTx => {
            let mut tasks = vec![
                ApplyFilter,
                ProcessPublishDepositTxRequest,
                VerifyPeerAccountAge,
                SignContract,
            ];
            if v5 {
                tasks.extend([CreatePreparedTxs, SendPreparedTxSignaturesRequest]);
            } else {
                tasks.extend([SignAndPublishDepositTx, SendDepositTxPublishedMessage]);
            }
            tasks
        }
        Payload::PreparedTxSignaturesRequest(_)
            if maker
                && v5
                && matches!(
                    state,
                    MakerSentPublishDepositTxRequest
                        | MakerSawArrivedPublishDepositTxRequest
                        | MakerStoredInMailboxPublishDepositTxRequest
                ) =>
        {
            vec![
                CreatePreparedTxs,
                ProcessPreparedTxSignaturesRequest,
                SignDepositTx,
                SendPreparedTxSignaturesResponse,
            ]
        }
        Payload::PreparedTxSignaturesResponse(_)
            if !maker && v5 && state == TakerSentPreparedTxSignatures =>
        {
            vec![
                ProcessPreparedTxSignaturesResponse,
                SignAndPublishDepositTx,
                SendDepositTxPublishedMessage,
            ]
        }
        Payload::DepositTxPublished(_) if maker && deposit_publish_expected(state, v5) => {
            vec![ProcessDepositTxPublishedMessage]
        }
        Payload::PaymentStarted(_)
            if !trade.is_buyer()
                && matches!(trade.phase(), Phase::DepositPublished | Phase::DepositConfirmed) =>
        {
            vec![ProcessPaymentStartedMessage]
        }
        Payload::PayoutTxPublished(_) if trade.is_buyer() && trade.phase() == Phase::FiatSent => {
            vec![ProcessPayoutTxPublishedMessage, CompleteTrade]
        }
        other => {
            return Err(TradeError::UnexpectedMessage {
                message: other.kind(),
                state: state.to_string(),
            });
        }
    };
    Ok(tasks)
}

fn deposit_publish_expected(state: TradeState, v5: bool) -> bool {
    use TradeState::*;
    if state == MakerSawDepositTxInWallet {
        true
    } else if v5 {
        state == MakerSentPreparedTxSignatures
    } else {
        matches!(
            state,
            MakerSentPublishDepositTxRequest
                | MakerSawArrivedPublishDepositTxRequest
                | MakerStoredInMailboxPublishDepositTxRequest
        )
    }
}

#[async_trait]
impl Step<TradeModel> for DepositStep {
    fn name(&self) -> &'static str {
        use DepositStep::*;
        match self {
            CreateTakerFeeTx => "create_taker_fee_tx",
            CreateMultisigKey => "create_multisig_key",
            SendPayDepositRequest => "send_pay_deposit_request",
            ApplyFilter => "apply_filter",
            ProcessPayDepositRequest => "process_pay_deposit_request",
            VerifyPeerAccountAge => "verify_peer_account_age",
            CreateContract => "create_contract",
            CreateDepositTx => "create_deposit_tx",
            SendPublishDepositTxRequest => "send_publish_deposit_tx_request",
            ProcessPublishDepositTxRequest => "process_publish_deposit_tx_request",
            SignContract => "sign_contract",
            CreatePreparedTxs => "create_prepared_txs",
            SendPreparedTxSignaturesRequest => "send_prepared_tx_signatures_request",
            ProcessPreparedTxSignaturesRequest => "process_prepared_tx_signatures_request",
            SignDepositTx => "sign_deposit_tx",
            SendPreparedTxSignaturesResponse => "send_prepared_tx_signatures_response",
            ProcessPreparedTxSignaturesResponse => "process_prepared_tx_signatures_response",
            SignAndPublishDepositTx => "sign_and_publish_deposit_tx",
            SendDepositTxPublishedMessage => "send_deposit_tx_published_message",
            ProcessDepositTxPublishedMessage => "process_deposit_tx_published_message",
            SetDepositConfirmed => "set_deposit_confirmed",
            BuyerSignPayoutTx => "buyer_sign_payout_tx",
            SendPaymentStartedMessage => "send_payment_started_message",
            ProcessPaymentStartedMessage => "process_payment_started_message",
            SellerSignAndPublishPayoutTx => "seller_sign_and_publish_payout_tx",
            SendPayoutTxPublishedMessage => "send_payout_tx_published_message",
            ProcessPayoutTxPublishedMessage => "process_payout_tx_published_message",
            CompleteTrade => "complete_trade",
        }
    }

    async fn run(self, model: &mut TradeModel, outcome: &mut TaskOutcome) {
        use DepositStep::*;
        let result = match self {
            CreateTakerFeeTx => create_taker_fee_tx(model).await,
            CreateMultisigKey => create_multisig_key(model),
            SendPayDepositRequest => send_pay_deposit_request(model).await,
            ApplyFilter => apply_filter(model),
            ProcessPayDepositRequest => process_pay_deposit_request(model),
            VerifyPeerAccountAge => verify_peer_account_age(model),
            CreateContract => create_contract(model),
            CreateDepositTx => create_deposit_tx(model),
            SendPublishDepositTxRequest => send_publish_deposit_tx_request(model).await,
            ProcessPublishDepositTxRequest => process_publish_deposit_tx_request(model),
            SignContract => sign_contract(model),
            CreatePreparedTxs => create_prepared_txs(model),
            SendPreparedTxSignaturesRequest => send_prepared_tx_signatures_request(model).await,
            ProcessPreparedTxSignaturesRequest => process_prepared_tx_signatures_request(model),
            SignDepositTx => sign_deposit_tx(model),
            SendPreparedTxSignaturesResponse => send_prepared_tx_signatures_response(model).await,
            ProcessPreparedTxSignaturesResponse => process_prepared_tx_signatures_response(model),
            SignAndPublishDepositTx => sign_and_publish_deposit_tx(model).await,
            SendDepositTxPublishedMessage => send_deposit_tx_published_message(model).await,
            ProcessDepositTxPublishedMessage => process_deposit_tx_published_message(model),
            SetDepositConfirmed => model.trade.set_state(TradeState::DepositConfirmedInBlockChain),
            BuyerSignPayoutTx => buyer_sign_payout_tx(model),
            SendPaymentStartedMessage => send_payment_started_message(model).await,
            ProcessPaymentStartedMessage => process_payment_started_message(model),
            SellerSignAndPublishPayoutTx => seller_sign_and_publish_payout_tx(model).await,
            SendPayoutTxPublishedMessage => send_payout_tx_published_message(model).await,
            ProcessPayoutTxPublishedMessage => process_payout_tx_published_message(model),
            CompleteTrade => model.trade.set_state(TradeState::Completed),
        };
        let _ = outcome.settle(result);
    }
}

// SECTION: helpers

/// Clone the payload of the message being processed, or fail the task.
macro_rules! expect_payload {
    ($model:expr, $variant:ident) => {
        match $model.message.as_ref().map(|envelope| &envelope.payload) {
            Some(Payload::$variant(m)) => m.clone(),
            _ => return Err(ValidationError::MissingField(stringify!($variant)).into()),
        }
    };
}

fn require<T: Clone>(value: &Option<T>, field: &'static str) -> Result<T, TradeError> {
    value
        .clone()
        .ok_or_else(|| ValidationError::MissingField(field).into())
}

/// Data the account-age signature of the taker commits to.
pub fn fee_proof_data(trade_id: &TradeId, fee_tx_id: &TxId) -> Vec<u8> {
    utils::hash_parts(&[
        b"account_age_fee_tx",
        trade_id.as_str().as_bytes(),
        fee_tx_id.as_str().as_bytes(),
    ])
}

/// Data the account-age signature of the maker commits to.
pub fn deposit_proof_data(trade_id: &TradeId, deposit_tx_id: &TxId) -> Vec<u8> {
    utils::hash_parts(&[
        b"account_age_deposit_tx",
        trade_id.as_str().as_bytes(),
        deposit_tx_id.as_str().as_bytes(),
    ])
}

fn deposit_amount(amount: Coin) -> Coin {
    Coin(amount.sats() + 2 * security_deposit(amount).sats())
}

fn multisig_keys(trade: &Trade) -> Result<Vec<Vec<u8>>, TradeError> {
    let mine = require(&trade.process_model.multisig_key, "multisig key")?.pub_key;
    let peer = require(&trade.process_model.peer.multisig_pub_key, "peer multisig key")?;
    Ok(if trade.is_maker() {
        vec![mine, peer]
    } else {
        vec![peer, mine]
    })
}

fn deposit_request(trade: &Trade) -> Result<TxRequest, TradeError> {
    Ok(TxRequest::new(TxKind::Deposit, trade.id.clone(), deposit_amount(trade.amount)).keys(multisig_keys(trade)?))
}

fn contract_terms(trade: &Trade) -> Result<&Contract, TradeError> {
    trade
        .contract
        .as_ref()
        .map(|c| &c.terms)
        .ok_or_else(|| ValidationError::MissingField("contract").into())
}

fn buyer_payout_address(contract: &Contract) -> &str {
    match contract.offer_direction {
        Direction::Buy => &contract.maker_payout_address,
        Direction::Sell => &contract.taker_payout_address,
    }
}

fn seller_payout_address(contract: &Contract) -> &str {
    match contract.offer_direction {
        Direction::Buy => &contract.taker_payout_address,
        Direction::Sell => &contract.maker_payout_address,
    }
}

fn payout_request(trade: &Trade) -> Result<TxRequest, TradeError> {
    let contract = contract_terms(trade)?;
    let deposit = require(&trade.process_model.prepared_deposit_tx, "deposit tx")?;
    Ok(TxRequest::new(TxKind::Payout, trade.id.clone(), deposit_amount(contract.amount))
        .keys(vec![
            contract.maker_multisig_pub_key.clone(),
            contract.taker_multisig_pub_key.clone(),
        ])
        .parent(deposit.id)
        .lock_time_ms(contract.payout_delay_ms)
        .outputs(vec![
            buyer_payout_address(contract).to_owned(),
            seller_payout_address(contract).to_owned(),
        ]))
}

/// Warning tx owned by the maker or the taker. Spends the deposit after the
/// max trade period, to the owner's payout address.
fn warning_request(trade: &Trade, owner_is_maker: bool) -> Result<TxRequest, TradeError> {
    let contract = contract_terms(trade)?;
    let deposit = require(&trade.process_model.prepared_deposit_tx, "deposit tx")?;
    let owner_address = if owner_is_maker {
        &contract.maker_payout_address
    } else {
        &contract.taker_payout_address
    };
    Ok(TxRequest::new(TxKind::Warning, trade.id.clone(), deposit_amount(contract.amount))
        .keys(vec![
            contract.maker_multisig_pub_key.clone(),
            contract.taker_multisig_pub_key.clone(),
        ])
        .parent(deposit.id)
        .lock_time_ms(duration_ms(trade.max_trade_period()))
        .outputs(vec![owner_address.clone()]))
}

/// Redirect tx hands a published warning tx's funds to the refund agent.
fn redirect_request(trade: &Trade, warning: &PreparedTx) -> Result<TxRequest, TradeError> {
    let contract = contract_terms(trade)?;
    Ok(TxRequest::new(TxKind::Redirect, trade.id.clone(), deposit_amount(contract.amount))
        .keys(vec![
            contract.maker_multisig_pub_key.clone(),
            contract.taker_multisig_pub_key.clone(),
        ])
        .parent(warning.id.clone())
        .outputs(vec![contract.refund_agent.to_string()]))
}

fn peer_prepared_txs(trade: &Trade, services: &ServiceProvider) -> Result<(PreparedTx, PreparedTx), TradeError> {
    let warning = services.wallet.build_tx(&warning_request(trade, !trade.is_maker())?)?;
    let redirect = services.wallet.build_tx(&redirect_request(trade, &warning)?)?;
    Ok((warning, redirect))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Delay both sides derive from the buyer's account age.
fn expected_payout_delay(trade: &Trade, services: &ServiceProvider) -> u64 {
    let buyer_age = if trade.is_buyer() {
        services
            .account_age
            .account_age_ms(&trade.process_model.payment_account.hash(), services.my_keys())
    } else {
        trade.process_model.peer.account_age_ms
    };
    duration_ms(account_age::payout_delay(
        trade.offer.direction,
        trade.offer.payment_method,
        buyer_age.map(Duration::from_millis),
    ))
}

struct Side {
    node: NodeAddress,
    keys: PubKeyRing,
    multisig: Vec<u8>,
    account_hash: Vec<u8>,
    payout_address: String,
}

fn build_contract(trade: &Trade, services: &ServiceProvider, payout_delay_ms: u64) -> Result<Contract, TradeError> {
    let pm = &trade.process_model;
    let mine = Side {
        node: services.my_address().clone(),
        keys: services.my_keys().clone(),
        multisig: require(&pm.multisig_key, "multisig key")?.pub_key,
        account_hash: pm.payment_account.hash(),
        payout_address: require(&pm.payout_address, "payout address")?,
    };
    let peer = Side {
        node: pm.peer.node.clone(),
        keys: pm.peer.pub_key_ring.clone(),
        multisig: require(&pm.peer.multisig_pub_key, "peer multisig key")?,
        account_hash: require(&pm.peer.payment_account_hash, "peer payment account")?,
        payout_address: require(&pm.peer.payout_address, "peer payout address")?,
    };
    let (maker, taker) = if trade.is_maker() { (mine, peer) } else { (peer, mine) };
    Ok(Contract {
        trade_id: trade.id.clone(),
        offer_id: trade.offer.id.clone(),
        amount: trade.amount,
        price: trade.price,
        offer_direction: trade.offer.direction,
        payment_method: trade.offer.payment_method,
        maker_node: maker.node,
        taker_node: taker.node,
        maker_pub_key_ring: maker.keys,
        taker_pub_key_ring: taker.keys,
        maker_multisig_pub_key: maker.multisig,
        taker_multisig_pub_key: taker.multisig,
        maker_payment_account_hash: maker.account_hash,
        taker_payment_account_hash: taker.account_hash,
        maker_payout_address: maker.payout_address,
        taker_payout_address: taker.payout_address,
        refund_agent: trade.refund_agent.clone().ok_or(TradeError::NoRefundAgent)?,
        payout_delay_ms,
        use_v5_protocol: trade.offer.use_v5_protocol,
    })
}

/// Sub-states a mailbox send moves the trade through.
struct ArrivalStates {
    sent: TradeState,
    arrived: TradeState,
    stored: TradeState,
    failed: TradeState,
}

const PUBLISH_DEPOSIT_TX_REQUEST: ArrivalStates = ArrivalStates {
    sent: TradeState::MakerSentPublishDepositTxRequest,
    arrived: TradeState::MakerSawArrivedPublishDepositTxRequest,
    stored: TradeState::MakerStoredInMailboxPublishDepositTxRequest,
    failed: TradeState::MakerSendFailedPublishDepositTxRequest,
};

const DEPOSIT_TX_PUBLISHED: ArrivalStates = ArrivalStates {
    sent: TradeState::TakerSentDepositTxPublishedMsg,
    arrived: TradeState::TakerSawArrivedDepositTxPublishedMsg,
    stored: TradeState::TakerStoredInMailboxDepositTxPublishedMsg,
    failed: TradeState::TakerSendFailedDepositTxPublishedMsg,
};

const PAYMENT_STARTED: ArrivalStates = ArrivalStates {
    sent: TradeState::BuyerSentPaymentStartedMsg,
    arrived: TradeState::BuyerSawArrivedPaymentStartedMsg,
    stored: TradeState::BuyerStoredInMailboxPaymentStartedMsg,
    failed: TradeState::BuyerSendFailedPaymentStartedMsg,
};

const PAYOUT_TX_PUBLISHED: ArrivalStates = ArrivalStates {
    sent: TradeState::SellerSentPayoutTxPublishedMsg,
    arrived: TradeState::SellerSawArrivedPayoutTxPublishedMsg,
    stored: TradeState::SellerStoredInMailboxPayoutTxPublishedMsg,
    failed: TradeState::SellerSendFailedPayoutTxPublishedMsg,
};

/// The "sent" state is persisted before the message leaves.
async fn send_with_states(model: &mut TradeModel, payload: Payload, states: ArrivalStates) -> Result<(), TradeError> {
    model.trade.set_state(states.sent)?;
    model.request_persistence();
    let services = model.services.clone();
    let peer = model.trade.process_model.peer.clone();
    match services
        .dispatcher
        .send_mailbox_message(&peer.node, &peer.pub_key_ring, payload)
        .await
    {
        Ok(SendOutcome::Arrived) => model.trade.set_state(states.arrived),
        Ok(SendOutcome::StoredInMailbox) => model.trade.set_state(states.stored),
        Err(e) => {
            model.trade.set_state(states.failed)?;
            Err(e)
        }
    }
}

async fn send_to_peer(model: &TradeModel, payload: Payload) -> Result<(), TradeError> {
    let peer = &model.trade.process_model.peer;
    model
        .services
        .dispatcher
        .send_mailbox_message(&peer.node, &peer.pub_key_ring, payload)
        .await
        .map(|_| ())
}

// SECTION: taker start

async fn create_taker_fee_tx(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    check_unconfirmed_limit(services.wallet.as_ref(), services.config.max_unconfirmed_own_txs)?;
    let trade = &mut model.trade;
    let tx = services
        .wallet
        .build_tx(&TxRequest::new(TxKind::TradeFee, trade.id.clone(), trade_fee(trade.amount)))?;
    let tx_id = services.wallet.broadcast(&tx, &[]).await?;
    info!(trade_id = %trade.id.short(), %tx_id, "taker fee tx published");
    trade.process_model.fee_tx_id = Some(tx_id);
    trade.set_state(TradeState::TakerPublishedTakerFeeTx)
}

fn create_multisig_key(model: &mut TradeModel) -> Result<(), TradeError> {
    let wallet = &model.services.wallet;
    let trade = &mut model.trade;
    let multisig = wallet.key_entry(&trade.id, AddressPurpose::MultiSig)?;
    let payout = wallet.key_entry(&trade.id, AddressPurpose::TradePayout)?;
    trade.process_model.multisig_key = Some(multisig);
    trade.process_model.payout_address = Some(payout.address);
    Ok(())
}

async fn send_pay_deposit_request(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let trade = &model.trade;
    let pm = &trade.process_model;
    let fee_tx_id = require(&pm.fee_tx_id, "taker fee tx")?;
    let request = PayDepositRequest {
        trade_id: trade.id.clone(),
        offer_id: trade.offer.id.clone(),
        amount: trade.amount,
        price: trade.price,
        account_age_signature: services.key_ring.sign(&fee_proof_data(&trade.id, &fee_tx_id)),
        taker_fee_tx_id: fee_tx_id,
        multisig_pub_key: require(&pm.multisig_key, "multisig key")?.pub_key,
        payment_account_hash: pm.payment_account.hash(),
        payment_method: pm.payment_account.payment_method,
        payout_address: require(&pm.payout_address, "payout address")?,
        refund_agent: trade.refund_agent.clone().ok_or(TradeError::NoRefundAgent)?,
    };
    services
        .dispatcher
        .send_direct(&pm.peer.node, &pm.peer.pub_key_ring, Payload::PayDepositRequest(request))
        .await
}

// SECTION: maker, deposit preparation

fn apply_filter(model: &mut TradeModel) -> Result<(), TradeError> {
    let peer = &model.trade.process_model.peer;
    let account_hash = match model.message.as_ref().map(|envelope| &envelope.payload) {
        Some(Payload::PayDepositRequest(m)) => Some(m.payment_account_hash.clone()),
        Some(Payload::PublishDepositTxRequest(m)) => Some(m.payment_account_hash.clone()),
        _ => peer.payment_account_hash.clone(),
    };
    model
        .services
        .filter
        .check_peer(&peer.node, account_hash.as_deref())?;
    Ok(())
}

fn process_pay_deposit_request(model: &mut TradeModel) -> Result<(), TradeError> {
    let m = expect_payload!(model, PayDepositRequest);
    if model.services.refund_agents.get(&m.refund_agent).is_none() {
        return Err(TradeError::NoRefundAgent);
    }
    let trade = &mut model.trade;
    if m.offer_id != trade.offer.id {
        return Err(ValidationError::StaleOfferId {
            expected: trade.offer.id.clone(),
            got: m.offer_id,
        }
        .into());
    }
    if m.amount < trade.offer.min_amount || m.amount > trade.offer.amount {
        return Err(ValidationError::InvalidOffer("amount outside the offer range").into());
    }
    if m.price != trade.offer.price {
        return Err(ValidationError::InvalidOffer("price does not match the offer").into());
    }
    if m.payment_method != trade.offer.payment_method {
        return Err(ValidationError::InvalidOffer("payment method does not match the offer").into());
    }

    trade.amount = m.amount;
    trade.refund_agent = Some(m.refund_agent);
    let peer = &mut trade.process_model.peer;
    peer.multisig_pub_key = Some(m.multisig_pub_key);
    peer.payment_account_hash = Some(m.payment_account_hash);
    peer.payment_method = Some(m.payment_method);
    peer.account_age_signature = Some(m.account_age_signature);
    peer.payout_address = Some(m.payout_address);
    peer.fee_tx_id = Some(m.taker_fee_tx_id);
    Ok(())
}

fn verify_peer_account_age(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let trade = &mut model.trade;
    let peer = &trade.process_model.peer;
    let data = if trade.is_maker() {
        fee_proof_data(&trade.id, &require(&peer.fee_tx_id, "peer fee tx")?)
    } else {
        let deposit = require(&trade.process_model.prepared_deposit_tx, "deposit tx")?;
        deposit_proof_data(&trade.id, &deposit.id)
    };
    let signature = require(&peer.account_age_signature, "account age signature")?;
    if !services.key_ring.verify(&peer.pub_key_ring, &data, &signature) {
        return Err(ValidationError::InvalidSignature("account age witness").into());
    }
    let account_hash = require(&peer.payment_account_hash, "peer payment account")?;
    let age = services.account_age.account_age_ms(&account_hash, &peer.pub_key_ring);
    trade.process_model.peer.account_age_ms = age;
    Ok(())
}

fn create_contract(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let trade = &mut model.trade;
    let delay_ms = expected_payout_delay(trade, &services);
    let terms = build_contract(trade, &services, delay_ms)?;
    let hash = terms.hash()?;
    let maker_signature = services.key_ring.sign(&hash);
    info!(trade_id = %trade.id.short(), payout_delay_ms = delay_ms, "contract created");
    trade.contract = Some(SignedContract {
        terms,
        hash,
        maker_signature,
        taker_signature: None,
    });
    Ok(())
}

fn create_deposit_tx(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    check_unconfirmed_limit(services.wallet.as_ref(), services.config.max_unconfirmed_own_txs)?;
    let trade = &mut model.trade;
    let tx = services.wallet.build_tx(&deposit_request(trade)?)?;
    if !trade.offer.use_v5_protocol {
        let key = require(&trade.process_model.multisig_key, "multisig key")?;
        trade.process_model.deposit_signature = Some(services.wallet.sign_tx(&key, &tx)?);
    }
    trade.process_model.prepared_deposit_tx = Some(tx);
    Ok(())
}

async fn send_publish_deposit_tx_request(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let trade = &model.trade;
    let pm = &trade.process_model;
    let contract = trade
        .contract
        .clone()
        .ok_or(ValidationError::MissingField("contract"))?;
    let tx = require(&pm.prepared_deposit_tx, "deposit tx")?;
    let request = PublishDepositTxRequest {
        trade_id: trade.id.clone(),
        multisig_pub_key: require(&pm.multisig_key, "multisig key")?.pub_key,
        payment_account_hash: pm.payment_account.hash(),
        payment_method: pm.payment_account.payment_method,
        account_age_signature: services.key_ring.sign(&deposit_proof_data(&trade.id, &tx.id)),
        contract_signature: contract.maker_signature,
        prepared_deposit_tx: tx,
        maker_deposit_signature: pm.deposit_signature.clone(),
        payout_address: require(&pm.payout_address, "payout address")?,
        payout_delay_ms: contract.terms.payout_delay_ms,
        maker_fee_tx_id: trade.offer.maker_fee_tx_id.clone(),
    };
    send_with_states(
        model,
        Payload::PublishDepositTxRequest(request),
        PUBLISH_DEPOSIT_TX_REQUEST,
    )
    .await
}

// SECTION: taker, contract and deposit

fn process_publish_deposit_tx_request(model: &mut TradeModel) -> Result<(), TradeError> {
    let m = expect_payload!(model, PublishDepositTxRequest);
    let services = model.services.clone();
    let trade = &mut model.trade;
    if m.payment_method != trade.offer.payment_method {
        return Err(ValidationError::InvalidOffer("payment method does not match the offer").into());
    }
    if trade.offer.use_v5_protocol != m.maker_deposit_signature.is_none() {
        return Err(ValidationError::TxMismatch("deposit signature does not match the protocol variant").into());
    }

    let peer = &mut trade.process_model.peer;
    peer.multisig_pub_key = Some(m.multisig_pub_key);
    peer.payment_account_hash = Some(m.payment_account_hash);
    peer.payment_method = Some(m.payment_method);
    peer.account_age_signature = Some(m.account_age_signature);
    peer.contract_signature = Some(m.contract_signature);
    peer.deposit_signature = m.maker_deposit_signature;
    peer.payout_address = Some(m.payout_address);
    peer.fee_tx_id = m.maker_fee_tx_id;

    // the deposit must lock funds into our 2-of-2
    let expected = services.wallet.build_tx(&deposit_request(trade)?)?;
    if expected.id != m.prepared_deposit_tx.id {
        return Err(ValidationError::TxMismatch("deposit tx does not match the agreed terms").into());
    }
    trade.process_model.prepared_deposit_tx = Some(m.prepared_deposit_tx);
    trade.set_state(TradeState::TakerReceivedPublishDepositTxRequest)
}

fn sign_contract(model: &mut TradeModel) -> Result<(), TradeError> {
    let m = expect_payload!(model, PublishDepositTxRequest);
    let services = model.services.clone();
    let trade = &mut model.trade;
    if m.payout_delay_ms != expected_payout_delay(trade, &services) {
        return Err(ValidationError::TxMismatch("payout delay").into());
    }
    let terms = build_contract(trade, &services, m.payout_delay_ms)?;
    let hash = terms.hash()?;
    if !services
        .key_ring
        .verify(&trade.process_model.peer.pub_key_ring, &hash, &m.contract_signature)
    {
        return Err(ValidationError::InvalidSignature("contract").into());
    }
    let taker_signature = services.key_ring.sign(&hash);
    trade.contract = Some(SignedContract {
        terms,
        hash,
        maker_signature: m.contract_signature,
        taker_signature: Some(taker_signature),
    });
    Ok(())
}

fn create_prepared_txs(model: &mut TradeModel) -> Result<(), TradeError> {
    let wallet = &model.services.wallet;
    let trade = &mut model.trade;
    let warning = wallet.build_tx(&warning_request(trade, trade.is_maker())?)?;
    let redirect = wallet.build_tx(&redirect_request(trade, &warning)?)?;
    let fee_bump = wallet.key_entry(&trade.id, AddressPurpose::FeeBump)?;
    let pm = &mut trade.process_model;
    pm.warning_tx = Some(warning);
    pm.redirect_tx = Some(redirect);
    pm.fee_bump_address = Some(fee_bump.address);
    Ok(())
}

/// Our signatures on the peer's warning and redirect txs.
fn sign_peer_prepared_txs(model: &TradeModel) -> Result<(Vec<u8>, Vec<u8>), TradeError> {
    let services = &model.services;
    let trade = &model.trade;
    let (warning, redirect) = peer_prepared_txs(trade, services)?;
    let key = require(&trade.process_model.multisig_key, "multisig key")?;
    Ok((
        services.wallet.sign_tx(&key, &warning)?,
        services.wallet.sign_tx(&key, &redirect)?,
    ))
}

/// Check the peer's signatures on our own warning and redirect txs.
fn verify_prepared_signatures(model: &TradeModel, warning_sig: &[u8], redirect_sig: &[u8]) -> Result<(), TradeError> {
    let wallet = &model.services.wallet;
    let pm = &model.trade.process_model;
    let peer_key = require(&pm.peer.multisig_pub_key, "peer multisig key")?;
    let warning = require(&pm.warning_tx, "warning tx")?;
    let redirect = require(&pm.redirect_tx, "redirect tx")?;
    if !wallet.verify_tx_signature(&peer_key, &warning, warning_sig) {
        return Err(ValidationError::InvalidSignature("warning tx").into());
    }
    if !wallet.verify_tx_signature(&peer_key, &redirect, redirect_sig) {
        return Err(ValidationError::InvalidSignature("redirect tx").into());
    }
    Ok(())
}

async fn send_prepared_tx_signatures_request(model: &mut TradeModel) -> Result<(), TradeError> {
    let (warning_signature, redirect_signature) = sign_peer_prepared_txs(model)?;
    let trade = &mut model.trade;
    let request = PreparedTxSignaturesRequest {
        trade_id: trade.id.clone(),
        warning_signature,
        redirect_signature,
        fee_bump_address: require(&trade.process_model.fee_bump_address, "fee bump address")?,
    };
    trade.set_state(TradeState::TakerSentPreparedTxSignatures)?;
    model.request_persistence();
    send_to_peer(model, Payload::PreparedTxSignaturesRequest(request)).await
}

fn process_prepared_tx_signatures_request(model: &mut TradeModel) -> Result<(), TradeError> {
    let m = expect_payload!(model, PreparedTxSignaturesRequest);
    verify_prepared_signatures(model, &m.warning_signature, &m.redirect_signature)?;
    let peer = &mut model.trade.process_model.peer;
    peer.warning_signature = Some(m.warning_signature);
    peer.redirect_signature = Some(m.redirect_signature);
    peer.fee_bump_address = Some(m.fee_bump_address);
    Ok(())
}

fn sign_deposit_tx(model: &mut TradeModel) -> Result<(), TradeError> {
    let wallet = &model.services.wallet;
    let pm = &mut model.trade.process_model;
    let key = require(&pm.multisig_key, "multisig key")?;
    let tx = require(&pm.prepared_deposit_tx, "deposit tx")?;
    pm.deposit_signature = Some(wallet.sign_tx(&key, &tx)?);
    Ok(())
}

async fn send_prepared_tx_signatures_response(model: &mut TradeModel) -> Result<(), TradeError> {
    let (warning_signature, redirect_signature) = sign_peer_prepared_txs(model)?;
    let trade = &mut model.trade;
    let pm = &trade.process_model;
    let response = PreparedTxSignaturesResponse {
        trade_id: trade.id.clone(),
        warning_signature,
        redirect_signature,
        deposit_signature: require(&pm.deposit_signature, "deposit signature")?,
        fee_bump_address: require(&pm.fee_bump_address, "fee bump address")?,
    };
    trade.set_state(TradeState::MakerSentPreparedTxSignatures)?;
    model.request_persistence();
    send_to_peer(model, Payload::PreparedTxSignaturesResponse(response)).await
}

fn process_prepared_tx_signatures_response(model: &mut TradeModel) -> Result<(), TradeError> {
    let m = expect_payload!(model, PreparedTxSignaturesResponse);
    verify_prepared_signatures(model, &m.warning_signature, &m.redirect_signature)?;
    let trade = &mut model.trade;
    let peer = &mut trade.process_model.peer;
    peer.warning_signature = Some(m.warning_signature);
    peer.redirect_signature = Some(m.redirect_signature);
    peer.fee_bump_address = Some(m.fee_bump_address);
    peer.deposit_signature = Some(m.deposit_signature);
    trade.set_state(TradeState::TakerReceivedPreparedTxSignatures)
}

async fn sign_and_publish_deposit_tx(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let trade = &mut model.trade;
    let pm = &trade.process_model;
    let tx = require(&pm.prepared_deposit_tx, "deposit tx")?;
    let maker_signature = require(&pm.peer.deposit_signature, "maker deposit signature")?;
    let peer_key = require(&pm.peer.multisig_pub_key, "peer multisig key")?;
    if !services.wallet.verify_tx_signature(&peer_key, &tx, &maker_signature) {
        return Err(ValidationError::InvalidSignature("deposit tx").into());
    }
    // v5: never publish without a way to recover the funds unilaterally
    if trade.offer.use_v5_protocol
        && (pm.warning_tx.is_none()
            || pm.peer.warning_signature.is_none()
            || pm.peer.redirect_signature.is_none())
    {
        return Err(ValidationError::MissingField("prepared tx signatures").into());
    }

    let key = require(&pm.multisig_key, "multisig key")?;
    let taker_signature = services.wallet.sign_tx(&key, &tx)?;
    let tx_id = services
        .wallet
        .broadcast(&tx, &[maker_signature, taker_signature.clone()])
        .await?;
    info!(trade_id = %trade.id.short(), %tx_id, "deposit tx published");
    trade.process_model.deposit_signature = Some(taker_signature);
    trade.process_model.deposit_tx_id = Some(tx_id);
    trade.set_state(TradeState::TakerPublishedDepositTx)
}

async fn send_deposit_tx_published_message(model: &mut TradeModel) -> Result<(), TradeError> {
    let trade = &model.trade;
    let contract = trade
        .contract
        .as_ref()
        .ok_or(ValidationError::MissingField("contract"))?;
    let message = DepositTxPublishedMessage {
        trade_id: trade.id.clone(),
        deposit_tx_id: require(&trade.process_model.deposit_tx_id, "deposit tx id")?,
        contract_signature: require(&contract.taker_signature, "taker contract signature")?,
    };
    send_with_states(model, Payload::DepositTxPublished(message), DEPOSIT_TX_PUBLISHED).await
}

fn process_deposit_tx_published_message(model: &mut TradeModel) -> Result<(), TradeError> {
    let m = expect_payload!(model, DepositTxPublished);
    let services = model.services.clone();
    let trade = &mut model.trade;
    let tx = require(&trade.process_model.prepared_deposit_tx, "deposit tx")?;
    if m.deposit_tx_id != tx.id {
        return Err(ValidationError::TxMismatch("published deposit tx id").into());
    }
    let peer_keys = trade.process_model.peer.pub_key_ring.clone();
    let contract = trade
        .contract
        .as_mut()
        .ok_or(ValidationError::MissingField("contract"))?;
    if !services.key_ring.verify(&peer_keys, &contract.hash, &m.contract_signature) {
        return Err(ValidationError::InvalidSignature("contract").into());
    }
    contract.taker_signature = Some(m.contract_signature.clone());
    trade.process_model.peer.contract_signature = Some(m.contract_signature);
    trade.process_model.deposit_tx_id = Some(m.deposit_tx_id);
    trade.set_state(TradeState::MakerReceivedDepositTxPublishedMsg)
}

// SECTION: payout

fn buyer_sign_payout_tx(model: &mut TradeModel) -> Result<(), TradeError> {
    let wallet = &model.services.wallet;
    let trade = &mut model.trade;
    trade.set_state(TradeState::BuyerConfirmedPaymentInitiated)?;
    let tx = wallet.build_tx(&payout_request(trade)?)?;
    let key = require(&trade.process_model.multisig_key, "multisig key")?;
    let signature = wallet.sign_tx(&key, &tx)?;
    trade.process_model.payout_tx = Some(tx);
    trade.process_model.payout_signature = Some(signature);
    Ok(())
}

async fn send_payment_started_message(model: &mut TradeModel) -> Result<(), TradeError> {
    let trade = &model.trade;
    let message = PaymentStartedMessage {
        trade_id: trade.id.clone(),
        payout_signature: require(&trade.process_model.payout_signature, "payout signature")?,
        payout_address: require(&trade.process_model.payout_address, "payout address")?,
    };
    send_with_states(model, Payload::PaymentStarted(message), PAYMENT_STARTED).await
}

fn process_payment_started_message(model: &mut TradeModel) -> Result<(), TradeError> {
    let m = expect_payload!(model, PaymentStarted);
    let wallet = &model.services.wallet;
    let trade = &mut model.trade;
    if m.payout_address != buyer_payout_address(contract_terms(trade)?) {
        return Err(ValidationError::TxMismatch("buyer payout address").into());
    }
    let tx = wallet.build_tx(&payout_request(trade)?)?;
    let peer_key = require(&trade.process_model.peer.multisig_pub_key, "peer multisig key")?;
    if !wallet.verify_tx_signature(&peer_key, &tx, &m.payout_signature) {
        return Err(ValidationError::InvalidSignature("payout tx").into());
    }
    trade.process_model.payout_tx = Some(tx);
    trade.process_model.peer.payout_signature = Some(m.payout_signature);
    trade.set_state(TradeState::SellerReceivedPaymentStartedMsg)
}

async fn seller_sign_and_publish_payout_tx(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let trade = &mut model.trade;
    trade.set_state(TradeState::SellerConfirmedPaymentReceipt)?;
    let pm = &trade.process_model;
    let tx = require(&pm.payout_tx, "payout tx")?;
    let buyer_signature = require(&pm.peer.payout_signature, "buyer payout signature")?;
    let key = require(&pm.multisig_key, "multisig key")?;
    let seller_signature = services.wallet.sign_tx(&key, &tx)?;
    let tx_id = services
        .wallet
        .broadcast(&tx, &[buyer_signature, seller_signature.clone()])
        .await?;
    info!(trade_id = %trade.id.short(), %tx_id, "payout tx published");
    trade.process_model.payout_signature = Some(seller_signature);
    trade.process_model.payout_tx_id = Some(tx_id);
    trade.set_state(TradeState::SellerPublishedPayoutTx)
}

async fn send_payout_tx_published_message(model: &mut TradeModel) -> Result<(), TradeError> {
    let trade = &model.trade;
    let message = PayoutTxPublishedMessage {
        trade_id: trade.id.clone(),
        payout_tx_id: require(&trade.process_model.payout_tx_id, "payout tx id")?,
    };
    send_with_states(model, Payload::PayoutTxPublished(message), PAYOUT_TX_PUBLISHED).await
}

fn process_payout_tx_published_message(model: &mut TradeModel) -> Result<(), TradeError> {
    let m = expect_payload!(model, PayoutTxPublished);
    let trade = &mut model.trade;
    let tx = require(&trade.process_model.payout_tx, "payout tx")?;
    if m.payout_tx_id != tx.id {
        return Err(ValidationError::TxMismatch("published payout tx id").into());
    }
    trade.process_model.payout_tx_id = Some(m.payout_tx_id);
    trade.set_state(TradeState::BuyerReceivedPayoutTxPublishedMsg)
}
