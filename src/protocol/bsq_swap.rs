//! Atomic BSQ swap: both parties contribute inputs to one transaction, so no
//! funds are ever locked and there is nothing to dispute.
//!
//! All messages go direct. A send that does not arrive fails the swap, unless
//! the swap tx is already published.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{TradeError, ValidationError};
use crate::message::{BsqSwapFinalizedMessage, BsqSwapInputsResponse, BsqSwapTakeRequest, NetworkEnvelope, Payload};
use crate::offer::Offer;
use crate::task::{RunOutcome, Step, TaskModel, TaskOutcome, TaskRunner};
use crate::trade::TradeRole;
use crate::types::{Coin, NodeAddress, Price, PubKeyRing, TimeStamp, TradeId, TxId, Uid};
use crate::wallet::{AddressPurpose, KeyEntry, PreparedTx, TxKind, TxRequest};

use super::ServiceProvider;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BsqSwapState {
    #[n(0)]
    Preparation,
    #[n(1)]
    TakerSentTakeRequest,
    #[n(2)]
    MakerSentInputs,
    #[n(3)]
    TxPublished,
    #[n(4)]
    Completed,
    #[n(5)]
    Failed,
}

impl BsqSwapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BsqSwapState::Completed | BsqSwapState::Failed)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct BsqSwapTrade {
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
    pub peer_node: NodeAddress,
    #[n(6)]
    pub peer_pub_key_ring: PubKeyRing,
    #[n(7)]
    state: BsqSwapState,
    #[n(8)]
    error_message: Option<String>,
    #[n(9)]
    pub my_inputs: Vec<Vec<u8>>,
    #[n(10)]
    pub peer_inputs: Vec<Vec<u8>>,
    #[n(11)]
    pub my_receive_address: Option<String>,
    #[n(12)]
    pub peer_receive_address: Option<String>,
    #[n(13)]
    pub swap_key: Option<KeyEntry>,
    #[n(14)]
    pub peer_swap_pub_key: Option<Vec<u8>>,
    #[n(15)]
    pub swap_tx: Option<PreparedTx>,
    #[n(16)]
    pub maker_signature: Option<Vec<u8>>,
    #[n(17)]
    pub tx_id: Option<TxId>,
    #[n(18)]
    pub processed_uids: Vec<Uid>,
    #[n(19)]
    pub created_at: TimeStamp<Utc>,
}

impl BsqSwapTrade {
    pub fn new(
        id: TradeId,
        offer: Offer,
        role: TradeRole,
        amount: Coin,
        peer_node: NodeAddress,
        peer_pub_key_ring: PubKeyRing,
    ) -> Self {
        Self {
            id,
            price: offer.price,
            offer,
            role,
            amount,
            peer_node,
            peer_pub_key_ring,
            state: BsqSwapState::Preparation,
            error_message: None,
            my_inputs: Vec::new(),
            peer_inputs: Vec::new(),
            my_receive_address: None,
            peer_receive_address: None,
            swap_key: None,
            peer_swap_pub_key: None,
            swap_tx: None,
            maker_signature: None,
            tx_id: None,
            processed_uids: Vec::new(),
            created_at: TimeStamp::new(),
        }
    }

    pub fn state(&self) -> BsqSwapState {
        self.state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_maker(&self) -> bool {
        self.role == TradeRole::Maker
    }

    pub fn record_name(&self) -> String {
        format!("bsq_swap_{}", self.id)
    }

    pub fn archive_record_name(&self) -> Option<String> {
        match self.state {
            BsqSwapState::Completed => Some(format!("closed_{}", self.id)),
            BsqSwapState::Failed => Some(format!("failed_{}", self.id)),
            _ => None,
        }
    }

    pub fn set_state(&mut self, next: BsqSwapState) -> Result<(), TradeError> {
        if self.state == next {
            return Ok(());
        }
        if self.state.is_terminal() || (next != BsqSwapState::Failed && next < self.state) {
            return Err(TradeError::InvalidTransition {
                trade_id: self.id.clone(),
                from: format!("{:?}", self.state),
                to: format!("{next:?}"),
            });
        }
        info!(trade_id = %self.id.short(), from = ?self.state, to = ?next, "bsq swap state changed");
        self.state = next;
        Ok(())
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

    /// Flag the swap failed. A finished swap stays finished.
    pub fn fail(&mut self, reason: &str) {
        self.append_error_message(reason);
        if !self.state.is_terminal() {
            self.state = BsqSwapState::Failed;
        }
    }

    fn maker_swap_pub_key(&self) -> Option<Vec<u8>> {
        if self.is_maker() {
            self.swap_key.as_ref().map(|k| k.pub_key.clone())
        } else {
            self.peer_swap_pub_key.clone()
        }
    }
}

pub struct BsqSwapModel {
    pub swap: BsqSwapTrade,
    pub services: Arc<ServiceProvider>,
    pub message: Option<NetworkEnvelope>,
}

impl TaskModel for BsqSwapModel {
    fn request_persistence(&mut self) {
        let persistence = &self.services.persistence;
        match self.swap.archive_record_name() {
            Some(archive) => {
                persistence.request_remove(self.swap.record_name());
                persistence.request_persistence(archive, &self.swap);
            }
            None => persistence.request_persistence(self.swap.record_name(), &self.swap),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsqSwapStep {
    ApplyFilter,
    CreateSwapInputs,
    SendTakeRequest,
    ProcessTakeRequest,
    CreateSwapTx,
    SendInputsResponse,
    ProcessInputsResponse,
    PublishSwapTx,
    SendFinalizedMessage,
    ProcessFinalizedMessage,
    CompleteSwap,
}

#[async_trait]
impl Step<BsqSwapModel> for BsqSwapStep {
    fn name(&self) -> &'static str {
        match self {
            BsqSwapStep::ApplyFilter => "apply_filter",
            BsqSwapStep::CreateSwapInputs => "create_swap_inputs",
            BsqSwapStep::SendTakeRequest => "send_bsq_swap_take_request",
            BsqSwapStep::ProcessTakeRequest => "process_bsq_swap_take_request",
            BsqSwapStep::CreateSwapTx => "create_swap_tx",
            BsqSwapStep::SendInputsResponse => "send_bsq_swap_inputs_response",
            BsqSwapStep::ProcessInputsResponse => "process_bsq_swap_inputs_response",
            BsqSwapStep::PublishSwapTx => "publish_swap_tx",
            BsqSwapStep::SendFinalizedMessage => "send_bsq_swap_finalized_message",
            BsqSwapStep::ProcessFinalizedMessage => "process_bsq_swap_finalized_message",
            BsqSwapStep::CompleteSwap => "complete_swap",
        }
    }

    async fn run(self, model: &mut BsqSwapModel, outcome: &mut TaskOutcome) {
        let result = match self {
            BsqSwapStep::ApplyFilter => model
                .services
                .filter
                .check_node(&model.swap.peer_node)
                .map_err(TradeError::from),
            BsqSwapStep::CreateSwapInputs => create_swap_inputs(model),
            BsqSwapStep::SendTakeRequest => send_take_request(model).await,
            BsqSwapStep::ProcessTakeRequest => process_take_request(model),
            BsqSwapStep::CreateSwapTx => create_swap_tx(model),
            BsqSwapStep::SendInputsResponse => send_inputs_response(model).await,
            BsqSwapStep::ProcessInputsResponse => process_inputs_response(model),
            BsqSwapStep::PublishSwapTx => publish_swap_tx(model).await,
            BsqSwapStep::SendFinalizedMessage => send_finalized_message(model).await,
            BsqSwapStep::ProcessFinalizedMessage => process_finalized_message(model),
            BsqSwapStep::CompleteSwap => model.swap.set_state(BsqSwapState::Completed),
        };
        let _ = outcome.settle(result);
    }
}

fn missing(field: &'static str) -> TradeError {
    ValidationError::MissingField(field).into()
}

fn swap_tx_request(swap: &BsqSwapTrade) -> Result<TxRequest, TradeError> {
    let maker_key = swap.maker_swap_pub_key().ok_or_else(|| missing("maker swap key"))?;
    let mine = swap.my_receive_address.clone().ok_or_else(|| missing("receive address"))?;
    let peer = swap
        .peer_receive_address
        .clone()
        .ok_or_else(|| missing("peer receive address"))?;
    let (maker_inputs, taker_inputs, maker_out, taker_out) = if swap.is_maker() {
        (&swap.my_inputs, &swap.peer_inputs, mine, peer)
    } else {
        (&swap.peer_inputs, &swap.my_inputs, peer, mine)
    };
    Ok(TxRequest::new(TxKind::BsqSwap, swap.id.clone(), swap.amount)
        .keys(vec![maker_key])
        .inputs(maker_inputs.iter().chain(taker_inputs).cloned().collect())
        .outputs(vec![maker_out, taker_out]))
}

/// Direct send. On a fault the swap is flagged failed and persisted before the
/// task fails. Once the swap tx is published the fault is only recorded.
async fn send_swap_message(model: &mut BsqSwapModel, payload: Payload) -> Result<(), TradeError> {
    let services = model.services.clone();
    let result = services
        .dispatcher
        .send_direct(&model.swap.peer_node, &model.swap.peer_pub_key_ring, payload)
        .await;
    let Err(e) = result else {
        return Ok(());
    };
    let swap = &mut model.swap;
    if matches!(swap.state(), BsqSwapState::TxPublished | BsqSwapState::Completed) {
        warn!(trade_id = %swap.id.short(), error = %e, "peer missed swap message, swap tx is already published");
        swap.append_error_message(&e.to_string());
        model.request_persistence();
        return Ok(());
    }
    swap.fail(&e.to_string());
    model.request_persistence();
    Err(e)
}

fn create_swap_inputs(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let wallet = &model.services.wallet;
    let swap = &mut model.swap;
    swap.my_inputs = wallet.swap_inputs(&swap.id, swap.amount)?;
    let key = wallet.key_entry(&swap.id, AddressPurpose::BsqSwap)?;
    swap.my_receive_address = Some(key.address.clone());
    swap.swap_key = Some(key);
    Ok(())
}

async fn send_take_request(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let swap = &mut model.swap;
    let request = BsqSwapTakeRequest {
        trade_id: swap.id.clone(),
        offer_id: swap.offer.id.clone(),
        amount: swap.amount,
        price: swap.price,
        inputs: swap.my_inputs.clone(),
        receive_address: swap.my_receive_address.clone().ok_or_else(|| missing("receive address"))?,
    };
    swap.set_state(BsqSwapState::TakerSentTakeRequest)?;
    send_swap_message(model, Payload::BsqSwapTakeRequest(request)).await
}

fn process_take_request(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let Some(Payload::BsqSwapTakeRequest(m)) = model.message.as_ref().map(|e| e.payload.clone()) else {
        return Err(missing("BsqSwapTakeRequest"));
    };
    let swap = &mut model.swap;
    if m.offer_id != swap.offer.id {
        return Err(ValidationError::StaleOfferId {
            expected: swap.offer.id.clone(),
            got: m.offer_id,
        }
        .into());
    }
    if m.amount < swap.offer.min_amount || m.amount > swap.offer.amount {
        return Err(ValidationError::InvalidOffer("amount outside the offer range").into());
    }
    if m.price != swap.offer.price {
        return Err(ValidationError::InvalidOffer("price does not match the offer").into());
    }
    if m.inputs.is_empty() {
        return Err(missing("taker inputs"));
    }
    swap.amount = m.amount;
    swap.peer_inputs = m.inputs;
    swap.peer_receive_address = Some(m.receive_address);
    Ok(())
}

fn create_swap_tx(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let wallet = &model.services.wallet;
    let swap = &mut model.swap;
    let tx = wallet.build_tx(&swap_tx_request(swap)?)?;
    let key = swap.swap_key.clone().ok_or_else(|| missing("swap key"))?;
    swap.maker_signature = Some(wallet.sign_tx(&key, &tx)?);
    swap.swap_tx = Some(tx);
    Ok(())
}

async fn send_inputs_response(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let swap = &mut model.swap;
    let response = BsqSwapInputsResponse {
        trade_id: swap.id.clone(),
        inputs: swap.my_inputs.clone(),
        receive_address: swap.my_receive_address.clone().ok_or_else(|| missing("receive address"))?,
        signature: swap.maker_signature.clone().ok_or_else(|| missing("maker signature"))?,
        pub_key: swap.swap_key.as_ref().map(|k| k.pub_key.clone()).ok_or_else(|| missing("swap key"))?,
    };
    swap.set_state(BsqSwapState::MakerSentInputs)?;
    send_swap_message(model, Payload::BsqSwapInputsResponse(response)).await
}

fn process_inputs_response(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let Some(Payload::BsqSwapInputsResponse(m)) = model.message.as_ref().map(|e| e.payload.clone()) else {
        return Err(missing("BsqSwapInputsResponse"));
    };
    let wallet = &model.services.wallet;
    let swap = &mut model.swap;
    if m.inputs.is_empty() {
        return Err(missing("maker inputs"));
    }
    swap.peer_inputs = m.inputs;
    swap.peer_receive_address = Some(m.receive_address);
    swap.peer_swap_pub_key = Some(m.pub_key.clone());
    let tx = wallet.build_tx(&swap_tx_request(swap)?)?;
    if !wallet.verify_tx_signature(&m.pub_key, &tx, &m.signature) {
        return Err(ValidationError::InvalidSignature("bsq swap tx").into());
    }
    swap.maker_signature = Some(m.signature);
    swap.swap_tx = Some(tx);
    Ok(())
}

async fn publish_swap_tx(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let swap = &mut model.swap;
    let tx = swap.swap_tx.clone().ok_or_else(|| missing("swap tx"))?;
    let maker_signature = swap.maker_signature.clone().ok_or_else(|| missing("maker signature"))?;
    let key = swap.swap_key.clone().ok_or_else(|| missing("swap key"))?;
    let taker_signature = services.wallet.sign_tx(&key, &tx)?;
    let tx_id = services
        .wallet
        .broadcast(&tx, &[maker_signature, taker_signature])
        .await?;
    info!(trade_id = %swap.id.short(), %tx_id, "bsq swap tx published");
    swap.tx_id = Some(tx_id);
    swap.set_state(BsqSwapState::TxPublished)
}

async fn send_finalized_message(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let message = BsqSwapFinalizedMessage {
        trade_id: model.swap.id.clone(),
        tx_id: model.swap.tx_id.clone().ok_or_else(|| missing("swap tx id"))?,
    };
    send_swap_message(model, Payload::BsqSwapFinalized(message)).await
}

fn process_finalized_message(model: &mut BsqSwapModel) -> Result<(), TradeError> {
    let Some(Payload::BsqSwapFinalized(m)) = model.message.as_ref().map(|e| e.payload.clone()) else {
        return Err(missing("BsqSwapFinalizedMessage"));
    };
    let swap = &mut model.swap;
    let tx = swap.swap_tx.as_ref().ok_or_else(|| missing("swap tx"))?;
    if m.tx_id != tx.id {
        return Err(ValidationError::TxMismatch("published swap tx id").into());
    }
    swap.tx_id = Some(m.tx_id);
    swap.set_state(BsqSwapState::TxPublished)
}

/// Drives one swap. Callers serialize access per swap.
pub struct BsqSwapProtocol {
    model: BsqSwapModel,
}

impl BsqSwapProtocol {
    pub fn new(swap: BsqSwapTrade, services: Arc<ServiceProvider>) -> Self {
        Self {
            model: BsqSwapModel {
                swap,
                services,
                message: None,
            },
        }
    }

    pub fn swap(&self) -> &BsqSwapTrade {
        &self.model.swap
    }

    /// Taker side: lock in inputs and send the take request.
    pub async fn take(&mut self) -> Result<(), TradeError> {
        if self.model.swap.is_maker() || self.model.swap.state() != BsqSwapState::Preparation {
            return Err(TradeError::InvalidTransition {
                trade_id: self.model.swap.id.clone(),
                from: format!("{:?}", self.model.swap.state()),
                to: "take".into(),
            });
        }
        self.run_sequence(
            "bsq_swap_take",
            vec![
                BsqSwapStep::ApplyFilter,
                BsqSwapStep::CreateSwapInputs,
                BsqSwapStep::SendTakeRequest,
            ],
        )
        .await
    }

    pub async fn handle_message(&mut self, envelope: NetworkEnvelope) -> Result<(), TradeError> {
        self.model.services.check_envelope(&envelope)?;
        let swap = &self.model.swap;
        if swap.processed_uids.contains(&envelope.uid) {
            debug!(trade_id = %swap.id.short(), uid = %envelope.uid, "message already processed");
            return Ok(());
        }
        if envelope.sender_pub_key_ring != swap.peer_pub_key_ring {
            return Err(ValidationError::SenderMismatch.into());
        }

        let state = swap.state();
        let tasks = match &envelope.payload {
            Payload::BsqSwapTakeRequest(_) if swap.is_maker() && state == BsqSwapState::Preparation => vec![
                BsqSwapStep::ApplyFilter,
                BsqSwapStep::ProcessTakeRequest,
                BsqSwapStep::CreateSwapInputs,
                BsqSwapStep::CreateSwapTx,
                BsqSwapStep::SendInputsResponse,
            ],
            Payload::BsqSwapInputsResponse(_)
                if !swap.is_maker() && state == BsqSwapState::TakerSentTakeRequest =>
            {
                vec![
                    BsqSwapStep::ProcessInputsResponse,
                    BsqSwapStep::PublishSwapTx,
                    BsqSwapStep::SendFinalizedMessage,
                    BsqSwapStep::CompleteSwap,
                ]
            }
            Payload::BsqSwapFinalized(_) if swap.is_maker() && state == BsqSwapState::MakerSentInputs => {
                vec![BsqSwapStep::ProcessFinalizedMessage, BsqSwapStep::CompleteSwap]
            }
            other => {
                return Err(TradeError::UnexpectedMessage {
                    message: other.kind(),
                    state: format!("{state:?}"),
                });
            }
        };

        let uid = envelope.uid.clone();
        let kind = envelope.payload.kind();
        self.model.message = Some(envelope);
        let result = self.run_sequence(kind, tasks).await;
        self.model.message = None;
        if result.is_ok() {
            self.model.swap.processed_uids.push(uid);
            self.model.request_persistence();
        }
        result
    }

    async fn run_sequence(&mut self, label: &str, tasks: Vec<BsqSwapStep>) -> Result<(), TradeError> {
        let mut runner = TaskRunner::new(format!("{label}/{}", self.model.swap.id.short()));
        runner.add_tasks(tasks);
        match runner.run(&mut self.model).await? {
            RunOutcome::Completed | RunOutcome::Cancelled => Ok(()),
            RunOutcome::Failed(failure) => {
                warn!(trade_id = %self.model.swap.id.short(), task = failure.task, reason = %failure.reason, "bsq swap failed");
                if !self.model.swap.state().is_terminal() {
                    self.model.swap.fail(&format!("{}: {}", failure.task, failure.reason));
                }
                self.model.request_persistence();
                Err(TradeError::TaskFailed {
                    task: failure.task,
                    reason: failure.reason,
                })
            }
        }
    }
}
