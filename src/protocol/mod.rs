//! Protocol drivers and the per-trade protocol front end.
//!
//! [`TradeProtocol`] owns one [`Trade`] and turns incoming messages and user
//! actions into task sequences. Failures before the deposit is published
//! fail the trade; failures after it open a dispute.
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::capabilities::Capabilities;
use crate::config::EngineConfig;
use crate::error::{ConfigError, TradeError, ValidationError};
use crate::filter::Filter;
use crate::mailbox::MailboxStore;
use crate::message::{NetworkEnvelope, Payload};
use crate::messaging::{MessageDispatcher, MessagingPort};
use crate::persistence::PersistenceHandle;
use crate::task::{CancelFlag, RunOutcome, Step, TaskFailure, TaskModel, TaskRunner};
use crate::trade::{DisputeState, Phase, Trade, TradePeriodState, TradeState};
use crate::types::{NodeAddress, PubKeyRing, TimeStamp, TxId};
use crate::wallet::{AccountAgeWitnessPort, KeyRing, WalletPort};

pub mod availability;
pub mod bsq_swap;
pub mod deposit;
pub mod dispute;
pub mod placement;

use deposit::TradeAction;
use dispute::{Dispute, RefundAgentRegistry};

/// External collaborators a node is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub wallet: Arc<dyn WalletPort>,
    pub key_ring: Arc<dyn KeyRing>,
    pub account_age: Arc<dyn AccountAgeWitnessPort>,
    pub messaging: Arc<dyn MessagingPort>,
    pub mailbox: Arc<dyn MailboxStore>,
}

/// Shared, read-only services every protocol of a node uses.
pub struct ServiceProvider {
    pub config: Arc<EngineConfig>,
    pub filter: Filter,
    pub refund_agents: RefundAgentRegistry,
    pub capabilities: Capabilities,
    pub wallet: Arc<dyn WalletPort>,
    pub key_ring: Arc<dyn KeyRing>,
    pub account_age: Arc<dyn AccountAgeWitnessPort>,
    pub dispatcher: MessageDispatcher,
    pub persistence: PersistenceHandle,
}

impl ServiceProvider {
    pub fn new(
        config: EngineConfig,
        my_address: NodeAddress,
        collaborators: Collaborators,
        persistence: PersistenceHandle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let dispatcher = MessageDispatcher::new(
            collaborators.messaging,
            collaborators.mailbox,
            my_address,
            collaborators.key_ring.pub_key_ring(),
            config.protocol_version,
            config.mailbox_ttl(),
        );
        Ok(Self {
            filter: config.filter(),
            refund_agents: config.refund_agents()?,
            capabilities: config.advertised_capabilities()?,
            config: Arc::new(config),
            wallet: collaborators.wallet,
            key_ring: collaborators.key_ring,
            account_age: collaborators.account_age,
            dispatcher,
            persistence,
        })
    }

    pub fn my_address(&self) -> &NodeAddress {
        self.dispatcher.my_address()
    }

    pub fn my_keys(&self) -> &PubKeyRing {
        self.dispatcher.my_keys()
    }

    /// Version enforcement, done before any task sees the envelope.
    pub fn check_envelope(&self, envelope: &NetworkEnvelope) -> Result<(), ValidationError> {
        self.filter.check_version(envelope.protocol_version).inspect_err(|e| {
            warn!(sender = %envelope.sender, message = envelope.payload.kind(), error = %e, "rejected envelope");
        })
    }
}

/// Model the deposit and dispute tasks run against.
pub struct TradeModel {
    pub trade: Trade,
    pub services: Arc<ServiceProvider>,
    /// Message being processed by the current sequence.
    pub message: Option<NetworkEnvelope>,
    pub dispute_reason: Option<String>,
    pub dispute: Option<Dispute>,
}

impl TradeModel {
    pub fn new(trade: Trade, services: Arc<ServiceProvider>) -> Self {
        Self {
            trade,
            services,
            message: None,
            dispute_reason: None,
            dispute: None,
        }
    }
}

impl TaskModel for TradeModel {
    fn request_persistence(&mut self) {
        let persistence = &self.services.persistence;
        match self.trade.archive_record_name() {
            Some(archive) => {
                persistence.request_remove(self.trade.record_name());
                persistence.request_persistence(archive, &self.trade);
            }
            None => persistence.request_persistence(self.trade.record_name(), &self.trade),
        }
    }
}

pub struct TradeProtocol {
    model: TradeModel,
    cancel: CancelFlag,
}

impl TradeProtocol {
    pub fn new(trade: Trade, services: Arc<ServiceProvider>, cancel: CancelFlag) -> Self {
        Self {
            model: TradeModel::new(trade, services),
            cancel,
        }
    }

    pub fn trade(&self) -> &Trade {
        &self.model.trade
    }

    pub fn request_persistence(&mut self) {
        self.model.request_persistence();
    }

    /// Run the task sequence for a local event or user action.
    pub async fn perform(&mut self, action: TradeAction) -> Result<(), TradeError> {
        let tasks = deposit::tasks_for_action(&self.model.trade, action)?;
        self.run_sequence(action.label(), tasks).await.map(|_| ())
    }

    pub async fn handle_message(&mut self, envelope: NetworkEnvelope) -> Result<(), TradeError> {
        self.model.services.check_envelope(&envelope)?;
        let kind = envelope.payload.kind();
        if self.model.trade.process_model.is_processed(&envelope.uid) {
            debug!(trade_id = %self.model.trade.id.short(), message = kind, uid = %envelope.uid, "message already processed");
            return Ok(());
        }

        if matches!(
            envelope.payload,
            Payload::PeerOpenedDispute(_) | Payload::DisputeResult(_)
        ) {
            return self.handle_dispute_message(envelope);
        }

        if envelope.sender_pub_key_ring != self.model.trade.process_model.peer.pub_key_ring {
            warn!(trade_id = %self.model.trade.id.short(), message = kind, sender = %envelope.sender, "message not from trading peer");
            return Err(ValidationError::SenderMismatch.into());
        }

        let tasks = deposit::tasks_for_message(&self.model.trade, &envelope.payload)?;
        let uid = envelope.uid.clone();
        info!(trade_id = %self.model.trade.id.short(), message = kind, %uid, "received trade message");
        self.model.message = Some(envelope);
        let result = self.run_sequence(kind, tasks).await;
        self.model.message = None;

        if let Ok(true) = result {
            self.model.trade.process_model.mark_processed(uid);
            self.model.request_persistence();
        }
        result.map(|_| ())
    }

    /// Wallet event for the deposit tx. Moves a trade that never got the
    /// taker's DepositTxPublishedMessage to the deposit phase, and on to
    /// confirmed once `confirmed` is set.
    pub fn on_deposit_tx_seen(&mut self, tx_id: &TxId, confirmed: bool) -> Result<(), TradeError> {
        let trade = &mut self.model.trade;
        let expected = trade.process_model.prepared_deposit_tx.as_ref().map(|tx| &tx.id);
        if expected != Some(tx_id) {
            return Err(ValidationError::TxMismatch("deposit tx seen in wallet").into());
        }
        if trade.state().is_terminal() {
            return Ok(());
        }
        if trade.process_model.deposit_tx_id.is_none() {
            info!(trade_id = %trade.id.short(), %tx_id, confirmed, "deposit tx seen in wallet");
            trade.process_model.deposit_tx_id = Some(tx_id.clone());
        }
        if trade.phase() < Phase::DepositPublished {
            trade.set_state(TradeState::MakerSawDepositTxInWallet)?;
        }
        if confirmed && trade.phase() == Phase::DepositPublished {
            trade.set_state(TradeState::DepositConfirmedInBlockChain)?;
        }
        self.model.request_persistence();
        Ok(())
    }

    /// Advance the trade period; escalate once it is over without a payout.
    pub async fn check_trade_period(&mut self, now: TimeStamp<Utc>) -> Result<(), TradeError> {
        let trade = &mut self.model.trade;
        if trade.state().is_terminal() || !trade.is_deposit_published() || trade.is_payout_published() {
            return Ok(());
        }
        let period = trade.update_period_state(&now);
        self.model.request_persistence();
        if period == TradePeriodState::TradePeriodOver && !self.model.trade.dispute_state().is_open() {
            warn!(trade_id = %self.model.trade.id.short(), "trade period is over without payout");
            return self.open_dispute("Trade period is over without payout").await;
        }
        Ok(())
    }

    pub async fn open_dispute(&mut self, reason: &str) -> Result<(), TradeError> {
        let trade = &self.model.trade;
        if !trade.is_deposit_committed() {
            return Err(TradeError::DisputeNotAllowed(trade.phase()));
        }
        if trade.dispute_state() != DisputeState::NoDispute || trade.state().is_terminal() {
            info!(trade_id = %trade.id.short(), dispute = ?trade.dispute_state(), "dispute already handled");
            return Ok(());
        }

        self.model.dispute_reason = Some(reason.to_owned());
        let label = format!("open_dispute/{}", trade.id.short());
        let mut runner = TaskRunner::new(label);
        runner.add_tasks(dispute::open_dispute_tasks());
        let outcome = runner.run(&mut self.model).await;
        self.model.dispute_reason = None;

        match outcome {
            Ok(RunOutcome::Completed) | Ok(RunOutcome::Cancelled) => Ok(()),
            Ok(RunOutcome::Failed(TaskFailure { task, reason })) => {
                error!(trade_id = %self.model.trade.id.short(), task, %reason, "opening dispute failed");
                self.model
                    .trade
                    .append_error_message(&format!("Opening dispute failed at {task}: {reason}"));
                self.model.request_persistence();
                Err(TradeError::TaskFailed { task, reason })
            }
            Err(violation) => Err(self.on_violation(violation.into())),
        }
    }

    fn handle_dispute_message(&mut self, envelope: NetworkEnvelope) -> Result<(), TradeError> {
        let trade = &mut self.model.trade;
        match &envelope.payload {
            Payload::PeerOpenedDispute(m) => {
                if envelope.sender_pub_key_ring != trade.process_model.peer.pub_key_ring {
                    return Err(ValidationError::SenderMismatch.into());
                }
                if trade.dispute_state() == DisputeState::NoDispute {
                    info!(trade_id = %trade.id.short(), agent = %m.refund_agent, reason = %m.reason, "peer opened dispute");
                    trade.set_dispute_state(DisputeState::RefundRequestStartedByPeer);
                }
            }
            Payload::DisputeResult(m) => {
                let agent = trade
                    .refund_agent
                    .as_ref()
                    .and_then(|node| self.model.services.refund_agents.get(node))
                    .ok_or(TradeError::NoRefundAgent)?;
                if agent.pub_key_ring != envelope.sender_pub_key_ring {
                    return Err(ValidationError::SenderMismatch.into());
                }
                info!(trade_id = %trade.id.short(), buyer = %m.buyer_payout, seller = %m.seller_payout, "dispute closed by refund agent");
                trade.set_dispute_state(DisputeState::RefundRequestClosed);
                trade.set_state(TradeState::DisputeClosed)?;
                dispute::close_dispute_record(&self.model.services, m);
            }
            other => {
                return Err(TradeError::UnexpectedMessage {
                    message: other.kind(),
                    state: trade.state().to_string(),
                });
            }
        }
        self.model.trade.process_model.mark_processed(envelope.uid);
        self.model.request_persistence();
        Ok(())
    }

    /// Returns whether the sequence ran to completion (`false` when cancelled).
    async fn run_sequence<S>(&mut self, label: &str, tasks: Vec<S>) -> Result<bool, TradeError>
    where
        S: Step<TradeModel>,
    {
        self.cancel.reset();
        let mut runner = TaskRunner::new(format!("{label}/{}", self.model.trade.id.short()))
            .with_cancel_flag(self.cancel.clone());
        runner.add_tasks(tasks);
        match runner.run(&mut self.model).await {
            Ok(RunOutcome::Completed) => Ok(true),
            Ok(RunOutcome::Cancelled) => {
                info!(trade_id = %self.model.trade.id.short(), label, "task sequence cancelled");
                Ok(false)
            }
            Ok(RunOutcome::Failed(failure)) => Err(self.on_failure(failure).await),
            Err(violation) => Err(self.on_violation(violation.into())),
        }
    }

    async fn on_failure(&mut self, failure: TaskFailure) -> TradeError {
        let TaskFailure { task, reason } = failure;
        let trade = &mut self.model.trade;
        trade.append_error_message(&format!("{task}: {reason}"));

        if trade.is_payout_published() {
            warn!(trade_id = %trade.id.short(), task, %reason, "task failed after payout");
        } else if trade.is_deposit_published() {
            error!(trade_id = %trade.id.short(), task, %reason, "task failed after deposit, opening dispute");
            self.model.request_persistence();
            if let Err(e) = self.open_dispute(&reason).await {
                error!(trade_id = %self.model.trade.id.short(), error = %e, "escalation to dispute failed");
            }
        } else if !trade.state().is_terminal() {
            let at = trade.phase();
            if let Err(e) = trade.set_state(TradeState::Failed(at)) {
                error!(trade_id = %trade.id.short(), error = %e, "could not mark trade failed");
            }
        }
        self.model.request_persistence();
        TradeError::TaskFailed { task, reason }
    }

    fn on_violation(&mut self, error: TradeError) -> TradeError {
        error!(trade_id = %self.model.trade.id.short(), %error, "task pipeline invariant violated");
        self.model.trade.append_error_message(&error.to_string());
        self.model.request_persistence();
        error
    }
}
