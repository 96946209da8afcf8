//! One task per trade. Every event that touches a trade goes through its
//! queue, so task sequences of the same trade never overlap.
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::error::TradeError;
use crate::message::NetworkEnvelope;
use crate::protocol::deposit::TradeAction;
use crate::protocol::{ServiceProvider, TradeProtocol};
use crate::task::CancelFlag;
use crate::trade::Trade;
use crate::types::{TimeStamp, TradeId, TxId};

type Reply = oneshot::Sender<Result<(), TradeError>>;

pub enum TradeEvent {
    Action(TradeAction, Reply),
    Message(NetworkEnvelope, Reply),
    TradePeriodCheck(TimeStamp<Utc>, Reply),
    DepositTxSeen { tx_id: TxId, confirmed: bool, reply: Reply },
    OpenDispute(String, Reply),
    RequestPersistence(Reply),
}

/// Cheap to clone; all clones talk to the same trade task.
#[derive(Clone)]
pub struct TradeHandle {
    id: TradeId,
    events: mpsc::UnboundedSender<TradeEvent>,
    state: watch::Receiver<Trade>,
    cancel: CancelFlag,
}

/// Start the task owning `trade`. Must be called inside a tokio runtime.
pub fn spawn(trade: Trade, services: Arc<ServiceProvider>) -> TradeHandle {
    let id = trade.id.clone();
    let cancel = CancelFlag::new();
    let (events, mut rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(trade.clone());
    let mut protocol = TradeProtocol::new(trade, services, cancel.clone());

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let (result, reply) = match event {
                TradeEvent::Action(action, reply) => (protocol.perform(action).await, reply),
                TradeEvent::Message(envelope, reply) => (protocol.handle_message(envelope).await, reply),
                TradeEvent::TradePeriodCheck(now, reply) => (protocol.check_trade_period(now).await, reply),
                TradeEvent::DepositTxSeen { tx_id, confirmed, reply } => {
                    (protocol.on_deposit_tx_seen(&tx_id, confirmed), reply)
                }
                TradeEvent::OpenDispute(reason, reply) => (protocol.open_dispute(&reason).await, reply),
                TradeEvent::RequestPersistence(reply) => {
                    protocol.request_persistence();
                    (Ok(()), reply)
                }
            };
            state_tx.send_replace(protocol.trade().clone());
            if reply.send(result).is_err() {
                debug!(trade_id = %protocol.trade().id.short(), "caller stopped waiting for trade event");
            }
        }
        info!(trade_id = %protocol.trade().id.short(), "trade task stopped");
    });

    TradeHandle {
        id,
        events,
        state,
        cancel,
    }
}

impl TradeHandle {
    pub fn id(&self) -> &TradeId {
        &self.id
    }

    /// Trade as of the last finished event.
    pub fn snapshot(&self) -> Trade {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Trade> {
        self.state.clone()
    }

    /// Wait until the trade satisfies `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&Trade) -> bool) -> Result<Trade, TradeError> {
        let mut state = self.state.clone();
        let trade = state
            .wait_for(|trade| predicate(trade))
            .await
            .map_err(|_| TradeError::CoordinatorGone(self.id.clone()))?;
        Ok(trade.clone())
    }

    pub async fn perform(&self, action: TradeAction) -> Result<(), TradeError> {
        self.request(|reply| TradeEvent::Action(action, reply)).await
    }

    pub async fn deliver(&self, envelope: NetworkEnvelope) -> Result<(), TradeError> {
        self.request(|reply| TradeEvent::Message(envelope, reply)).await
    }

    pub async fn confirm_deposit(&self) -> Result<(), TradeError> {
        self.perform(TradeAction::DepositConfirmed).await
    }

    /// The wallet saw the deposit tx, in a block when `confirmed`.
    pub async fn deposit_tx_seen(&self, tx_id: TxId, confirmed: bool) -> Result<(), TradeError> {
        self.request(|reply| TradeEvent::DepositTxSeen { tx_id, confirmed, reply }).await
    }

    pub async fn confirm_payment_started(&self) -> Result<(), TradeError> {
        self.perform(TradeAction::PaymentStarted).await
    }

    pub async fn confirm_payment_received(&self) -> Result<(), TradeError> {
        self.perform(TradeAction::PaymentReceived).await
    }

    pub async fn check_trade_period(&self, now: TimeStamp<Utc>) -> Result<(), TradeError> {
        self.request(|reply| TradeEvent::TradePeriodCheck(now, reply)).await
    }

    pub async fn open_dispute(&self, reason: impl Into<String>) -> Result<(), TradeError> {
        let reason = reason.into();
        self.request(|reply| TradeEvent::OpenDispute(reason, reply)).await
    }

    pub async fn request_persistence(&self) -> Result<(), TradeError> {
        self.request(TradeEvent::RequestPersistence).await
    }

    /// Stop the sequence currently running. Later events run normally.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn request(&self, event: impl FnOnce(Reply) -> TradeEvent) -> Result<(), TradeError> {
        let (reply, result) = oneshot::channel();
        self.events
            .send(event(reply))
            .map_err(|_| TradeError::CoordinatorGone(self.id.clone()))?;
        result
            .await
            .map_err(|_| TradeError::CoordinatorGone(self.id.clone()))?
    }
}
