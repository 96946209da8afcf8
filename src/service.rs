//! Node level entry point: owns open offers, running trades and swaps, and
//! routes every incoming envelope to the protocol it belongs to.
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::coordinator::{self, TradeHandle};
use crate::error::{AvailabilityError, PersistenceError, TradeError, ValidationError};
use crate::message::{DisputeResultMessage, NetworkEnvelope, Payload};
use crate::offer::{Offer, OfferState, PaymentAccount};
use crate::process_model::{ProcessModel, TradingPeer};
use crate::protocol::ServiceProvider;
use crate::protocol::availability::{self, AvailabilityHandle, AvailabilityOutcome, PendingRequests};
use crate::protocol::bsq_swap::{BsqSwapProtocol, BsqSwapTrade};
use crate::protocol::deposit::TradeAction;
use crate::protocol::dispute::Dispute;
use crate::protocol::placement::{self, OpenOffer};
use crate::trade::{Trade, TradeRole};
use crate::types::{Coin, NodeAddress, OfferId, PubKeyRing, TimeStamp, TradeId, TxId};
use crate::utils;

type SharedSwap = Arc<tokio::sync::Mutex<BsqSwapProtocol>>;

pub struct TradeManager {
    services: Arc<ServiceProvider>,
    open_offers: Mutex<HashMap<OfferId, OpenOffer>>,
    trades: Mutex<HashMap<TradeId, TradeHandle>>,
    bsq_swaps: Mutex<HashMap<TradeId, SharedSwap>>,
    pending_availability: PendingRequests,
    // only populated on refund agent nodes
    received_disputes: Mutex<HashMap<TradeId, Vec<Dispute>>>,
}

impl TradeManager {
    pub fn new(services: Arc<ServiceProvider>) -> Self {
        Self {
            services,
            open_offers: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
            bsq_swaps: Mutex::new(HashMap::new()),
            pending_availability: PendingRequests::default(),
            received_disputes: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<ServiceProvider> {
        &self.services
    }

    // SECTION: offers

    /// Pay the maker fee and publish the offer.
    pub async fn place_offer(&self, offer: Offer, payment_account: PaymentAccount) -> Result<Offer, TradeError> {
        let open = placement::place_offer(self.services.clone(), offer, payment_account).await?;
        let offer = open.offer.clone();
        self.open_offers.lock().insert(offer.id.clone(), open);
        info!(offer_id = %offer.id, "offer placed");
        Ok(offer)
    }

    pub fn open_offer(&self, offer_id: &OfferId) -> Option<OpenOffer> {
        self.open_offers.lock().get(offer_id).cloned()
    }

    /// Take the offer off the book. Trades already running are not affected.
    pub fn remove_offer(&self, offer_id: &OfferId) -> Result<(), TradeError> {
        let mut open = self
            .open_offers
            .lock()
            .remove(offer_id)
            .ok_or_else(|| TradeError::UnknownOffer(offer_id.clone()))?;
        open.offer.state = OfferState::Removed;
        self.services.persistence.request_remove(open.record_name());
        info!(%offer_id, "offer removed");
        Ok(())
    }

    fn mark_offer_taken(&self, offer_id: &OfferId) {
        if let Some(open) = self.open_offers.lock().get_mut(offer_id) {
            open.offer.state = OfferState::NotAvailable;
            self.services.persistence.request_persistence(open.record_name(), &*open);
        }
    }

    /// Ask the maker whether `offer` can still be taken.
    pub fn check_offer_availability(&self, offer: Offer) -> AvailabilityHandle {
        availability::check_offer_availability(self.services.clone(), &self.pending_availability, offer, None)
    }

    /// Like [`check_offer_availability`](Self::check_offer_availability), calling
    /// `on_error` once if the request fails or times out.
    pub fn check_offer_availability_with_handler(
        &self,
        offer: Offer,
        on_error: impl FnOnce(&AvailabilityError) + Send + 'static,
    ) -> AvailabilityHandle {
        availability::check_offer_availability(
            self.services.clone(),
            &self.pending_availability,
            offer,
            Some(Box::new(on_error)),
        )
    }

    // SECTION: trades

    /// Start a trade on an offer the maker confirmed as available.
    pub async fn take_offer(
        &self,
        available: AvailabilityOutcome,
        amount: Coin,
        payment_account: PaymentAccount,
    ) -> Result<TradeHandle, TradeError> {
        let offer = available.offer;
        if offer.is_bsq_swap() {
            return Err(ValidationError::InvalidOffer("bsq swap offers are taken with take_bsq_swap_offer").into());
        }
        if amount < offer.min_amount || amount > offer.amount {
            return Err(ValidationError::InvalidOffer("amount outside the offer range").into());
        }
        if payment_account.payment_method != offer.payment_method {
            return Err(ValidationError::InvalidOffer("payment account does not match the offer").into());
        }
        let peer = TradingPeer::new(offer.maker_node.clone(), offer.maker_pub_key_ring.clone());
        let mut trade = Trade::new(
            utils::new_trade_id(),
            offer,
            TradeRole::Taker,
            amount,
            peer.node.clone(),
            ProcessModel::new(peer, payment_account),
        );
        trade.refund_agent = Some(available.refund_agent);
        info!(trade_id = %trade.id.short(), offer_id = %trade.offer.id, %amount, "taking offer");

        let handle = coordinator::spawn(trade, self.services.clone());
        self.trades.lock().insert(handle.id().clone(), handle.clone());
        handle.perform(TradeAction::TakeOffer).await?;
        Ok(handle)
    }

    pub fn trade(&self, trade_id: &TradeId) -> Option<TradeHandle> {
        self.trades.lock().get(trade_id).cloned()
    }

    pub fn trades(&self) -> Vec<TradeHandle> {
        self.trades.lock().values().cloned().collect()
    }

    /// Run the trade period check on every running trade.
    pub async fn check_trade_periods(&self, now: TimeStamp<Utc>) {
        for handle in self.trades() {
            if let Err(e) = handle.check_trade_period(now.clone()).await {
                warn!(trade_id = %handle.id().short(), error = %e, "trade period check failed");
            }
        }
    }

    /// Wallet listener entry: `tx_id` showed up on chain. Returns whether a
    /// trade was waiting for it as its deposit tx.
    pub async fn on_deposit_tx_seen(&self, tx_id: &TxId, confirmed: bool) -> Result<bool, TradeError> {
        let waiting = self.trades().into_iter().find(|handle| {
            handle
                .snapshot()
                .process_model
                .prepared_deposit_tx
                .as_ref()
                .is_some_and(|tx| &tx.id == tx_id)
        });
        let Some(handle) = waiting else {
            debug!(%tx_id, "no trade waiting for tx");
            return Ok(false);
        };
        handle.deposit_tx_seen(tx_id.clone(), confirmed).await?;
        Ok(true)
    }

    /// Maker side: the first PayDepositRequest for a trade id creates the trade.
    async fn accept_take_request(&self, envelope: NetworkEnvelope) -> Result<(), TradeError> {
        let Payload::PayDepositRequest(request) = &envelope.payload else {
            return Err(ValidationError::MissingField("PayDepositRequest").into());
        };
        let open = self
            .open_offer(&request.offer_id)
            .ok_or_else(|| TradeError::UnknownOffer(request.offer_id.clone()))?;
        if open.offer.state != OfferState::Available || open.offer.is_bsq_swap() {
            return Err(ValidationError::InvalidOffer("offer can not be taken").into());
        }

        let handle = {
            let mut trades = self.trades.lock();
            match trades.entry(request.trade_id.clone()) {
                Entry::Occupied(existing) => existing.get().clone(),
                Entry::Vacant(slot) => {
                    let peer = TradingPeer::new(envelope.sender.clone(), envelope.sender_pub_key_ring.clone());
                    let trade = Trade::new(
                        request.trade_id.clone(),
                        open.offer.clone(),
                        TradeRole::Maker,
                        request.amount,
                        envelope.sender.clone(),
                        ProcessModel::new(peer, open.payment_account.clone()),
                    );
                    info!(trade_id = %trade.id.short(), offer_id = %trade.offer.id, taker = %envelope.sender, "offer taken");
                    slot.insert(coordinator::spawn(trade, self.services.clone())).clone()
                }
            }
        };
        self.mark_offer_taken(&request.offer_id);
        handle.deliver(envelope).await
    }

    // SECTION: bsq swaps

    /// Taker side of an atomic swap. Returns the swap once the take request went out.
    pub async fn take_bsq_swap_offer(
        &self,
        available: AvailabilityOutcome,
        amount: Coin,
    ) -> Result<BsqSwapTrade, TradeError> {
        let offer = available.offer;
        if !offer.is_bsq_swap() {
            return Err(ValidationError::InvalidOffer("not a bsq swap offer").into());
        }
        if amount < offer.min_amount || amount > offer.amount {
            return Err(ValidationError::InvalidOffer("amount outside the offer range").into());
        }
        let maker = (offer.maker_node.clone(), offer.maker_pub_key_ring.clone());
        let swap = BsqSwapTrade::new(utils::new_trade_id(), offer, TradeRole::Taker, amount, maker.0, maker.1);
        let id = swap.id.clone();
        let protocol: SharedSwap = Arc::new(tokio::sync::Mutex::new(BsqSwapProtocol::new(
            swap,
            self.services.clone(),
        )));
        self.bsq_swaps.lock().insert(id, protocol.clone());

        let mut protocol = protocol.lock().await;
        protocol.take().await?;
        Ok(protocol.swap().clone())
    }

    pub async fn bsq_swap(&self, trade_id: &TradeId) -> Option<BsqSwapTrade> {
        let protocol = self.bsq_swaps.lock().get(trade_id).cloned()?;
        let swap = protocol.lock().await.swap().clone();
        Some(swap)
    }

    async fn on_bsq_swap_message(&self, trade_id: TradeId, envelope: NetworkEnvelope) -> Result<(), TradeError> {
        let known = self.bsq_swaps.lock().get(&trade_id).cloned();
        let protocol = match (known, &envelope.payload) {
            (Some(protocol), _) => protocol,
            (None, Payload::BsqSwapTakeRequest(request)) => {
                let open = self
                    .open_offer(&request.offer_id)
                    .ok_or_else(|| TradeError::UnknownOffer(request.offer_id.clone()))?;
                if open.offer.state != OfferState::Available || !open.offer.is_bsq_swap() {
                    return Err(ValidationError::InvalidOffer("offer can not be swapped").into());
                }
                let swap = BsqSwapTrade::new(
                    trade_id.clone(),
                    open.offer,
                    TradeRole::Maker,
                    request.amount,
                    envelope.sender.clone(),
                    envelope.sender_pub_key_ring.clone(),
                );
                let protocol: SharedSwap = Arc::new(tokio::sync::Mutex::new(BsqSwapProtocol::new(
                    swap,
                    self.services.clone(),
                )));
                self.mark_offer_taken(&request.offer_id);
                self.bsq_swaps
                    .lock()
                    .entry(trade_id)
                    .or_insert(protocol)
                    .clone()
            }
            (None, _) => return Err(TradeError::UnknownTrade(trade_id)),
        };
        let mut protocol = protocol.lock().await;
        protocol.handle_message(envelope).await
    }

    // SECTION: disputes, refund agent side

    fn receive_dispute(&self, envelope: &NetworkEnvelope) -> Result<(), TradeError> {
        let Payload::OpenDispute(message) = &envelope.payload else {
            return Err(ValidationError::MissingField("OpenDisputeMessage").into());
        };
        let dispute = &message.dispute;
        if dispute.trader_pub_key_ring != envelope.sender_pub_key_ring {
            return Err(ValidationError::SenderMismatch.into());
        }
        if &dispute.refund_agent != self.services.my_address() {
            return Err(TradeError::UnexpectedMessage {
                message: envelope.payload.kind(),
                state: "not the refund agent of this trade".into(),
            });
        }
        info!(trade_id = %dispute.trade_id.short(), trader = %dispute.trader_node, reason = %dispute.reason, "dispute received");
        let name = format!("received_{}", dispute.record_name());
        let mut received = self.received_disputes.lock();
        let disputes = received.entry(dispute.trade_id.clone()).or_default();
        if disputes.iter().all(|d| d.trader_pub_key_ring != dispute.trader_pub_key_ring) {
            disputes.push(dispute.clone());
            self.services.persistence.request_persistence(name, &*disputes);
        }
        Ok(())
    }

    pub fn received_disputes(&self, trade_id: &TradeId) -> Vec<Dispute> {
        self.received_disputes.lock().get(trade_id).cloned().unwrap_or_default()
    }

    /// Send the decision to both traders of a received dispute.
    pub async fn close_dispute(
        &self,
        trade_id: &TradeId,
        buyer_payout: Coin,
        seller_payout: Coin,
        summary: impl Into<String>,
    ) -> Result<(), TradeError> {
        let disputes = self.received_disputes(trade_id);
        let first = disputes.first().ok_or_else(|| TradeError::UnknownTrade(trade_id.clone()))?;
        let mut traders: Vec<(NodeAddress, PubKeyRing)> = match &first.evidence.contract {
            Some(contract) => vec![
                (contract.terms.maker_node.clone(), contract.terms.maker_pub_key_ring.clone()),
                (contract.terms.taker_node.clone(), contract.terms.taker_pub_key_ring.clone()),
            ],
            None => Vec::new(),
        };
        for dispute in &disputes {
            if traders.iter().all(|(_, keys)| keys != &dispute.trader_pub_key_ring) {
                traders.push((dispute.trader_node.clone(), dispute.trader_pub_key_ring.clone()));
            }
        }

        let result = DisputeResultMessage {
            trade_id: trade_id.clone(),
            buyer_payout,
            seller_payout,
            summary: summary.into(),
        };
        for (node, keys) in traders {
            let outcome = self
                .services
                .dispatcher
                .send_mailbox_message(&node, &keys, Payload::DisputeResult(result.clone()))
                .await?;
            info!(trade_id = %trade_id.short(), trader = %node, ?outcome, "dispute result sent");
        }
        Ok(())
    }

    // SECTION: routing

    /// Entry point for every envelope the network or the mailbox hands us.
    pub async fn on_message(&self, envelope: NetworkEnvelope) -> Result<(), TradeError> {
        self.services.check_envelope(&envelope)?;
        let kind = envelope.payload.kind();
        debug!(sender = %envelope.sender, message = kind, uid = %envelope.uid, "routing message");

        match &envelope.payload {
            Payload::OfferAvailabilityRequest(request) => {
                let offer = self.open_offer(&request.offer_id).map(|open| open.offer);
                availability::respond_to_request(&self.services, offer.as_ref(), &envelope)
                    .await
                    .map(|_| ())
            }
            Payload::OfferAvailabilityResponse(response) => {
                let offer_id = response.offer_id.clone();
                if !self.pending_availability.route(envelope) {
                    debug!(%offer_id, "no request waiting for availability response, ignored");
                }
                Ok(())
            }
            Payload::OpenDispute(_) => self.receive_dispute(&envelope),
            Payload::BsqSwapTakeRequest(m) => self.on_bsq_swap_message(m.trade_id.clone(), envelope).await,
            Payload::BsqSwapInputsResponse(m) => self.on_bsq_swap_message(m.trade_id.clone(), envelope).await,
            Payload::BsqSwapFinalized(m) => self.on_bsq_swap_message(m.trade_id.clone(), envelope).await,
            Payload::PayDepositRequest(m) if self.trade(&m.trade_id).is_none() => {
                self.accept_take_request(envelope).await
            }
            payload => {
                let trade_id = payload
                    .trade_id()
                    .cloned()
                    .ok_or(ValidationError::MissingField("trade id"))?;
                let handle = self
                    .trade(&trade_id)
                    .ok_or(TradeError::UnknownTrade(trade_id))?;
                handle.deliver(envelope).await
            }
        }
    }

    /// Process mailbox entries addressed to us. Entries are removed once handled.
    pub async fn process_mailbox(&self) -> Result<usize, TradeError> {
        let mailbox = self.services.dispatcher.mailbox().clone();
        let my_keys = self.services.my_keys().clone();
        let purged = mailbox.purge_expired(&TimeStamp::new())?;
        if purged > 0 {
            debug!(purged, "expired mailbox entries removed");
        }

        let mut processed = 0;
        for item in mailbox.items_for(&my_keys)? {
            let envelope = match item.decode_envelope() {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(uid = %item.uid, error = %e, "undecodable mailbox entry dropped");
                    mailbox.remove(&my_keys, &item.uid)?;
                    continue;
                }
            };
            match self.on_message(envelope).await {
                Ok(()) => {
                    mailbox.remove(&my_keys, &item.uid)?;
                    processed += 1;
                }
                Err(e) => warn!(uid = %item.uid, error = %e, "mailbox message not processed, kept for later"),
            }
        }
        Ok(processed)
    }

    // SECTION: restart

    /// Reload open offers, running trades and swaps from disk.
    pub fn restore(&self) -> Result<usize, PersistenceError> {
        let manager = self.services.persistence.manager().clone();
        let mut restored = 0;

        for name in manager.list("offer_")? {
            if let Some(open) = manager.read::<OpenOffer>(&name)? {
                self.open_offers.lock().insert(open.offer.id.clone(), open);
                restored += 1;
            }
        }
        for name in manager.list("trade_")? {
            let Some(trade) = manager.read::<Trade>(&name)? else {
                continue;
            };
            if trade.state().is_terminal() {
                continue;
            }
            info!(trade_id = %trade.id.short(), state = %trade.state(), "trade restored");
            let handle = coordinator::spawn(trade, self.services.clone());
            self.trades.lock().insert(handle.id().clone(), handle);
            restored += 1;
        }
        for name in manager.list("bsq_swap_")? {
            let Some(swap) = manager.read::<BsqSwapTrade>(&name)? else {
                continue;
            };
            if swap.state().is_terminal() {
                continue;
            }
            let id = swap.id.clone();
            let protocol = BsqSwapProtocol::new(swap, self.services.clone());
            self.bsq_swaps
                .lock()
                .insert(id, Arc::new(tokio::sync::Mutex::new(protocol)));
            restored += 1;
        }
        for name in manager.list("received_dispute_")? {
            if let Some(disputes) = manager.read::<Vec<Dispute>>(&name)? {
                if let Some(first) = disputes.first() {
                    self.received_disputes.lock().insert(first.trade_id.clone(), disputes);
                }
            }
        }
        Ok(restored)
    }

    /// Wait until every queued record is on disk.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        self.services.persistence.flush().await
    }
}
