//! Offer availability handshake.
//!
//! The taker asks the maker whether an offer can still be taken and waits for
//! the answer with a timeout. The maker side evaluates requests against its
//! open offers with [`evaluate_request`].
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::capabilities::{Capabilities, Capability};
use crate::error::{AvailabilityError, TaskError, TradeError, ValidationError};
use crate::message::{
    AvailabilityResult, NetworkEnvelope, OfferAvailabilityRequest, OfferAvailabilityResponse, Payload,
};
use crate::offer::{Offer, OfferState};
use crate::task::{CancelFlag, RunOutcome, Step, TaskModel, TaskOutcome, TaskRunner};
use crate::types::{NodeAddress, OfferId, Price};
use crate::wallet::check_unconfirmed_limit;

use super::ServiceProvider;

/// Maximum relative deviation of the taker's price, in percent.
const PRICE_TOLERANCE_PERCENT: u64 = 1;

/// What the taker learned from a positive response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityOutcome {
    pub offer: Offer,
    pub refund_agent: NodeAddress,
    pub maker_capabilities: Capabilities,
}

pub struct AvailabilityModel {
    pub offer: Offer,
    pub services: Arc<ServiceProvider>,
    pub message: Option<NetworkEnvelope>,
    pub response: Option<OfferAvailabilityResponse>,
    rejection: Option<AvailabilityError>,
}

impl TaskModel for AvailabilityModel {
    fn request_persistence(&mut self) {
        // the taker's copy of a foreign offer is never persisted
        trace!(offer_id = %self.offer.id, state = ?self.offer.state, "availability model updated");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityStep {
    SendOfferAvailabilityRequest,
    ProcessOfferAvailabilityResponse,
}

#[async_trait]
impl Step<AvailabilityModel> for AvailabilityStep {
    fn name(&self) -> &'static str {
        match self {
            AvailabilityStep::SendOfferAvailabilityRequest => "send_offer_availability_request",
            AvailabilityStep::ProcessOfferAvailabilityResponse => "process_offer_availability_response",
        }
    }

    async fn run(self, model: &mut AvailabilityModel, outcome: &mut TaskOutcome) {
        let result = match self {
            AvailabilityStep::SendOfferAvailabilityRequest => send_request(model).await,
            AvailabilityStep::ProcessOfferAvailabilityResponse => process_response(model),
        };
        let _ = outcome.settle(result);
    }
}

async fn send_request(model: &mut AvailabilityModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let offer = &mut model.offer;
    let request = OfferAvailabilityRequest {
        offer_id: offer.id.clone(),
        taker_pub_key_ring: services.my_keys().clone(),
        price: offer.price,
        capabilities: services.capabilities,
    };
    let result = services
        .dispatcher
        .send_direct(
            &offer.maker_node,
            &offer.maker_pub_key_ring,
            Payload::OfferAvailabilityRequest(request),
        )
        .await;
    if let Err(e) = &result {
        offer.state = OfferState::MakerOffline;
        model.rejection = Some(AvailabilityError::Transport(e.to_string()));
    }
    result
}

fn process_response(model: &mut AvailabilityModel) -> Result<(), TradeError> {
    let result = check_response(model);
    if let Err(TradeError::Validation(e)) = &result {
        model.rejection = Some(AvailabilityError::Validation(e.clone()));
    }
    result
}

fn check_response(model: &mut AvailabilityModel) -> Result<(), TradeError> {
    let Some(envelope) = model.message.take() else {
        return Err(ValidationError::MissingField("OfferAvailabilityResponse").into());
    };
    let Payload::OfferAvailabilityResponse(response) = envelope.payload else {
        return Err(ValidationError::MissingField("OfferAvailabilityResponse").into());
    };
    let offer = &mut model.offer;
    if envelope.sender_pub_key_ring != offer.maker_pub_key_ring {
        return Err(ValidationError::SenderMismatch.into());
    }
    if response.offer_id != offer.id {
        return Err(ValidationError::StaleOfferId {
            expected: offer.id.clone(),
            got: response.offer_id,
        }
        .into());
    }
    if response.result != AvailabilityResult::Available {
        offer.state = OfferState::NotAvailable;
        model.rejection = Some(AvailabilityError::Rejected(format!("{:?}", response.result)));
        return Err(TradeError::TaskFailed {
            task: "process_offer_availability_response",
            reason: format!("maker answered {:?}", response.result),
        });
    }
    let agent_known = response
        .refund_agent
        .as_ref()
        .is_some_and(|node| model.services.refund_agents.get(node).is_some());
    if !agent_known {
        offer.state = OfferState::NotAvailable;
        model.rejection = Some(AvailabilityError::Rejected("no known refund agent".into()));
        return Err(TradeError::NoRefundAgent);
    }
    offer.state = OfferState::Available;
    model.response = Some(response);
    Ok(())
}

/// Routes availability responses to the request waiting for them.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<OfferId, (u64, mpsc::UnboundedSender<NetworkEnvelope>)>>>,
    next_token: Arc<AtomicU64>,
}

impl PendingRequests {
    fn register(&self, offer_id: &OfferId) -> (Registration, mpsc::UnboundedReceiver<NetworkEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if self.inner.lock().insert(offer_id.clone(), (token, tx)).is_some() {
            debug!(%offer_id, "replaced an older availability request");
        }
        let registration = Registration {
            offer_id: offer_id.clone(),
            token,
            pending: self.clone(),
        };
        (registration, rx)
    }

    /// Hand `envelope` to the request waiting for it. `false` if none is.
    pub fn route(&self, envelope: NetworkEnvelope) -> bool {
        let Payload::OfferAvailabilityResponse(response) = &envelope.payload else {
            return false;
        };
        let pending = self.inner.lock();
        match pending.get(&response.offer_id) {
            Some((_, tx)) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Removes the listener entry when the request finishes, however it finishes.
struct Registration {
    offer_id: OfferId,
    token: u64,
    pending: PendingRequests,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut pending = self.pending.inner.lock();
        if pending.get(&self.offer_id).is_some_and(|(token, _)| *token == self.token) {
            pending.remove(&self.offer_id);
        }
    }
}

/// Called once when a request ends in an error. Not called on cancel.
pub type AvailabilityErrorHandler = Box<dyn FnOnce(&AvailabilityError) + Send>;

pub struct AvailabilityHandle {
    offer_id: OfferId,
    cancel: CancelFlag,
    notify: Arc<Notify>,
    state: watch::Receiver<OfferState>,
    task: JoinHandle<Result<AvailabilityOutcome, AvailabilityError>>,
}

impl AvailabilityHandle {
    pub fn offer_id(&self) -> &OfferId {
        &self.offer_id
    }

    /// Last offer state the request observed.
    pub fn offer_state(&self) -> OfferState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the timer and removes the response listener, also while the
    /// request is still being sent.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.notify.notify_one();
    }

    /// Resolves exactly once, with the response or the first error.
    pub async fn outcome(self) -> Result<AvailabilityOutcome, AvailabilityError> {
        self.task
            .await
            .unwrap_or_else(|e| Err(AvailabilityError::Transport(format!("availability task stopped: {e}"))))
    }
}

/// Start a request for `offer`. Must be called inside a tokio runtime.
pub fn check_offer_availability(
    services: Arc<ServiceProvider>,
    pending: &PendingRequests,
    offer: Offer,
    on_error: Option<AvailabilityErrorHandler>,
) -> AvailabilityHandle {
    let offer_id = offer.id.clone();
    let (registration, responses) = pending.register(&offer_id);
    let cancel = CancelFlag::new();
    let notify = Arc::new(Notify::new());
    let (state_tx, state) = watch::channel(offer.state);
    let timeout = services.config.availability_timeout();
    let protocol = OfferAvailabilityProtocol {
        deadline: Instant::now() + timeout,
        timeout,
        model: AvailabilityModel {
            offer,
            services,
            message: None,
            response: None,
            rejection: None,
        },
        responses,
        cancel: cancel.clone(),
        notify: notify.clone(),
        state_tx,
        on_error,
        _registration: registration,
    };
    AvailabilityHandle {
        offer_id,
        cancel,
        notify,
        state,
        task: tokio::spawn(protocol.run()),
    }
}

struct OfferAvailabilityProtocol {
    model: AvailabilityModel,
    responses: mpsc::UnboundedReceiver<NetworkEnvelope>,
    /// Fixed when the request starts; covers the send and the wait for the response.
    deadline: Instant,
    timeout: Duration,
    cancel: CancelFlag,
    notify: Arc<Notify>,
    state_tx: watch::Sender<OfferState>,
    on_error: Option<AvailabilityErrorHandler>,
    _registration: Registration,
}

impl OfferAvailabilityProtocol {
    async fn run(mut self) -> Result<AvailabilityOutcome, AvailabilityError> {
        let result = self.execute().await;
        self.state_tx.send_replace(self.model.offer.state);
        match &result {
            Ok(outcome) => info!(offer_id = %outcome.offer.id, agent = %outcome.refund_agent, "offer is available"),
            Err(AvailabilityError::Cancelled) => {
                debug!(offer_id = %self.model.offer.id, "offer availability check cancelled")
            }
            Err(e) => {
                info!(offer_id = %self.model.offer.id, error = %e, "offer availability check failed");
                if let Some(handler) = self.on_error.take() {
                    handler(e);
                }
            }
        }
        result
    }

    async fn execute(&mut self) -> Result<AvailabilityOutcome, AvailabilityError> {
        let sleep = tokio::time::sleep_until(self.deadline);
        tokio::pin!(sleep);

        let sent = tokio::select! {
            _ = &mut sleep => None,
            _ = self.notify.notified() => return Err(AvailabilityError::Cancelled),
            sent = run_step(
                &mut self.model,
                &self.cancel,
                &self.state_tx,
                AvailabilityStep::SendOfferAvailabilityRequest,
            ) => Some(sent),
        };
        match sent {
            Some(sent) => sent?,
            None => return Err(self.timed_out()),
        }

        let received = tokio::select! {
            _ = &mut sleep => None,
            _ = self.notify.notified() => return Err(AvailabilityError::Cancelled),
            received = self.responses.recv() => Some(received),
        };
        let envelope = match received {
            Some(received) => received.ok_or(AvailabilityError::Cancelled)?,
            None => return Err(self.timed_out()),
        };

        self.model.message = Some(envelope);
        run_step(
            &mut self.model,
            &self.cancel,
            &self.state_tx,
            AvailabilityStep::ProcessOfferAvailabilityResponse,
        )
        .await?;
        let response = self
            .model
            .response
            .take()
            .ok_or(AvailabilityError::Validation(ValidationError::MissingField(
                "OfferAvailabilityResponse",
            )))?;
        Ok(AvailabilityOutcome {
            offer: self.model.offer.clone(),
            refund_agent: response
                .refund_agent
                .ok_or(AvailabilityError::Rejected("no refund agent".into()))?,
            maker_capabilities: response.maker_capabilities,
        })
    }

    fn timed_out(&mut self) -> AvailabilityError {
        warn!(offer_id = %self.model.offer.id, timeout = ?self.timeout, "maker did not answer availability request");
        self.model.offer.state = OfferState::MakerOffline;
        self.state_tx.send_replace(self.model.offer.state);
        AvailabilityError::Timeout(self.timeout)
    }
}

async fn run_step(
    model: &mut AvailabilityModel,
    cancel: &CancelFlag,
    state_tx: &watch::Sender<OfferState>,
    step: AvailabilityStep,
) -> Result<(), AvailabilityError> {
    let label = format!("{}/{}", step.name(), model.offer.id);
    let mut runner = TaskRunner::new(label).with_cancel_flag(cancel.clone());
    runner.add_tasks([step]);
    let outcome = runner.run(model).await;
    state_tx.send_replace(model.offer.state);
    match outcome {
        Ok(RunOutcome::Completed) => Ok(()),
        Ok(RunOutcome::Cancelled) => Err(AvailabilityError::Cancelled),
        Ok(RunOutcome::Failed(failure)) => Err(model
            .rejection
            .take()
            .unwrap_or(AvailabilityError::Rejected(failure.reason))),
        Err(TaskError::AlreadyTerminated { task, .. } | TaskError::NoOutcome(task)) => {
            Err(AvailabilityError::Rejected(format!("task {task} misbehaved")))
        }
        Err(e @ TaskError::RunnerNotIdle(_)) => Err(AvailabilityError::Rejected(e.to_string())),
    }
}

// SECTION: maker side

fn price_within_tolerance(offered: Price, requested: Price) -> bool {
    let diff = offered.0.abs_diff(requested.0);
    diff.saturating_mul(100) <= offered.0.saturating_mul(PRICE_TOLERANCE_PERCENT)
}

/// Maker's verdict on a request, and the refund agent it picked.
pub fn evaluate_request(
    services: &ServiceProvider,
    offer: Option<&Offer>,
    sender: &NodeAddress,
    request: &OfferAvailabilityRequest,
) -> (AvailabilityResult, Option<NodeAddress>) {
    let Some(offer) = offer.filter(|o| o.state == OfferState::Available) else {
        return (AvailabilityResult::OfferTaken, None);
    };
    if services.filter.check_node(sender).is_err() {
        return (AvailabilityResult::UserIgnored, None);
    }
    let mut required = offer.required_capabilities;
    if offer.use_v5_protocol {
        required = required.with(Capability::ProtocolV5);
    }
    if !request.capabilities.contains_all(required) {
        return (AvailabilityResult::MissingMandatoryCapability, None);
    }
    if !price_within_tolerance(offer.price, request.price) {
        return (AvailabilityResult::PriceOutOfTolerance, None);
    }
    if check_unconfirmed_limit(services.wallet.as_ref(), services.config.max_unconfirmed_own_txs).is_err() {
        return (AvailabilityResult::UnconfTxLimitHit, None);
    }
    match services
        .refund_agents
        .select(Capabilities::default(), offer.id.as_str().as_bytes())
    {
        Some(agent) => (AvailabilityResult::Available, Some(agent.node.clone())),
        None => (AvailabilityResult::NoRefundAgents, None),
    }
}

/// Answer an availability request directly to its sender.
pub async fn respond_to_request(
    services: &ServiceProvider,
    offer: Option<&Offer>,
    envelope: &NetworkEnvelope,
) -> Result<AvailabilityResult, TradeError> {
    let Payload::OfferAvailabilityRequest(request) = &envelope.payload else {
        return Err(TradeError::UnexpectedMessage {
            message: envelope.payload.kind(),
            state: "offer book".into(),
        });
    };
    if request.taker_pub_key_ring != envelope.sender_pub_key_ring {
        return Err(ValidationError::SenderMismatch.into());
    }
    let (result, refund_agent) = evaluate_request(services, offer, &envelope.sender, request);
    info!(offer_id = %request.offer_id, taker = %envelope.sender, ?result, "answering availability request");
    let response = OfferAvailabilityResponse {
        offer_id: request.offer_id.clone(),
        result,
        refund_agent,
        maker_capabilities: services.capabilities,
    };
    services
        .dispatcher
        .send_direct(
            &envelope.sender,
            &envelope.sender_pub_key_ring,
            Payload::OfferAvailabilityResponse(response),
        )
        .await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_tolerance_is_one_percent() {
        assert!(price_within_tolerance(Price(10_000), Price(10_000)));
        assert!(price_within_tolerance(Price(10_000), Price(10_100)));
        assert!(price_within_tolerance(Price(10_000), Price(9_900)));
        assert!(!price_within_tolerance(Price(10_000), Price(10_101)));
    }

    #[tokio::test]
    async fn registration_is_removed_on_drop() {
        let pending = PendingRequests::default();
        let offer_id = OfferId::from("offer1abc");
        let (first, _rx1) = pending.register(&offer_id);
        let (second, _rx2) = pending.register(&offer_id);
        assert_eq!(pending.len(), 1);

        // the stale registration must not remove the newer one
        drop(first);
        assert_eq!(pending.len(), 1);
        drop(second);
        assert!(pending.is_empty());
    }
}
