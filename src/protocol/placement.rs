//! Placing an offer: validation, the maker fee tx, publication.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{TradeError, ValidationError};
use crate::offer::{Offer, OfferState, PaymentAccount, trade_fee};
use crate::task::{RunOutcome, Step, TaskModel, TaskOutcome, TaskRunner};
use crate::types::TradeId;
use crate::wallet::{TxKind, TxRequest, check_unconfirmed_limit};

use super::ServiceProvider;

/// An offer of ours together with the account it is paid through.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OpenOffer {
    #[n(0)]
    pub offer: Offer,
    #[n(1)]
    pub payment_account: PaymentAccount,
}

impl OpenOffer {
    pub fn record_name(&self) -> String {
        self.offer.record_name()
    }
}

pub struct PlacementModel {
    pub open_offer: OpenOffer,
    pub services: Arc<ServiceProvider>,
}

impl TaskModel for PlacementModel {
    fn request_persistence(&mut self) {
        // nothing worth keeping until the fee is paid
        if self.open_offer.offer.state != OfferState::Unknown {
            self.services
                .persistence
                .request_persistence(self.open_offer.record_name(), &self.open_offer);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStep {
    ValidateOffer,
    CreateMakerFeeTx,
    AddToOfferBook,
}

#[async_trait]
impl Step<PlacementModel> for PlacementStep {
    fn name(&self) -> &'static str {
        match self {
            PlacementStep::ValidateOffer => "validate_offer",
            PlacementStep::CreateMakerFeeTx => "create_maker_fee_tx",
            PlacementStep::AddToOfferBook => "add_to_offer_book",
        }
    }

    async fn run(self, model: &mut PlacementModel, outcome: &mut TaskOutcome) {
        let result = match self {
            PlacementStep::ValidateOffer => validate_offer(model),
            PlacementStep::CreateMakerFeeTx => create_maker_fee_tx(model).await,
            PlacementStep::AddToOfferBook => {
                model.open_offer.offer.state = OfferState::Available;
                Ok(())
            }
        };
        let _ = outcome.settle(result);
    }
}

fn validate_offer(model: &mut PlacementModel) -> Result<(), TradeError> {
    let services = &model.services;
    let OpenOffer { offer, payment_account } = &model.open_offer;
    if &offer.maker_node != services.my_address() || &offer.maker_pub_key_ring != services.my_keys() {
        return Err(ValidationError::InvalidOffer("offer is not ours").into());
    }
    if offer.state != OfferState::Unknown {
        return Err(ValidationError::InvalidOffer("offer was already placed").into());
    }
    if payment_account.payment_method != offer.payment_method {
        return Err(ValidationError::InvalidOffer("payment account does not match the offer").into());
    }
    if offer.use_v5_protocol && !services.config.use_v5_protocol {
        return Err(ValidationError::InvalidOffer("protocol v5 is disabled").into());
    }
    services
        .filter
        .check_payment_account(&payment_account.hash())?;
    Ok(())
}

async fn create_maker_fee_tx(model: &mut PlacementModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let offer = &mut model.open_offer.offer;
    // swap fees are paid inside the swap tx itself
    if offer.is_bsq_swap() {
        offer.state = OfferState::OfferFeePaid;
        return Ok(());
    }
    check_unconfirmed_limit(services.wallet.as_ref(), services.config.max_unconfirmed_own_txs)?;
    // maker fees are tracked under the offer id
    let fee_reference = TradeId::new(offer.id.as_str());
    let tx = services
        .wallet
        .build_tx(&TxRequest::new(TxKind::TradeFee, fee_reference, trade_fee(offer.amount)))?;
    let tx_id = services.wallet.broadcast(&tx, &[]).await?;
    info!(offer_id = %offer.id, %tx_id, "maker fee tx published");
    offer.maker_fee_tx_id = Some(tx_id);
    offer.state = OfferState::OfferFeePaid;
    Ok(())
}

/// Run the placement sequence. The open offer is persisted once its fee is paid.
pub async fn place_offer(
    services: Arc<ServiceProvider>,
    offer: Offer,
    payment_account: PaymentAccount,
) -> Result<OpenOffer, TradeError> {
    let label = format!("place_offer/{}", offer.id);
    let mut model = PlacementModel {
        open_offer: OpenOffer { offer, payment_account },
        services,
    };
    let mut runner = TaskRunner::new(label);
    runner.add_tasks([
        PlacementStep::ValidateOffer,
        PlacementStep::CreateMakerFeeTx,
        PlacementStep::AddToOfferBook,
    ]);
    match runner.run(&mut model).await? {
        RunOutcome::Completed => Ok(model.open_offer),
        RunOutcome::Failed(failure) => {
            warn!(offer_id = %model.open_offer.offer.id, task = failure.task, reason = %failure.reason, "placing offer failed");
            Err(TradeError::TaskFailed {
                task: failure.task,
                reason: failure.reason,
            })
        }
        RunOutcome::Cancelled => Err(TradeError::TaskFailed {
            task: "place_offer",
            reason: "cancelled".into(),
        }),
    }
}
