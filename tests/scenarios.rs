mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use common::{AGENT, TestNet, TestNode};
use tokio::time::Instant;
use trade_engine::TradeError;
use trade_engine::capabilities::Capabilities;
use trade_engine::config::EngineConfig;
use trade_engine::coordinator::TradeHandle;
use trade_engine::error::AvailabilityError;
use trade_engine::message::{AvailabilityResult, OfferAvailabilityResponse, Payload};
use trade_engine::offer::{Offer, OfferState, PaymentMethod};
use trade_engine::protocol::bsq_swap::{BsqSwapState, BsqSwapTrade};
use trade_engine::protocol::dispute::{Dispute, dispute_record_name};
use trade_engine::trade::{DisputeState, Phase, Trade, TradePeriodState, TradeState};
use trade_engine::types::{Coin, Direction, TimeStamp, TradeId, TxId};
use trade_engine::wallet::TxKind;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

async fn wait_until(handle: &TradeHandle, predicate: impl FnMut(&Trade) -> bool) -> anyhow::Result<Trade> {
    let trade = tokio::time::timeout(Duration::from_secs(10), handle.wait_for(predicate))
        .await
        .with_context(|| format!("trade {} did not reach the expected state", handle.id()))??;
    Ok(trade)
}

/// The maker learns about a trade only when the taker's request arrives.
async fn trade_handle(node: &TestNode, trade_id: &TradeId) -> anyhow::Result<TradeHandle> {
    for _ in 0..500 {
        if let Some(handle) = node.manager.trade(trade_id) {
            return Ok(handle);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("{} never created trade {trade_id}", node.address)
}

async fn swap_in_state(node: &TestNode, trade_id: &TradeId, state: BsqSwapState) -> anyhow::Result<BsqSwapTrade> {
    for _ in 0..500 {
        if let Some(swap) = node.manager.bsq_swap(trade_id).await {
            if swap.state() == state {
                return Ok(swap);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("swap {trade_id} on {} never reached {state:?}", node.address)
}

struct Parties {
    net: TestNet,
    agent: TestNode,
    maker: TestNode,
    taker: TestNode,
}

fn parties() -> anyhow::Result<Parties> {
    parties_with(|_| {})
}

/// The taker keeps the 90 second availability timeout of the default config.
fn parties_with_default_timeout() -> anyhow::Result<Parties> {
    parties_with(|config| config.availability_timeout_secs = EngineConfig::default().availability_timeout_secs)
}

fn parties_with(taker_config: impl FnOnce(&mut EngineConfig)) -> anyhow::Result<Parties> {
    let net = TestNet::new()?;
    let agent = net.node(AGENT)?;
    let maker = net.node("maker.onion:1")?;
    let mut config = net.config("taker.onion:1");
    taker_config(&mut config);
    let taker = net.node_with("taker.onion:1", config)?;
    Ok(Parties {
        net,
        agent,
        maker,
        taker,
    })
}

/// Place an offer, check it and take it. Returns both trade handles once the
/// deposit is published on both sides.
async fn trade_to_deposit(
    p: &Parties,
    direction: Direction,
    v5: bool,
) -> anyhow::Result<(TradeHandle, TradeHandle)> {
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(direction, PaymentMethod::Sepa, v5)?,
            p.maker.account(PaymentMethod::Sepa),
        )
        .await?;
    let available = p.taker.manager.check_offer_availability(offer).outcome().await?;
    let taker_trade = p
        .taker
        .manager
        .take_offer(available, Coin(800_000), p.taker.account(PaymentMethod::Sepa))
        .await?;
    let maker_trade = trade_handle(&p.maker, taker_trade.id()).await?;

    wait_until(&maker_trade, |t| t.state() == TradeState::MakerReceivedDepositTxPublishedMsg).await?;
    wait_until(&taker_trade, |t| t.state() == TradeState::TakerSawArrivedDepositTxPublishedMsg).await?;
    Ok((maker_trade, taker_trade))
}

// SECTION: happy paths

#[tokio::test]
async fn classic_trade_completes() -> anyhow::Result<()> {
    let p = parties()?;
    // maker sells, so the taker is the buyer
    let (maker_trade, taker_trade) = trade_to_deposit(&p, Direction::Sell, false).await?;

    maker_trade.confirm_deposit().await?;
    taker_trade.confirm_deposit().await?;
    taker_trade.confirm_payment_started().await?;
    wait_until(&maker_trade, |t| t.state() == TradeState::SellerReceivedPaymentStartedMsg).await?;
    maker_trade.confirm_payment_received().await?;

    let maker_done = wait_until(&maker_trade, |t| t.state() == TradeState::Completed).await?;
    let taker_done = wait_until(&taker_trade, |t| t.state() == TradeState::Completed).await?;

    assert_eq!(maker_done.contract, taker_done.contract);
    assert!(maker_done.contract.as_ref().is_some_and(|c| c.is_fully_signed()));
    assert_eq!(
        maker_done.process_model.payout_tx_id,
        taker_done.process_model.payout_tx_id
    );
    assert_eq!(p.taker.wallet.broadcast_count(TxKind::TradeFee), 1);
    assert_eq!(p.taker.wallet.broadcast_count(TxKind::Deposit), 1);
    assert_eq!(p.maker.wallet.broadcast_count(TxKind::TradeFee), 1);
    assert_eq!(p.maker.wallet.broadcast_count(TxKind::Payout), 1);

    // finished trades move to the closed records
    p.maker.manager.flush().await?;
    let records = p.maker.services().persistence.manager();
    assert!(records.read_bytes(&format!("closed_{}", maker_done.id))?.is_some());
    assert!(records.read_bytes(&maker_done.record_name())?.is_none());
    Ok(())
}

#[tokio::test]
async fn v5_trade_signs_warning_and_redirect_txs() -> anyhow::Result<()> {
    let p = parties()?;
    // maker buys, so the maker is the buyer
    let (maker_trade, taker_trade) = trade_to_deposit(&p, Direction::Buy, true).await?;

    for trade in [maker_trade.snapshot(), taker_trade.snapshot()] {
        let pm = &trade.process_model;
        assert!(pm.warning_tx.is_some(), "{:?} has no warning tx", trade.role);
        assert!(pm.redirect_tx.is_some());
        assert!(pm.peer.warning_signature.is_some());
        assert!(pm.peer.redirect_signature.is_some());
        assert!(pm.peer.fee_bump_address.is_some());
    }
    // each side holds its own warning tx, never the peer's
    assert_ne!(
        maker_trade.snapshot().process_model.warning_tx,
        taker_trade.snapshot().process_model.warning_tx
    );

    maker_trade.confirm_deposit().await?;
    taker_trade.confirm_deposit().await?;
    maker_trade.confirm_payment_started().await?;
    wait_until(&taker_trade, |t| t.state() == TradeState::SellerReceivedPaymentStartedMsg).await?;
    taker_trade.confirm_payment_received().await?;

    wait_until(&maker_trade, |t| t.state() == TradeState::Completed).await?;
    wait_until(&taker_trade, |t| t.state() == TradeState::Completed).await?;
    assert_eq!(p.taker.wallet.broadcast_count(TxKind::Payout), 1);
    assert_eq!(p.maker.wallet.broadcast_count(TxKind::Warning), 0);
    Ok(())
}

#[tokio::test]
async fn bsq_swap_settles_in_one_transaction() -> anyhow::Result<()> {
    let p = parties()?;
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::BsqSwap, false)?,
            p.maker.account(PaymentMethod::BsqSwap),
        )
        .await?;
    // swap offers carry no maker fee tx
    assert!(offer.maker_fee_tx_id.is_none());

    let available = p.taker.manager.check_offer_availability(offer.clone()).outcome().await?;
    let swap = p.taker.manager.take_bsq_swap_offer(available, Coin(600_000)).await?;
    assert_eq!(swap.state(), BsqSwapState::TakerSentTakeRequest);

    let taker_swap = swap_in_state(&p.taker, &swap.id, BsqSwapState::Completed).await?;
    let maker_swap = swap_in_state(&p.maker, &swap.id, BsqSwapState::Completed).await?;
    assert_eq!(taker_swap.tx_id, maker_swap.tx_id);
    assert_eq!(maker_swap.amount, Coin(600_000));
    assert_eq!(p.taker.wallet.broadcast_count(TxKind::BsqSwap), 1);
    assert!(p.maker.wallet.broadcasts().is_empty());
    assert_eq!(
        p.maker.manager.open_offer(&offer.id).map(|o| o.offer.state),
        Some(OfferState::NotAvailable)
    );
    Ok(())
}

#[tokio::test]
async fn bsq_swap_fails_when_take_request_does_not_arrive() -> anyhow::Result<()> {
    let p = parties()?;
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::BsqSwap, false)?,
            p.maker.account(PaymentMethod::BsqSwap),
        )
        .await?;
    let available = p.taker.manager.check_offer_availability(offer).outcome().await?;
    p.net.network.fail_kind("BsqSwapTakeRequest");

    let result = p.taker.manager.take_bsq_swap_offer(available, Coin(600_000)).await;

    assert!(matches!(
        result,
        Err(TradeError::TaskFailed {
            task: "send_bsq_swap_take_request",
            ..
        })
    ));
    // swaps never use the mailbox
    assert_eq!(p.net.mailbox.pending_for(&p.maker.keys()), 0);
    Ok(())
}

#[tokio::test]
async fn bsq_swap_completes_when_finalized_message_is_lost() -> anyhow::Result<()> {
    let p = parties()?;
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::BsqSwap, false)?,
            p.maker.account(PaymentMethod::BsqSwap),
        )
        .await?;
    let available = p.taker.manager.check_offer_availability(offer).outcome().await?;
    p.net.network.fail_kind("BsqSwapFinalizedMessage");

    let swap = p.taker.manager.take_bsq_swap_offer(available, Coin(600_000)).await?;

    // the swap tx is on chain, so the lost message does not undo the swap
    let taker_swap = swap_in_state(&p.taker, &swap.id, BsqSwapState::Completed).await?;
    assert!(taker_swap.tx_id.is_some());
    assert!(
        taker_swap
            .error_message()
            .is_some_and(|e| e.contains("BsqSwapFinalizedMessage"))
    );
    assert_eq!(p.taker.wallet.broadcast_count(TxKind::BsqSwap), 1);
    let maker_swap = swap_in_state(&p.maker, &swap.id, BsqSwapState::MakerSentInputs).await?;
    assert!(maker_swap.tx_id.is_none());
    Ok(())
}

// SECTION: availability and placement

async fn place_sepa_offer(node: &TestNode) -> anyhow::Result<Offer> {
    let offer = node
        .manager
        .place_offer(
            node.offer(Direction::Sell, PaymentMethod::Sepa, false)?,
            node.account(PaymentMethod::Sepa),
        )
        .await?;
    Ok(offer)
}

/// Let woken tasks run without moving the paused clock.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn availability_times_out_when_maker_stays_silent() -> anyhow::Result<()> {
    let p = parties_with_default_timeout()?;
    let offer = place_sepa_offer(&p.maker).await?;
    p.net.network.set_muted(&p.maker.address, true);

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let start = Instant::now();
    let handle = p
        .taker
        .manager
        .check_offer_availability_with_handler(offer.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    tokio::time::sleep_until(start + Duration::from_secs(89)).await;
    settle().await;
    assert!(!handle.is_finished());
    assert_ne!(handle.offer_state(), OfferState::MakerOffline);
    assert_eq!(failures.load(Ordering::SeqCst), 0);

    tokio::time::sleep_until(start + Duration::from_secs(90)).await;
    settle().await;
    assert_eq!(handle.offer_state(), OfferState::MakerOffline);
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    // an answer after the deadline finds no listener
    let late = p
        .maker
        .services()
        .dispatcher
        .envelope(Payload::OfferAvailabilityResponse(OfferAvailabilityResponse {
            offer_id: offer.id.clone(),
            result: AvailabilityResult::Available,
            refund_agent: Some(AGENT.into()),
            maker_capabilities: Capabilities::all(),
        }));
    p.taker.manager.on_message(late).await?;
    settle().await;

    assert_eq!(handle.offer_state(), OfferState::MakerOffline);
    assert_eq!(
        handle.outcome().await,
        Err(AvailabilityError::Timeout(Duration::from_secs(90)))
    );
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn availability_deadline_covers_a_stalled_send() -> anyhow::Result<()> {
    let p = parties_with_default_timeout()?;
    let offer = place_sepa_offer(&p.maker).await?;
    p.net.network.set_stalled(&p.maker.address, true);

    let start = Instant::now();
    let handle = p.taker.manager.check_offer_availability(offer);
    tokio::time::sleep_until(start + Duration::from_secs(90)).await;
    settle().await;

    assert_eq!(handle.offer_state(), OfferState::MakerOffline);
    assert_eq!(
        handle.outcome().await,
        Err(AvailabilityError::Timeout(Duration::from_secs(90)))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_a_request_still_being_sent() -> anyhow::Result<()> {
    let p = parties_with_default_timeout()?;
    let offer = place_sepa_offer(&p.maker).await?;
    p.net.network.set_stalled(&p.maker.address, true);

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let handle = p
        .taker
        .manager
        .check_offer_availability_with_handler(offer, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.cancel();
    settle().await;

    assert!(handle.is_finished());
    assert_ne!(handle.offer_state(), OfferState::MakerOffline);
    assert_eq!(handle.outcome().await, Err(AvailabilityError::Cancelled));
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn outdated_peer_is_ignored_before_any_signing() -> anyhow::Result<()> {
    let net = TestNet::new()?;
    let _agent = net.node(AGENT)?;
    let maker = net.node("maker.onion:1")?;
    let outdated = EngineConfig {
        protocol_version: 3,
        min_protocol_version: 3,
        ..net.config("taker.onion:1")
    };
    let taker = net.node_with("taker.onion:1", outdated)?;
    let offer = maker
        .manager
        .place_offer(
            maker.offer(Direction::Sell, PaymentMethod::Sepa, false)?,
            maker.account(PaymentMethod::Sepa),
        )
        .await?;

    let handle = taker.manager.check_offer_availability(offer);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(matches!(handle.outcome().await, Err(AvailabilityError::Timeout(_))));
    assert_eq!(net.network.delivered("OfferAvailabilityRequest"), 1);
    assert_eq!(net.network.delivered("OfferAvailabilityResponse"), 0);
    assert!(maker.manager.trades().is_empty());
    assert_eq!(maker.wallet.broadcast_count(TxKind::Deposit), 0);
    Ok(())
}

#[tokio::test]
async fn availability_reports_offline_maker() -> anyhow::Result<()> {
    let p = parties()?;
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::Sepa, false)?,
            p.maker.account(PaymentMethod::Sepa),
        )
        .await?;
    p.net.network.set_offline(&p.maker.address, true);

    let result = p.taker.manager.check_offer_availability(offer).outcome().await;

    assert!(matches!(result, Err(AvailabilityError::Transport(_))));
    Ok(())
}

#[tokio::test]
async fn maker_with_pending_transactions_refuses() -> anyhow::Result<()> {
    let p = parties()?;
    p.maker.wallet.set_unconfirmed(11);

    let result = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::Sepa, false)?,
            p.maker.account(PaymentMethod::Sepa),
        )
        .await;

    match result {
        Err(TradeError::TaskFailed { task, reason }) => {
            assert_eq!(task, "create_maker_fee_tx");
            assert!(reason.contains("too many unconfirmed transactions"), "{reason}");
        }
        other => bail!("placement should have been refused, got {other:?}"),
    }
    assert!(p.maker.wallet.broadcasts().is_empty());

    // an offer placed earlier is answered with a rejection instead
    p.maker.wallet.set_unconfirmed(0);
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::Sepa, false)?,
            p.maker.account(PaymentMethod::Sepa),
        )
        .await?;
    p.maker.wallet.set_unconfirmed(11);
    let result = p.taker.manager.check_offer_availability(offer).outcome().await;
    assert!(matches!(result, Err(AvailabilityError::Rejected(reason)) if reason.contains("UnconfTxLimitHit")));
    Ok(())
}

#[tokio::test]
async fn taken_offer_is_no_longer_available() -> anyhow::Result<()> {
    let p = parties()?;
    let (maker_trade, _taker_trade) = trade_to_deposit(&p, Direction::Sell, false).await?;
    let offer = maker_trade.snapshot().offer;
    assert_eq!(
        p.maker.manager.open_offer(&offer.id).map(|o| o.offer.state),
        Some(OfferState::NotAvailable)
    );

    let second_taker = p.net.node("late.onion:1")?;
    let result = second_taker.manager.check_offer_availability(offer).outcome().await;

    assert!(matches!(result, Err(AvailabilityError::Rejected(reason)) if reason.contains("OfferTaken")));
    Ok(())
}

// SECTION: delivery and recovery

#[tokio::test]
async fn redelivered_messages_are_ignored() -> anyhow::Result<()> {
    let p = parties()?;
    let (maker_trade, _taker_trade) = trade_to_deposit(&p, Direction::Sell, false).await?;
    let before = maker_trade.snapshot();

    for kind in ["PayDepositRequest", "DepositTxPublishedMessage"] {
        let (receiver, envelope) = p
            .net
            .network
            .last_delivered(kind)
            .with_context(|| format!("no {kind} was delivered"))?;
        assert_eq!(receiver, p.maker.address);
        p.maker.manager.on_message(envelope).await?;
    }

    let after = maker_trade.snapshot();
    assert_eq!(after.state(), before.state());
    assert_eq!(after.process_model.processed_uids, before.process_model.processed_uids);
    assert_eq!(p.maker.manager.trades().len(), 1);
    Ok(())
}

#[tokio::test]
async fn payment_started_falls_back_to_mailbox() -> anyhow::Result<()> {
    let p = parties()?;
    let (maker_trade, taker_trade) = trade_to_deposit(&p, Direction::Sell, false).await?;
    maker_trade.confirm_deposit().await?;
    taker_trade.confirm_deposit().await?;

    p.net.network.fail_kind("PaymentStartedMessage");
    taker_trade.confirm_payment_started().await?;

    assert_eq!(
        taker_trade.snapshot().state(),
        TradeState::BuyerStoredInMailboxPaymentStartedMsg
    );
    assert_eq!(maker_trade.snapshot().state(), TradeState::DepositConfirmedInBlockChain);
    assert_eq!(p.net.mailbox.pending_for(&p.maker.keys()), 1);

    p.net.network.restore_kind("PaymentStartedMessage");
    assert_eq!(p.maker.manager.process_mailbox().await?, 1);
    assert_eq!(maker_trade.snapshot().state(), TradeState::SellerReceivedPaymentStartedMsg);
    assert_eq!(p.net.mailbox.pending_for(&p.maker.keys()), 0);

    maker_trade.confirm_payment_received().await?;
    wait_until(&taker_trade, |t| t.state() == TradeState::Completed).await?;
    Ok(())
}

#[tokio::test]
async fn trade_resumes_after_restart() -> anyhow::Result<()> {
    let p = parties()?;
    let trade_id = {
        let (maker_trade, _taker_trade) = trade_to_deposit(&p, Direction::Sell, false).await?;
        maker_trade.id().clone()
    };
    p.maker.manager.flush().await?;

    let Parties {
        net,
        agent: _agent,
        maker,
        taker,
    } = p;
    let offer_id = maker
        .manager
        .trade(&trade_id)
        .context("maker trade missing")?
        .snapshot()
        .offer
        .id;
    let maker = net.restart(maker)?;

    let maker_trade = maker.manager.trade(&trade_id).context("trade was not restored")?;
    assert_eq!(maker_trade.snapshot().state(), TradeState::MakerReceivedDepositTxPublishedMsg);
    assert_eq!(
        maker.manager.open_offer(&offer_id).map(|o| o.offer.state),
        Some(OfferState::NotAvailable)
    );

    let taker_trade = taker.manager.trade(&trade_id).context("taker trade missing")?;
    maker_trade.confirm_deposit().await?;
    taker_trade.confirm_deposit().await?;
    taker_trade.confirm_payment_started().await?;
    wait_until(&maker_trade, |t| t.state() == TradeState::SellerReceivedPaymentStartedMsg).await?;
    maker_trade.confirm_payment_received().await?;
    wait_until(&taker_trade, |t| t.state() == TradeState::Completed).await?;
    Ok(())
}

// SECTION: failures and disputes

#[tokio::test]
async fn failure_before_deposit_fails_the_trade() -> anyhow::Result<()> {
    let p = parties()?;
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::Sepa, false)?,
            p.maker.account(PaymentMethod::Sepa),
        )
        .await?;
    let available = p.taker.manager.check_offer_availability(offer).outcome().await?;
    p.taker.wallet.set_fail_broadcast(true);

    let result = p
        .taker
        .manager
        .take_offer(available, Coin(800_000), p.taker.account(PaymentMethod::Sepa))
        .await;

    assert!(matches!(
        result,
        Err(TradeError::TaskFailed {
            task: "create_taker_fee_tx",
            ..
        })
    ));
    let trade = p.taker.manager.trades().first().context("no trade")?.snapshot();
    assert_eq!(trade.state(), TradeState::Failed(Phase::Init));
    assert_eq!(trade.dispute_state(), DisputeState::NoDispute);
    assert!(trade.error_message().is_some_and(|e| e.contains("no peers")));

    p.taker.manager.flush().await?;
    let records = p.taker.services().persistence.manager();
    assert!(records.read_bytes(&format!("failed_{}", trade.id))?.is_some());
    Ok(())
}

#[tokio::test]
async fn dispute_needs_a_published_deposit() -> anyhow::Result<()> {
    let p = parties()?;
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::Sepa, false)?,
            p.maker.account(PaymentMethod::Sepa),
        )
        .await?;
    let available = p.taker.manager.check_offer_availability(offer).outcome().await?;
    p.net.network.set_muted(&p.maker.address, true);
    let taker_trade = p
        .taker
        .manager
        .take_offer(available, Coin(800_000), p.taker.account(PaymentMethod::Sepa))
        .await?;

    let result = taker_trade.open_dispute("maker went quiet").await;

    assert!(matches!(
        result,
        Err(TradeError::DisputeNotAllowed(Phase::TakerFeePublished))
    ));
    assert_eq!(taker_trade.snapshot().dispute_state(), DisputeState::NoDispute);
    Ok(())
}

#[tokio::test]
async fn send_failure_after_deposit_opens_dispute() -> anyhow::Result<()> {
    let p = parties()?;
    let offer = p
        .maker
        .manager
        .place_offer(
            p.maker.offer(Direction::Sell, PaymentMethod::Sepa, false)?,
            p.maker.account(PaymentMethod::Sepa),
        )
        .await?;
    let available = p.taker.manager.check_offer_availability(offer).outcome().await?;
    p.net.network.fail_kind("DepositTxPublishedMessage");
    p.net.mailbox.set_failing(true);

    let taker_trade = p
        .taker
        .manager
        .take_offer(available, Coin(800_000), p.taker.account(PaymentMethod::Sepa))
        .await?;
    let trade = wait_until(&taker_trade, |t| t.dispute_state() == DisputeState::RefundRequested).await?;

    // funds are locked, so the trade is escalated rather than failed
    assert_eq!(trade.state(), TradeState::TakerSendFailedDepositTxPublishedMsg);
    assert!(
        trade
            .error_message()
            .is_some_and(|e| e.contains("send_deposit_tx_published_message"))
    );
    assert_eq!(p.net.network.delivered("OpenDisputeMessage"), 1);

    let maker_trade = trade_handle(&p.maker, taker_trade.id()).await?;
    wait_until(&maker_trade, |t| {
        t.dispute_state() == DisputeState::RefundRequestStartedByPeer
    })
    .await?;

    // refund agent decides, both traders close
    p.net.mailbox.set_failing(false);
    p.taker.manager.flush().await?;
    for _ in 0..500 {
        if !p.agent.manager.received_disputes(taker_trade.id()).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    p.agent
        .manager
        .close_dispute(taker_trade.id(), Coin(800_000), Coin(240_000), "buyer gets the trade amount")
        .await?;

    wait_until(&taker_trade, |t| t.state() == TradeState::DisputeClosed).await?;
    wait_until(&maker_trade, |t| t.state() == TradeState::DisputeClosed).await?;
    assert_eq!(
        taker_trade.snapshot().dispute_state(),
        DisputeState::RefundRequestClosed
    );

    p.taker.manager.flush().await?;
    let dispute: Dispute = p
        .taker
        .services()
        .persistence
        .manager()
        .read(&dispute_record_name(taker_trade.id()))?
        .context("dispute record missing")?;
    assert!(dispute.closed);
    assert_eq!(dispute.summary.as_deref(), Some("buyer gets the trade amount"));
    Ok(())
}

/// Take a SEPA sell offer while neither the DepositTxPublishedMessage nor the
/// taker's dispute notice can reach the maker, directly or by mailbox.
async fn lose_deposit_published_message(p: &Parties) -> anyhow::Result<(TradeHandle, Trade)> {
    let offer = place_sepa_offer(&p.maker).await?;
    let available = p.taker.manager.check_offer_availability(offer).outcome().await?;
    p.net.network.fail_kind("DepositTxPublishedMessage");
    p.net.network.fail_kind("PeerOpenedDisputeMessage");
    p.net.mailbox.set_failing(true);

    let taker_trade = p
        .taker
        .manager
        .take_offer(available, Coin(800_000), p.taker.account(PaymentMethod::Sepa))
        .await?;
    let taker = wait_until(&taker_trade, |t| t.dispute_state() == DisputeState::RefundRequested).await?;
    assert_eq!(p.taker.wallet.broadcast_count(TxKind::Deposit), 1);

    let maker_trade = trade_handle(&p.maker, taker_trade.id()).await?;
    let maker = wait_until(&maker_trade, |t| {
        t.state() == TradeState::MakerSawArrivedPublishDepositTxRequest
    })
    .await?;
    assert_eq!(maker.dispute_state(), DisputeState::NoDispute);
    assert!(!maker.is_deposit_published());
    Ok((maker_trade, taker))
}

#[tokio::test]
async fn maker_finds_deposit_in_wallet_when_message_is_lost() -> anyhow::Result<()> {
    let p = parties()?;
    let (maker_trade, taker) = lose_deposit_published_message(&p).await?;
    assert!(matches!(
        maker_trade.confirm_deposit().await,
        Err(TradeError::InvalidTransition { .. })
    ));

    let deposit_tx_id = taker
        .process_model
        .deposit_tx_id
        .clone()
        .context("taker has no deposit tx")?;
    assert!(!p.maker.manager.on_deposit_tx_seen(&TxId::from("unrelated"), false).await?);
    assert!(p.maker.manager.on_deposit_tx_seen(&deposit_tx_id, false).await?);

    let maker = maker_trade.snapshot();
    assert_eq!(maker.state(), TradeState::MakerSawDepositTxInWallet);
    assert_eq!(maker.phase(), Phase::DepositPublished);
    assert_eq!(maker.process_model.deposit_tx_id.as_ref(), Some(&deposit_tx_id));

    p.maker.manager.on_deposit_tx_seen(&deposit_tx_id, true).await?;
    assert_eq!(maker_trade.snapshot().state(), TradeState::DepositConfirmedInBlockChain);
    Ok(())
}

#[tokio::test]
async fn maker_can_dispute_once_deposit_inputs_are_sent() -> anyhow::Result<()> {
    let p = parties()?;
    let (maker_trade, _) = lose_deposit_published_message(&p).await?;

    maker_trade.open_dispute("taker went quiet after the deposit request").await?;

    let maker = maker_trade.snapshot();
    assert_eq!(maker.dispute_state(), DisputeState::RefundRequested);
    assert_eq!(maker.state(), TradeState::MakerSawArrivedPublishDepositTxRequest);
    assert_eq!(p.net.network.delivered("OpenDisputeMessage"), 2);
    Ok(())
}

#[tokio::test]
async fn trade_period_over_escalates_to_dispute() -> anyhow::Result<()> {
    let p = parties()?;
    let (maker_trade, taker_trade) = trade_to_deposit(&p, Direction::Sell, false).await?;
    maker_trade.confirm_deposit().await?;
    taker_trade.confirm_deposit().await?;

    // SEPA allows six days
    taker_trade.check_trade_period(TimeStamp::new().plus(DAY * 4)).await?;
    let trade = taker_trade.snapshot();
    assert_eq!(trade.period_state(), TradePeriodState::SecondHalf);
    assert_eq!(trade.dispute_state(), DisputeState::NoDispute);

    taker_trade.check_trade_period(TimeStamp::new().plus(DAY * 7)).await?;
    let trade = taker_trade.snapshot();
    assert_eq!(trade.period_state(), TradePeriodState::TradePeriodOver);
    assert_eq!(trade.dispute_state(), DisputeState::RefundRequested);
    assert_eq!(trade.state(), TradeState::DepositConfirmedInBlockChain);

    // already escalated, a second check does not open another dispute
    taker_trade.check_trade_period(TimeStamp::new().plus(DAY * 8)).await?;
    assert_eq!(p.net.network.delivered("OpenDisputeMessage"), 1);
    Ok(())
}
