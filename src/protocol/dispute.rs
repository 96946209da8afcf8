//! Dispute escalation: refund agent selection, the dispute record, and the
//! tasks that open a dispute once funds are locked.
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::capabilities::Capabilities;
use crate::error::TradeError;
use crate::message::{DisputeResultMessage, OpenDisputeMessage, Payload, PeerOpenedDisputeMessage};
use crate::messaging::SendOutcome;
use crate::task::{Step, TaskOutcome};
use crate::trade::{DisputeState, SignedContract};
use crate::types::{NodeAddress, PubKeyRing, TimeStamp, TradeId, TxId};
use crate::utils;

use super::{ServiceProvider, TradeModel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundAgent {
    pub node: NodeAddress,
    pub pub_key_ring: PubKeyRing,
    pub capabilities: Capabilities,
}

/// Refund agents known to this node. Loaded once from config.
#[derive(Debug, Clone, Default)]
pub struct RefundAgentRegistry {
    agents: Vec<RefundAgent>,
}

impl RefundAgentRegistry {
    pub fn new(agents: Vec<RefundAgent>) -> Self {
        Self { agents }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, node: &NodeAddress) -> Option<&RefundAgent> {
        self.agents.iter().find(|agent| &agent.node == node)
    }

    /// Deterministic choice among agents supporting `required`, keyed by `seed`.
    pub fn select(&self, required: Capabilities, seed: &[u8]) -> Option<&RefundAgent> {
        let candidates: Vec<&RefundAgent> = self
            .agents
            .iter()
            .filter(|agent| agent.capabilities.contains_all(required))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let digest = utils::sha256_bytes(seed);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let index = u64::from_be_bytes(prefix) % candidates.len() as u64;
        candidates.get(index as usize).copied()
    }
}

/// What the refund agent gets to decide on.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DisputeEvidence {
    #[n(0)]
    pub contract: Option<SignedContract>,
    #[n(1)]
    pub deposit_tx_id: Option<TxId>,
    #[n(2)]
    pub payout_tx_id: Option<TxId>,
    #[n(3)]
    pub trade_state: String,
    #[n(4)]
    pub error_message: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Dispute {
    #[n(0)]
    pub trade_id: TradeId,
    #[n(1)]
    pub trader_node: NodeAddress,
    #[n(2)]
    pub trader_pub_key_ring: PubKeyRing,
    #[n(3)]
    pub refund_agent: NodeAddress,
    #[n(4)]
    pub opener_is_buyer: bool,
    #[n(5)]
    pub opener_is_maker: bool,
    #[n(6)]
    pub reason: String,
    #[n(7)]
    pub evidence: DisputeEvidence,
    #[n(8)]
    pub opened_at: TimeStamp<Utc>,
    #[n(9)]
    pub closed: bool,
    #[n(10)]
    pub summary: Option<String>,
}

impl Dispute {
    pub fn record_name(&self) -> String {
        dispute_record_name(&self.trade_id)
    }
}

pub fn dispute_record_name(trade_id: &TradeId) -> String {
    format!("dispute_{trade_id}")
}

pub fn open_dispute_tasks() -> Vec<DisputeStep> {
    vec![
        DisputeStep::SelectRefundAgent,
        DisputeStep::CreateDispute,
        DisputeStep::SendOpenDisputeMessage,
        DisputeStep::NotifyPeer,
    ]
}

/// Mark the stored dispute closed with the agent's summary.
pub fn close_dispute_record(services: &ServiceProvider, result: &DisputeResultMessage) {
    let name = dispute_record_name(&result.trade_id);
    match services.persistence.manager().read::<Dispute>(&name) {
        Ok(Some(mut dispute)) => {
            dispute.closed = true;
            dispute.summary = Some(result.summary.clone());
            services.persistence.request_persistence(name, &dispute);
        }
        Ok(None) => info!(trade_id = %result.trade_id.short(), "dispute closed without a local dispute record"),
        Err(e) => error!(trade_id = %result.trade_id.short(), error = %e, "failed to read dispute record"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeStep {
    SelectRefundAgent,
    CreateDispute,
    SendOpenDisputeMessage,
    NotifyPeer,
}

#[async_trait]
impl Step<TradeModel> for DisputeStep {
    fn name(&self) -> &'static str {
        match self {
            DisputeStep::SelectRefundAgent => "select_refund_agent",
            DisputeStep::CreateDispute => "create_dispute",
            DisputeStep::SendOpenDisputeMessage => "send_open_dispute_message",
            DisputeStep::NotifyPeer => "notify_peer_of_dispute",
        }
    }

    async fn run(self, model: &mut TradeModel, outcome: &mut TaskOutcome) {
        let result = match self {
            DisputeStep::SelectRefundAgent => select_refund_agent(model),
            DisputeStep::CreateDispute => create_dispute(model),
            DisputeStep::SendOpenDisputeMessage => send_open_dispute_message(model).await,
            DisputeStep::NotifyPeer => notify_peer(model).await,
        };
        let _ = outcome.settle(result);
    }
}

fn select_refund_agent(model: &mut TradeModel) -> Result<(), TradeError> {
    let registry = &model.services.refund_agents;
    let trade = &mut model.trade;
    let known = trade.refund_agent.as_ref().and_then(|node| registry.get(node));
    if known.is_some() {
        return Ok(());
    }
    let agent = registry
        .select(Capabilities::default(), trade.id.as_str().as_bytes())
        .ok_or(TradeError::NoRefundAgent)?;
    warn!(trade_id = %trade.id.short(), agent = %agent.node, "trade had no usable refund agent, selected one");
    trade.refund_agent = Some(agent.node.clone());
    Ok(())
}

fn create_dispute(model: &mut TradeModel) -> Result<(), TradeError> {
    let trade = &model.trade;
    let refund_agent = trade.refund_agent.clone().ok_or(TradeError::NoRefundAgent)?;
    let pm = &trade.process_model;
    let dispute = Dispute {
        trade_id: trade.id.clone(),
        trader_node: model.services.my_address().clone(),
        trader_pub_key_ring: model.services.my_keys().clone(),
        refund_agent,
        opener_is_buyer: trade.is_buyer(),
        opener_is_maker: trade.is_maker(),
        reason: model
            .dispute_reason
            .clone()
            .unwrap_or_else(|| "Trader requested a dispute".to_owned()),
        evidence: DisputeEvidence {
            contract: trade.contract.clone(),
            deposit_tx_id: pm.deposit_tx_id.clone(),
            payout_tx_id: pm.payout_tx_id.clone(),
            trade_state: trade.state().to_string(),
            error_message: trade.error_message().map(str::to_owned),
        },
        opened_at: TimeStamp::new(),
        closed: false,
        summary: None,
    };
    model
        .services
        .persistence
        .request_persistence(dispute.record_name(), &dispute);
    model.dispute = Some(dispute);
    Ok(())
}

async fn send_open_dispute_message(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let dispute = model
        .dispute
        .clone()
        .ok_or(TradeError::TaskFailed {
            task: "send_open_dispute_message",
            reason: "no dispute created".into(),
        })?;
    let agent = services
        .refund_agents
        .get(&dispute.refund_agent)
        .ok_or(TradeError::NoRefundAgent)?;
    let outcome = services
        .dispatcher
        .send_mailbox_message(
            &agent.node,
            &agent.pub_key_ring,
            Payload::OpenDispute(OpenDisputeMessage { dispute }),
        )
        .await?;
    info!(trade_id = %model.trade.id.short(), agent = %agent.node, ?outcome, "dispute sent to refund agent");
    model.trade.set_dispute_state(DisputeState::RefundRequested);
    Ok(())
}

/// Best effort; the dispute is open whether or not the peer hears about it.
async fn notify_peer(model: &mut TradeModel) -> Result<(), TradeError> {
    let services = model.services.clone();
    let trade = &mut model.trade;
    let Some(refund_agent) = trade.refund_agent.clone() else {
        return Ok(());
    };
    let peer = trade.process_model.peer.clone();
    let payload = Payload::PeerOpenedDispute(PeerOpenedDisputeMessage {
        trade_id: trade.id.clone(),
        refund_agent,
        reason: model.dispute_reason.clone().unwrap_or_default(),
    });
    match services
        .dispatcher
        .send_mailbox_message(&peer.node, &peer.pub_key_ring, payload)
        .await
    {
        Ok(SendOutcome::Arrived) | Ok(SendOutcome::StoredInMailbox) => {}
        Err(e) => {
            warn!(trade_id = %trade.id.short(), error = %e, "could not notify peer of dispute");
            trade.append_error_message(&format!("Peer was not notified of the dispute: {e}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capability;

    fn agent(name: &str, capabilities: Capabilities) -> RefundAgent {
        RefundAgent {
            node: name.into(),
            pub_key_ring: PubKeyRing::new(name.as_bytes().to_vec(), vec![0]),
            capabilities,
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let registry = RefundAgentRegistry::new(vec![
            agent("a.onion:1", Capabilities::default()),
            agent("b.onion:1", Capabilities::default()),
            agent("c.onion:1", Capabilities::default()),
        ]);

        let first = registry.select(Capabilities::default(), b"offer_1").unwrap();
        let second = registry.select(Capabilities::default(), b"offer_1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn selection_honours_required_capabilities() {
        let v5 = Capabilities::default().with(Capability::ProtocolV5);
        let registry = RefundAgentRegistry::new(vec![
            agent("old.onion:1", Capabilities::default()),
            agent("new.onion:1", v5),
        ]);

        for seed in [&b"x"[..], b"y", b"z", b"w"] {
            assert_eq!(registry.select(v5, seed).unwrap().node, "new.onion:1".into());
        }
        assert!(RefundAgentRegistry::default().select(v5, b"x").is_none());
    }
}
