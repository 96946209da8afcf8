//! Messaging port and the dispatcher built on top of it.
//!
//! The port sends one encrypted envelope and reports arrival or fault through
//! a [`DeliveryListener`]. The listener is consumed by either report, so a
//! second report for the same send can not be expressed.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::TradeError;
use crate::mailbox::{MailboxItem, MailboxStore};
use crate::message::{NetworkEnvelope, Payload};
use crate::types::{NodeAddress, PubKeyRing};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Arrived,
    Fault(String),
}

/// Completion side of one send.
#[derive(Debug)]
pub struct DeliveryListener {
    tx: oneshot::Sender<Delivery>,
}

/// Waiting side of one send.
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<Delivery>,
}

impl DeliveryListener {
    pub fn new() -> (DeliveryListener, DeliveryReceipt) {
        let (tx, rx) = oneshot::channel();
        (DeliveryListener { tx }, DeliveryReceipt { rx })
    }

    pub fn on_arrived(self) {
        self.report(Delivery::Arrived);
    }

    pub fn on_fault(self, reason: impl Into<String>) {
        self.report(Delivery::Fault(reason.into()));
    }

    fn report(self, delivery: Delivery) {
        if let Err(late) = self.tx.send(delivery) {
            // the waiting task already gave up, late reports are ignored
            debug!(delivery = ?late, "ignoring delivery report after the sender stopped waiting");
        }
    }
}

impl DeliveryReceipt {
    pub async fn wait(self) -> Delivery {
        self.rx
            .await
            .unwrap_or_else(|_| Delivery::Fault("messaging port dropped the delivery listener".into()))
    }
}

pub trait MessagingPort: Send + Sync {
    /// Fire one send. Must report through `listener` at most once and never retry.
    fn send_encrypted_direct_message(
        &self,
        peer: &NodeAddress,
        peer_keys: &PubKeyRing,
        envelope: NetworkEnvelope,
        listener: DeliveryListener,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Arrived,
    StoredInMailbox,
}

/// Wraps payloads into envelopes and sends them, falling back to the mailbox.
#[derive(Clone)]
pub struct MessageDispatcher {
    port: Arc<dyn MessagingPort>,
    mailbox: Arc<dyn MailboxStore>,
    my_address: NodeAddress,
    my_keys: PubKeyRing,
    protocol_version: u32,
    mailbox_ttl: Duration,
}

impl MessageDispatcher {
    pub fn new(
        port: Arc<dyn MessagingPort>,
        mailbox: Arc<dyn MailboxStore>,
        my_address: NodeAddress,
        my_keys: PubKeyRing,
        protocol_version: u32,
        mailbox_ttl: Duration,
    ) -> Self {
        Self {
            port,
            mailbox,
            my_address,
            my_keys,
            protocol_version,
            mailbox_ttl,
        }
    }

    pub fn my_address(&self) -> &NodeAddress {
        &self.my_address
    }

    pub fn my_keys(&self) -> &PubKeyRing {
        &self.my_keys
    }

    pub fn mailbox(&self) -> &Arc<dyn MailboxStore> {
        &self.mailbox
    }

    pub fn envelope(&self, payload: Payload) -> NetworkEnvelope {
        NetworkEnvelope::new(
            self.protocol_version,
            self.my_address.clone(),
            self.my_keys.clone(),
            payload,
        )
    }

    async fn send_envelope(&self, peer: &NodeAddress, peer_keys: &PubKeyRing, envelope: NetworkEnvelope) -> Delivery {
        let (listener, receipt) = DeliveryListener::new();
        self.port
            .send_encrypted_direct_message(peer, peer_keys, envelope, listener);
        receipt.wait().await
    }

    /// Direct send only; a fault is a transport error.
    pub async fn send_direct(
        &self,
        peer: &NodeAddress,
        peer_keys: &PubKeyRing,
        payload: Payload,
    ) -> Result<(), TradeError> {
        let kind = payload.kind();
        let envelope = self.envelope(payload);
        debug!(%peer, message = kind, uid = %envelope.uid, "sending direct message");
        match self.send_envelope(peer, peer_keys, envelope).await {
            Delivery::Arrived => {
                info!(%peer, message = kind, "message arrived at peer");
                Ok(())
            }
            Delivery::Fault(reason) => {
                warn!(%peer, message = kind, %reason, "sending message failed");
                Err(TradeError::Transport(format!("{kind} to {peer}: {reason}")))
            }
        }
    }

    /// Direct send, stored in the peer's mailbox if the peer is unreachable.
    pub async fn send_mailbox_message(
        &self,
        peer: &NodeAddress,
        peer_keys: &PubKeyRing,
        payload: Payload,
    ) -> Result<SendOutcome, TradeError> {
        let kind = payload.kind();
        let envelope = self.envelope(payload);
        let item = MailboxItem::new(&envelope, peer_keys, self.mailbox_ttl)?;
        match self.send_envelope(peer, peer_keys, envelope).await {
            Delivery::Arrived => {
                info!(%peer, message = kind, "message arrived at peer");
                Ok(SendOutcome::Arrived)
            }
            Delivery::Fault(reason) => {
                info!(%peer, message = kind, %reason, "peer unreachable, storing message in mailbox");
                match self.mailbox.store(&self.my_keys, item) {
                    Ok(()) => Ok(SendOutcome::StoredInMailbox),
                    Err(e) => {
                        warn!(%peer, message = kind, error = %e, "storing mailbox message failed");
                        Err(TradeError::Transport(format!(
                            "{kind} to {peer}: {reason}; mailbox: {e}"
                        )))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_reports_once() {
        let (listener, receipt) = DeliveryListener::new();
        listener.on_fault("peer offline");

        assert_eq!(receipt.wait().await, Delivery::Fault("peer offline".into()));
    }

    #[tokio::test]
    async fn dropped_listener_is_a_fault() {
        let (listener, receipt) = DeliveryListener::new();
        drop(listener);

        assert!(matches!(receipt.wait().await, Delivery::Fault(_)));
    }

    #[test]
    fn late_arrival_after_receipt_dropped_is_ignored() {
        let (listener, receipt) = DeliveryListener::new();
        drop(receipt);
        // must not panic
        listener.on_arrived();
    }
}
