//! Offline mailbox: ownership scoped storage with a time-to-live.
//!
//! Entries are added by the sender's key and removed only by the receiver's
//! key. Purging expired entries is the store's job, not the trade engine's.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{CodecError, MailboxError};
use crate::message::NetworkEnvelope;
use crate::types::{PubKeyRing, TimeStamp, Uid};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct MailboxItem {
    #[n(0)]
    pub uid: Uid,
    #[n(1)]
    pub sender_pub_key: Vec<u8>,
    #[n(2)]
    pub receiver_pub_key: Vec<u8>,
    #[n(3)]
    pub created_at: TimeStamp<Utc>,
    #[n(4)]
    pub ttl_ms: u64,
    /// Encoded [`NetworkEnvelope`].
    #[n(5)]
    pub envelope: Vec<u8>,
}

impl MailboxItem {
    pub fn new(
        envelope: &NetworkEnvelope,
        receiver: &PubKeyRing,
        ttl: Duration,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            uid: envelope.uid.clone(),
            sender_pub_key: envelope.sender_pub_key_ring.signature_pub_key.clone(),
            receiver_pub_key: receiver.signature_pub_key.clone(),
            created_at: TimeStamp::new(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            envelope: envelope.to_bytes()?,
        })
    }

    pub fn is_expired(&self, now: &TimeStamp<Utc>) -> bool {
        let age = now.since(&self.created_at);
        age > Duration::from_millis(self.ttl_ms)
    }

    pub fn decode_envelope(&self) -> Result<NetworkEnvelope, CodecError> {
        NetworkEnvelope::from_bytes(&self.envelope)
    }
}

pub trait MailboxStore: Send + Sync {
    /// `owner` must be the sender of `item`.
    fn store(&self, owner: &PubKeyRing, item: MailboxItem) -> Result<(), MailboxError>;

    /// `owner` must be the receiver. Returns whether an entry was removed.
    fn remove(&self, owner: &PubKeyRing, uid: &Uid) -> Result<bool, MailboxError>;

    /// Unexpired entries addressed to `receiver`, oldest first.
    fn items_for(&self, receiver: &PubKeyRing) -> Result<Vec<MailboxItem>, MailboxError>;

    fn purge_expired(&self, now: &TimeStamp<Utc>) -> Result<usize, MailboxError>;
}

/// Mailbox kept in a sled tree, keyed by message uid.
#[derive(Clone)]
pub struct SledMailboxStore {
    tree: sled::Tree,
}

impl SledMailboxStore {
    pub fn new(db: Arc<sled::Db>) -> Result<Self, MailboxError> {
        Ok(Self {
            tree: db.open_tree("mailbox")?,
        })
    }

    fn decode(bytes: &[u8]) -> Result<MailboxItem, MailboxError> {
        minicbor::decode(bytes).map_err(|e| {
            MailboxError::Codec(CodecError::Decode {
                what: "mailbox item",
                reason: e.to_string(),
            })
        })
    }

    fn all(&self) -> Result<Vec<MailboxItem>, MailboxError> {
        self.tree
            .iter()
            .map(|entry| {
                let (_, value) = entry?;
                Self::decode(&value)
            })
            .collect()
    }
}

impl MailboxStore for SledMailboxStore {
    fn store(&self, owner: &PubKeyRing, item: MailboxItem) -> Result<(), MailboxError> {
        if owner.signature_pub_key != item.sender_pub_key {
            return Err(MailboxError::NotSender);
        }
        let bytes = minicbor::to_vec(&item).map_err(|e| {
            MailboxError::Codec(CodecError::Encode {
                what: "mailbox item",
                reason: e.to_string(),
            })
        })?;
        self.tree.insert(item.uid.as_str().as_bytes(), bytes)?;
        debug!(uid = %item.uid, "stored mailbox item");
        Ok(())
    }

    fn remove(&self, owner: &PubKeyRing, uid: &Uid) -> Result<bool, MailboxError> {
        let Some(bytes) = self.tree.get(uid.as_str().as_bytes())? else {
            return Ok(false);
        };
        let item = Self::decode(&bytes)?;
        if owner.signature_pub_key != item.receiver_pub_key {
            return Err(MailboxError::NotReceiver);
        }
        self.tree.remove(uid.as_str().as_bytes())?;
        debug!(%uid, "removed mailbox item");
        Ok(true)
    }

    fn items_for(&self, receiver: &PubKeyRing) -> Result<Vec<MailboxItem>, MailboxError> {
        let now = TimeStamp::new();
        let mut items: Vec<MailboxItem> = self
            .all()?
            .into_iter()
            .filter(|item| item.receiver_pub_key == receiver.signature_pub_key)
            .filter(|item| !item.is_expired(&now))
            .collect();
        items.sort_by_key(|item| item.created_at.as_millis());
        Ok(items)
    }

    fn purge_expired(&self, now: &TimeStamp<Utc>) -> Result<usize, MailboxError> {
        let mut purged = 0;
        for item in self.all()?.into_iter().filter(|item| item.is_expired(now)) {
            self.tree.remove(item.uid.as_str().as_bytes())?;
            purged += 1;
        }
        if purged > 0 {
            info!(purged, "purged expired mailbox items");
        }
        Ok(purged)
    }
}
