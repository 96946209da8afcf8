//! In-process network of trading nodes with deterministic wallet and keys.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::{TempDir, tempdir};

use trade_engine::TradeManager;
use trade_engine::config::{EngineConfig, RefundAgentConfig};
use trade_engine::error::{MailboxError, WalletError};
use trade_engine::mailbox::{MailboxItem, MailboxStore, SledMailboxStore};
use trade_engine::message::NetworkEnvelope;
use trade_engine::messaging::{DeliveryListener, MessagingPort};
use trade_engine::offer::{Offer, OfferBuilder, PaymentAccount, PaymentMethod};
use trade_engine::persistence::{PersistenceHandle, PersistenceManager};
use trade_engine::protocol::{Collaborators, ServiceProvider};
use trade_engine::types::{Coin, Direction, NodeAddress, PubKeyRing, TimeStamp, TradeId, TxId, Uid};
use trade_engine::utils;
use trade_engine::wallet::{
    AccountAgeWitnessPort, AddressPurpose, KeyEntry, KeyRing, PreparedTx, TxKind, TxRequest, WalletPort,
};

pub const AGENT: &str = "agent.onion:9999";

// SECTION: network

/// Delivers envelopes between managers registered on it.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: Mutex<HashMap<NodeAddress, Weak<TradeManager>>>,
    offline: Mutex<HashSet<NodeAddress>>,
    muted: Mutex<HashSet<NodeAddress>>,
    failing_kinds: Mutex<HashSet<&'static str>>,
    stalled: Mutex<HashSet<NodeAddress>>,
    // listeners of stalled sends, kept so they never report
    held: Mutex<Vec<DeliveryListener>>,
    delivered: Mutex<Vec<(NodeAddress, NetworkEnvelope)>>,
}

impl LoopbackNetwork {
    pub fn register(&self, address: &NodeAddress, manager: &Arc<TradeManager>) {
        self.nodes.lock().insert(address.clone(), Arc::downgrade(manager));
    }

    pub fn set_offline(&self, address: &NodeAddress, offline: bool) {
        let mut nodes = self.offline.lock();
        if offline {
            nodes.insert(address.clone());
        } else {
            nodes.remove(address);
        }
    }

    /// Sends to `address` arrive but are never processed.
    pub fn set_muted(&self, address: &NodeAddress, muted: bool) {
        let mut nodes = self.muted.lock();
        if muted {
            nodes.insert(address.clone());
        } else {
            nodes.remove(address);
        }
    }

    /// Sends to `address` never report arrival or fault.
    pub fn set_stalled(&self, address: &NodeAddress, stalled: bool) {
        let mut nodes = self.stalled.lock();
        if stalled {
            nodes.insert(address.clone());
        } else {
            nodes.remove(address);
            self.held.lock().clear();
        }
    }

    /// Every direct send of this message kind faults.
    pub fn fail_kind(&self, kind: &'static str) {
        self.failing_kinds.lock().insert(kind);
    }

    pub fn restore_kind(&self, kind: &'static str) {
        self.failing_kinds.lock().remove(kind);
    }

    pub fn delivered(&self, kind: &str) -> usize {
        self.delivered
            .lock()
            .iter()
            .filter(|(_, envelope)| envelope.payload.kind() == kind)
            .count()
    }

    /// Last delivered envelope of `kind` and its receiver.
    pub fn last_delivered(&self, kind: &str) -> Option<(NodeAddress, NetworkEnvelope)> {
        self.delivered
            .lock()
            .iter()
            .rev()
            .find(|(_, envelope)| envelope.payload.kind() == kind)
            .cloned()
    }
}

impl MessagingPort for LoopbackNetwork {
    fn send_encrypted_direct_message(
        &self,
        peer: &NodeAddress,
        _peer_keys: &PubKeyRing,
        envelope: NetworkEnvelope,
        listener: DeliveryListener,
    ) {
        let kind = envelope.payload.kind();
        if self.stalled.lock().contains(peer) {
            self.held.lock().push(listener);
            return;
        }
        let target = self.nodes.lock().get(peer).and_then(Weak::upgrade);
        let reachable = !self.offline.lock().contains(peer) && !self.failing_kinds.lock().contains(kind);
        let Some(target) = target.filter(|_| reachable) else {
            listener.on_fault(format!("{peer} is not reachable"));
            return;
        };
        self.delivered.lock().push((peer.clone(), envelope.clone()));
        listener.on_arrived();
        if self.muted.lock().contains(peer) {
            return;
        }
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = target.on_message(envelope).await {
                tracing::info!(%peer, message = kind, error = %e, "message rejected");
            }
        });
    }
}

/// Sled mailbox that can be switched to refuse new entries.
pub struct FlakyMailbox {
    inner: SledMailboxStore,
    failing: AtomicBool,
}

impl FlakyMailbox {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn pending_for(&self, receiver: &PubKeyRing) -> usize {
        self.inner.items_for(receiver).map(|items| items.len()).unwrap_or_default()
    }
}

impl MailboxStore for FlakyMailbox {
    fn store(&self, owner: &PubKeyRing, item: MailboxItem) -> Result<(), MailboxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MailboxError::Unavailable("storage nodes unreachable".into()));
        }
        self.inner.store(owner, item)
    }

    fn remove(&self, owner: &PubKeyRing, uid: &Uid) -> Result<bool, MailboxError> {
        self.inner.remove(owner, uid)
    }

    fn items_for(&self, receiver: &PubKeyRing) -> Result<Vec<MailboxItem>, MailboxError> {
        self.inner.items_for(receiver)
    }

    fn purge_expired(&self, now: &TimeStamp<Utc>) -> Result<usize, MailboxError> {
        self.inner.purge_expired(now)
    }
}

// SECTION: wallet and keys

/// Deterministic wallet: tx ids and keys are hashes of their inputs.
pub struct MockWallet {
    name: String,
    unconfirmed: AtomicUsize,
    fail_broadcast: AtomicBool,
    broadcasts: Mutex<Vec<(TxKind, TxId)>>,
}

impl MockWallet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            unconfirmed: AtomicUsize::new(0),
            fail_broadcast: AtomicBool::new(false),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_unconfirmed(&self, count: usize) {
        self.unconfirmed.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_broadcast(&self, fail: bool) {
        self.fail_broadcast.store(fail, Ordering::SeqCst);
    }

    pub fn broadcasts(&self) -> Vec<(TxKind, TxId)> {
        self.broadcasts.lock().clone()
    }

    pub fn broadcast_count(&self, kind: TxKind) -> usize {
        self.broadcasts.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

fn tx_signature(pub_key: &[u8], tx: &PreparedTx) -> Vec<u8> {
    utils::hash_parts(&[b"tx_sig", pub_key, &tx.bytes])
}

#[async_trait]
impl WalletPort for MockWallet {
    fn key_entry(&self, trade_id: &TradeId, purpose: AddressPurpose) -> Result<KeyEntry, WalletError> {
        let seed = format!("{}/{}/{:?}", self.name, trade_id, purpose);
        Ok(KeyEntry {
            purpose,
            pub_key: utils::sha256_bytes(seed.as_bytes()),
            address: format!("{}-{:?}-{}", self.name, purpose, trade_id.short()),
        })
    }

    fn unconfirmed_own_tx_count(&self) -> usize {
        self.unconfirmed.load(Ordering::SeqCst)
    }

    fn build_tx(&self, request: &TxRequest) -> Result<PreparedTx, WalletError> {
        let bytes = minicbor::to_vec(request).map_err(|e| WalletError::Build(e.to_string()))?;
        Ok(PreparedTx {
            id: TxId::new(hex::encode(utils::sha256_bytes(&bytes))),
            kind: request.kind,
            bytes,
        })
    }

    fn swap_inputs(&self, trade_id: &TradeId, amount: Coin) -> Result<Vec<Vec<u8>>, WalletError> {
        Ok(vec![format!("{}/{}/{}", self.name, trade_id, amount).into_bytes()])
    }

    fn sign_tx(&self, key: &KeyEntry, tx: &PreparedTx) -> Result<Vec<u8>, WalletError> {
        Ok(tx_signature(&key.pub_key, tx))
    }

    fn verify_tx_signature(&self, pub_key: &[u8], tx: &PreparedTx, signature: &[u8]) -> bool {
        tx_signature(pub_key, tx) == signature
    }

    async fn broadcast(&self, tx: &PreparedTx, _signatures: &[Vec<u8>]) -> Result<TxId, WalletError> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(WalletError::Broadcast("no peers".into()));
        }
        self.broadcasts.lock().push((tx.kind, tx.id.clone()));
        Ok(tx.id.clone())
    }
}

pub struct MockKeyRing {
    keys: PubKeyRing,
}

impl MockKeyRing {
    pub fn new(name: &str) -> Self {
        Self {
            keys: PubKeyRing::new(
                format!("sig-{name}").into_bytes(),
                format!("enc-{name}").into_bytes(),
            ),
        }
    }
}

fn data_signature(signature_pub_key: &[u8], data: &[u8]) -> Vec<u8> {
    utils::hash_parts(&[b"data_sig", signature_pub_key, data])
}

impl KeyRing for MockKeyRing {
    fn pub_key_ring(&self) -> PubKeyRing {
        self.keys.clone()
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        data_signature(&self.keys.signature_pub_key, data)
    }

    fn verify(&self, signer: &PubKeyRing, data: &[u8], signature: &[u8]) -> bool {
        data_signature(&signer.signature_pub_key, data) == signature
    }
}

/// Account ages shared by every node, keyed by payment account hash.
#[derive(Default)]
pub struct AccountAges {
    ages: Mutex<HashMap<Vec<u8>, u64>>,
}

impl AccountAges {
    pub fn set(&self, account: &PaymentAccount, age: Duration) {
        self.ages.lock().insert(account.hash(), age.as_millis() as u64);
    }
}

impl AccountAgeWitnessPort for AccountAges {
    fn account_age_ms(&self, payment_account_hash: &[u8], _owner: &PubKeyRing) -> Option<u64> {
        self.ages.lock().get(payment_account_hash).copied()
    }
}

// SECTION: nodes

pub struct TestNode {
    pub address: NodeAddress,
    pub manager: Arc<TradeManager>,
    pub wallet: Arc<MockWallet>,
    pub key_ring: Arc<MockKeyRing>,
    pub data_dir: PathBuf,
}

impl TestNode {
    pub fn keys(&self) -> PubKeyRing {
        self.key_ring.pub_key_ring()
    }

    pub fn account(&self, method: PaymentMethod) -> PaymentAccount {
        PaymentAccount::new(method, format!("holder of {}", self.address), self.address.as_str().as_bytes().to_vec())
    }

    pub fn offer(&self, direction: Direction, method: PaymentMethod, v5: bool) -> anyhow::Result<Offer> {
        let offer = OfferBuilder::new()
            .set_maker(self.address.clone(), self.keys())
            .set_direction(direction)
            .set_amount(1_000_000)
            .set_min_amount(500_000)
            .set_price(6_000_000)
            .set_currency_code(if method == PaymentMethod::BsqSwap { "BSQ" } else { "EUR" })
            .set_payment_method(method)
            .use_v5_protocol(v5)
            .validate_and_finalise()?;
        Ok(offer)
    }

    pub fn services(&self) -> &Arc<ServiceProvider> {
        self.manager.services()
    }
}

pub struct TestNet {
    pub network: Arc<LoopbackNetwork>,
    pub mailbox: Arc<FlakyMailbox>,
    pub account_ages: Arc<AccountAges>,
    root: TempDir,
}

impl TestNet {
    pub fn new() -> anyhow::Result<Self> {
        trade_engine::logging::try_init_for_tests();
        let root = tempdir()?;
        let db = Arc::new(sled::open(root.path().join("mailbox.db"))?);
        Ok(Self {
            network: Arc::new(LoopbackNetwork::default()),
            mailbox: Arc::new(FlakyMailbox {
                inner: SledMailboxStore::new(db)?,
                failing: AtomicBool::new(false),
            }),
            account_ages: Arc::new(AccountAges::default()),
            root,
        })
    }

    pub fn config(&self, name: &str) -> EngineConfig {
        let agent = MockKeyRing::new(AGENT).pub_key_ring();
        EngineConfig {
            data_dir: self.root.path().join(name),
            availability_timeout_secs: 5,
            refund_agents: vec![RefundAgentConfig {
                node: AGENT.into(),
                signature_pub_key: hex::encode(agent.signature_pub_key),
                encryption_pub_key: hex::encode(agent.encryption_pub_key),
                capabilities: Vec::new(),
            }],
            ..EngineConfig::default()
        }
    }

    pub fn node(&self, name: &str) -> anyhow::Result<TestNode> {
        self.node_with(name, self.config(name))
    }

    pub fn node_with(&self, name: &str, config: EngineConfig) -> anyhow::Result<TestNode> {
        let wallet = Arc::new(MockWallet::new(name));
        let key_ring = Arc::new(MockKeyRing::new(name));
        self.start(name, config, wallet, key_ring)
    }

    /// Same identity and data dir, fresh in-memory state.
    pub fn restart(&self, node: TestNode) -> anyhow::Result<TestNode> {
        let TestNode {
            address,
            manager,
            wallet,
            key_ring,
            ..
        } = node;
        drop(manager);
        let restarted = self.start(address.as_str(), self.config(address.as_str()), wallet, key_ring)?;
        restarted.manager.restore()?;
        Ok(restarted)
    }

    fn start(
        &self,
        name: &str,
        config: EngineConfig,
        wallet: Arc<MockWallet>,
        key_ring: Arc<MockKeyRing>,
    ) -> anyhow::Result<TestNode> {
        let address = NodeAddress::new(name);
        let data_dir = config.data_dir.clone();
        let manager = Arc::new(PersistenceManager::new(&data_dir, config.persistence_backups)?);
        let persistence = PersistenceHandle::spawn(manager);
        let collaborators = Collaborators {
            wallet: wallet.clone(),
            key_ring: key_ring.clone(),
            account_age: self.account_ages.clone(),
            messaging: self.network.clone(),
            mailbox: self.mailbox.clone(),
        };
        let services = Arc::new(ServiceProvider::new(config, address.clone(), collaborators, persistence)?);
        let manager = Arc::new(TradeManager::new(services));
        self.network.register(&address, &manager);
        Ok(TestNode {
            address,
            manager,
            wallet,
            key_ring,
            data_dir,
        })
    }
}
