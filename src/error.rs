//! Error taxonomy for the trade engine.
use crate::trade::Phase;
use crate::types::{OfferId, TradeId};

/// Rejections that happen before any irreversible action.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Offer id {got} does not match the current offer {expected}")]
    StaleOfferId { expected: OfferId, got: OfferId },
    #[error("Peer runs unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u32),
    #[error("Peer runs banned protocol version {0}")]
    BannedProtocolVersion(u32),
    #[error("Peer node {0} is banned by the filter")]
    BannedNode(String),
    #[error("Payment account {0} is banned by the filter")]
    BannedPaymentAccount(String),
    #[error("Invalid signature on {0}")]
    InvalidSignature(&'static str),
    #[error("Message is missing required field {0}")]
    MissingField(&'static str),
    #[error("Peer lacks required capability {0}")]
    MissingCapability(&'static str),
    #[error("Transaction mismatch: {0}")]
    TxMismatch(&'static str),
    #[error("Message sender does not match the trading peer")]
    SenderMismatch,
    #[error("Offer is invalid: {0}")]
    InvalidOffer(&'static str),
}

/// Programming invariants of the task pipeline. Never user recoverable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task {task} terminated twice: already {previous}, then {attempted}")]
    AlreadyTerminated {
        task: &'static str,
        previous: &'static str,
        attempted: &'static str,
    },
    #[error("Task {0} returned without completing or failing")]
    NoOutcome(&'static str),
    #[error("Task runner {0} is not idle")]
    RunnerNotIdle(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Wallet has no key for {0}")]
    MissingKey(String),
    #[error("Failed to build transaction: {0}")]
    Build(String),
    #[error("Failed to sign transaction: {0}")]
    Sign(String),
    #[error("Broadcast failed: {0}")]
    Broadcast(String),
}

#[derive(thiserror::Error, Debug)]
pub enum MailboxError {
    #[error("Only the sender may store a mailbox entry")]
    NotSender,
    #[error("Only the receiver may remove a mailbox entry")]
    NotReceiver,
    #[error("Mailbox storage failed: {0}")]
    Storage(#[from] sled::Error),
    #[error("Mailbox storage unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("Persistence io error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Persistence writer has shut down")]
    WriterGone,
    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
    #[error("Failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Umbrella error used by tasks, drivers and the coordinator.
#[derive(thiserror::Error, Debug)]
pub enum TradeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Sending message failed: {0}")]
    Transport(String),
    #[error("Refused to create transaction: too many unconfirmed transactions ({count} pending, limit {limit})")]
    TooManyUnconfirmedTransactions { count: usize, limit: usize },
    #[error("Invalid state transition for trade {trade_id}: {from} -> {to}")]
    InvalidTransition {
        trade_id: TradeId,
        from: String,
        to: String,
    },
    #[error("Unexpected {message} in state {state}")]
    UnexpectedMessage { message: &'static str, state: String },
    #[error("No refund agent available")]
    NoRefundAgent,
    #[error("Unknown trade {0}")]
    UnknownTrade(TradeId),
    #[error("Unknown offer {0}")]
    UnknownOffer(OfferId),
    #[error("Task {task} failed: {reason}")]
    TaskFailed { task: &'static str, reason: String },
    #[error("Dispute can not be opened before deposit funds are committed (phase {0:?})")]
    DisputeNotAllowed(Phase),
    #[error("Trade coordinator for {0} has stopped")]
    CoordinatorGone(TradeId),
}

/// Failures of the offer availability handshake, reported once per request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityError {
    #[error("Maker did not respond within {0:?}")]
    Timeout(std::time::Duration),
    #[error("Availability request was cancelled")]
    Cancelled,
    #[error("Offer is not available: {0}")]
    Rejected(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Sending availability request failed: {0}")]
    Transport(String),
}
