//! Peer to peer trade execution engine.
//!
//! Two traders settle a trade without a custodian: each side runs a
//! [`protocol::TradeProtocol`] that moves the persisted [`trade::Trade`]
//! through its phases by running task sequences against the wallet and
//! messaging ports. [`service::TradeManager`] is the node level entry point.

pub mod account_age;
pub mod capabilities;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod logging;
pub mod mailbox;
pub mod message;
pub mod messaging;
pub mod offer;
pub mod persistence;
pub mod process_model;
pub mod protocol;
pub mod service;
pub mod task;
pub mod trade;
pub mod types;
pub mod utils;
pub mod wallet;

pub use error::TradeError;
pub use service::TradeManager;
