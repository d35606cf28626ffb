//! Broker integration.
//!
//! ## ProjectX
//! REST gateway access for:
//! - Session login with a cached, shared bearer token
//! - Accounts, contracts and open positions
//! - Order placement with stop-loss/take-profit brackets, cancel and modify
//! - Order, trade and price-bar history
//!
//! ## Mock
//! Scripted in-memory broker used for paper runs and monitor tests.

mod client;
pub mod error;
pub mod mock;
pub mod traits;
mod types;

pub use client::ProjectXClient;
pub use error::BrokerError;
pub use mock::MockBroker;
pub use traits::{BrokerApi, BrokerResult};
pub use types::*;
