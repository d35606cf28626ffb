//! # Trade Sentinel
//!
//! Trade-execution and risk-management core for discretionary futures trading
//! on a ProjectX-style broker API.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Broker REST client, wire types and a scripted mock broker
//! - `risk`: Position sizing, bracket tick conversion and ledger reconciliation
//! - `strategy`: Externally decided trade plans and their execution
//! - `monitor`: Order lifecycle monitors, their supervisor and the key-level watcher
//! - `notify`: Outbound notification channel (Telegram or log-only)
//! - `persistence`: SQLite store for key levels, monitor records and journals
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod monitor;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
