pub mod broadcast;
pub mod client;
pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod node;
pub mod prison;
pub mod round;
pub mod rpc;
pub mod utxo;

pub use core::types::*;
