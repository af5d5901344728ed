pub mod transaction;
pub mod types;

pub use transaction::{Coin, JoinTransaction, TxIn, Witness};
pub use types::*;
