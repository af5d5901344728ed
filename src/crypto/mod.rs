pub mod credentials;
pub mod group;
pub mod ownership;
pub mod transcript;
pub mod zk;

pub use group::{GroupElement, Scalar};
