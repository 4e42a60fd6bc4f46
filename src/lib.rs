pub mod chain;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod referee;
pub mod round;
pub mod rpc;
pub mod storage;

pub use coordinator::Coordinator;
pub use core::types::*;
pub use error::{CoordinatorError, CoordinatorResult};
