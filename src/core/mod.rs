pub mod types;
pub mod transaction;

pub use types::*;
pub use transaction::{build_coinjoin, coordinator_fee, ownership_message, verify_ownership, verify_p2wpkh_witness};
