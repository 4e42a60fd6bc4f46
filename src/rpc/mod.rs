pub mod handlers;
pub mod server;
pub mod types;

pub use server::{router, serve, RpcServer};
pub use types::API_PREFIX;
