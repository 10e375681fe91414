pub mod client;
pub mod codec;
pub mod server;

pub use client::RpcClient;
