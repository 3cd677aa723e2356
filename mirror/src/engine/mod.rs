pub mod channel;
pub mod client;
pub mod error;
pub mod handler;
pub mod ids;
pub mod notify;
pub mod server;
