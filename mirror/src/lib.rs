pub mod config;
pub mod credentials;
pub mod engine;
pub mod remote;
pub mod session;
