pub mod bus;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
