pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod security;
pub mod session;
pub mod signaling;
