//! Command-line front end: argument parsing, the commands, and the
//! glue between negotiation, signaling and sessions.

pub mod args;
pub mod link;
pub mod pin;
pub mod progress;
pub mod receive;
pub mod send;
