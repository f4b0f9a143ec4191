//! Security helpers: inbound name advisories and the optional share PIN.
//!
//! Confidentiality and integrity of file bytes come from the DTLS layer of
//! the data channel; nothing here re-encrypts payloads.

pub mod advisor;
pub mod pin;
