//! Optional shared-PIN gate on a share record.
//!
//! The sender stores `hex(sha3_256(salt || pin))` with the share, where
//! `salt` is the transfer id in its hyphenated text form. The joining side
//! hashes what the user typed and compares before touching the offer, so
//! a wrong PIN never reaches the connect phase.

use uuid::Uuid;

use crate::utils::crypto::{constant_time_eq, sha3_256, sha3_256_hex};

pub fn hash_pin(transfer_id: &Uuid, pin: &str) -> String {
    let salt = transfer_id.to_string();
    sha3_256_hex(&[salt.as_bytes(), pin.trim().as_bytes()])
}

/// Compare an entered PIN against the stored hash in constant time.
///
/// A stored hash that is not valid hex never matches.
pub fn verify_pin(transfer_id: &Uuid, entered: &str, stored_hash: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hash.trim()) else {
        return false;
    };
    let salt = transfer_id.to_string();
    let computed = sha3_256(&[salt.as_bytes(), entered.trim().as_bytes()]);
    constant_time_eq(&computed, &stored)
}
