//! Hashing and timing-safe comparison helpers.
//!
//! Every place that compares secret-derived material (PIN hashes) goes
//! through [`constant_time_eq`]; never compare those with `==`.

use sha3::{Digest, Sha3_256};

/// SHA3-256 over the concatenation of `parts`.
pub fn sha3_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Lower-case hex SHA3-256 over the concatenation of `parts`.
pub fn sha3_256_hex(parts: &[&[u8]]) -> String {
    hex::encode(sha3_256(parts))
}

/// Constant-time comparison of two byte strings.
///
/// Length is not secret here (both sides are fixed-size digests), so a
/// length mismatch returns early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha3_concatenates_parts() {
        assert_eq!(sha3_256(&[b"ab", b"c"]), sha3_256(&[b"abc"]));
        assert_ne!(sha3_256(&[b"abc"]), sha3_256(&[b"abd"]));
    }

    #[test]
    fn test_sha3_hex_known_vector() {
        // SHA3-256("")
        assert_eq!(
            sha3_256_hex(&[]),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        let a = [42u8; 32];
        let mut b = a;
        assert!(constant_time_eq(&a, &b));
        b[31] ^= 1;
        assert!(!constant_time_eq(&a, &b));
        assert!(!constant_time_eq(&a, &a[..31]));
    }
}
