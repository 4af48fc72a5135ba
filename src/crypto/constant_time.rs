//! Constant-time comparison for sensitive values (keys, nonces, tags).
//! Use for all comparisons that could leak through timing side channels.

use subtle::ConstantTimeEq;

/// Constant-time equality for 32-byte arrays (e.g. keys, public keys).
#[inline(always)]
pub fn eq_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}

/// Constant-time equality for 64-byte arrays (e.g. signatures).
#[inline(always)]
pub fn eq_64(a: &[u8; 64], b: &[u8; 64]) -> bool {
    a.ct_eq(b).into()
}

/// Constant-time equality for 24-byte arrays (e.g. nonces).
#[inline(always)]
pub fn eq_24(a: &[u8; 24], b: &[u8; 24]) -> bool {
    a.ct_eq(b).into()
}

/// Constant-time equality for slices of the same length.
#[inline(always)]
pub fn eq_slices(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    bool::from(diff.ct_eq(&0u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_32_detects_difference() {
        let a = [1u8; 32];
        let mut b = [1u8; 32];
        assert!(eq_32(&a, &b));
        b[0] = 2;
        assert!(!eq_32(&a, &b));
    }

    #[test]
    fn eq_slices_rejects_length_mismatch() {
        assert!(!eq_slices(&[1, 2, 3], &[1, 2]));
    }
}
