//! SHA-1 helpers and constant-time comparison.

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// SHA-1 over the concatenation of `chunks`.
pub fn sha1(chunks: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// Timing-safe comparison of byte slices.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
