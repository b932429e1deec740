//! Factorization of the handshake `pq` challenge.
//!
//! The server sends the product of two primes below 2^32. Pollard-Brent
//! rho over `u64` with 128-bit intermediate products splits it in well
//! under a millisecond.

use crate::CryptoError;
use num_integer::Integer;

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut result = 1u64;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

/// Deterministic Miller-Rabin for 64-bit integers.
pub fn is_prime_u64(n: u64) -> bool {
    const BASES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    if n < 2 {
        return false;
    }
    for p in BASES {
        if n % p == 0 {
            return n == p;
        }
    }

    let mut d = n - 1;
    let mut s = 0;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }

    'witness: for a in BASES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn brent(n: u64, c: u64) -> Option<u64> {
    const BATCH: u64 = 128;
    const MAX_CYCLE: u64 = 1 << 26;

    let f = |x: u64| ((mul_mod(x, x, n) as u128 + c as u128) % n as u128) as u64;
    let mut y = 2u64;
    let mut x = y;
    let mut ys = y;
    let mut g = 1u64;
    let mut r = 1u64;
    let mut q = 1u64;

    while g == 1 {
        x = y;
        for _ in 0..r {
            y = f(y);
        }
        let mut k = 0;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..BATCH.min(r - k) {
                y = f(y);
                q = mul_mod(q, x.abs_diff(y), n);
            }
            g = q.gcd(&n);
            k += BATCH;
        }
        r *= 2;
        if r > MAX_CYCLE {
            return None;
        }
    }

    if g == n {
        loop {
            ys = f(ys);
            g = x.abs_diff(ys).gcd(&n);
            if g > 1 {
                break;
            }
        }
    }

    (g != n).then_some(g)
}

/// Split `pq` into `(p, q)` with `p < q`.
pub fn factorize(pq: u64) -> Result<(u64, u64), CryptoError> {
    if pq < 4 || is_prime_u64(pq) {
        return Err(CryptoError::Factorization(pq));
    }
    if pq % 2 == 0 {
        return Ok((2, pq / 2));
    }

    for c in 1..64 {
        if let Some(divisor) = brent(pq, c) {
            let other = pq / divisor;
            return Ok((divisor.min(other), divisor.max(other)));
        }
    }
    Err(CryptoError::Factorization(pq))
}

/// Interpret a big-endian byte string of at most 8 bytes.
pub fn u64_from_be(bytes: &[u8]) -> Result<u64, CryptoError> {
    let trimmed = strip_leading_zeros(bytes);
    if trimmed.len() > 8 {
        return Err(CryptoError::PqTooLarge(bytes.len()));
    }
    Ok(trimmed.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// Minimal big-endian encoding of `value`.
pub fn u64_to_be(value: u64) -> Vec<u8> {
    strip_leading_zeros(&value.to_be_bytes()).to_vec()
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factorize_known_challenge() {
        assert_eq!(
            factorize(0x17ED48941A08F981).unwrap(),
            (0x494C553B, 0x53911073)
        );
    }

    #[test]
    fn test_factorize_large_primes() {
        let p = 4_294_967_291u64;
        let q = 4_294_967_279u64;
        assert_eq!(factorize(p * q).unwrap(), (q, p));
        assert_eq!(factorize(1_000_000_007 * 998_244_353).unwrap(), (998_244_353, 1_000_000_007));
    }

    #[test]
    fn test_factorize_rejects_primes() {
        assert!(factorize(2_147_483_647).is_err());
        assert!(factorize(3).is_err());
        assert_eq!(factorize(22).unwrap(), (2, 11));
    }

    #[test]
    fn test_miller_rabin() {
        assert!(is_prime_u64(2));
        assert!(is_prime_u64(0x494C553B));
        assert!(!is_prime_u64(0x17ED48941A08F981));
        assert!(!is_prime_u64(3_215_031_751));
        assert!(is_prime_u64(18_446_744_073_709_551_557));
    }

    #[test]
    fn test_big_endian_helpers() {
        let bytes = [0x17, 0xED, 0x48, 0x94, 0x1A, 0x08, 0xF9, 0x81];
        assert_eq!(u64_from_be(&bytes).unwrap(), 0x17ED48941A08F981);
        assert_eq!(u64_to_be(0x494C553B), vec![0x49, 0x4C, 0x55, 0x3B]);
        assert_eq!(u64_from_be(&[0, 0, 1]).unwrap(), 1);
        assert!(u64_from_be(&[1; 9]).is_err());
    }
}
