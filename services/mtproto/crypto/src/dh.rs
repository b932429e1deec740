//! Diffie-Hellman parameter validation and key agreement.

use crate::rsa::to_fixed_be;
use crate::CryptoError;
use num_bigint::BigUint;
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// Size of the DH prime and public values in bytes
pub const DH_SIZE: usize = 256;

/// The 2048-bit safe prime Telegram servers use; skips primality testing.
pub const KNOWN_DH_PRIME: &str = "C71CAEB9C6B1C9048E6C522F70F13F73980D40238E3E21C14934D037563D930F\
    48198A0AA7C14058229493D22530F4DBFA336F6E0AC925139543AED44CCE7C3720FD51F69458705AC68CD4FE6B6B13AB\
    DC9746512969328454F18FAF8C595F642477FE96BB2A941D5BCD1D4AC8CC49880708FA9B378E3C4F3A9060BEE67CF9A4\
    A4A695811051907E162753B56B0F6B410DBA74D8A84B2A14B3144E0EF1284754FD17ED950D5965B4B9DD46582DB1178D\
    169C6BC465B0D6FF9CA3928FEF5B9AE4E418FC15E83EBEA0F87FA9FF5EED70050DED2849F47BF959D956850CE929851F\
    0D8115F635B105EE2E4E15D04B2454BF6F4FADF034B10403119CD8E3B92FCC5B";

static KNOWN_PRIME: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(KNOWN_DH_PRIME.as_bytes(), 16).unwrap_or_else(BigUint::zero)
});

const MILLER_RABIN_ROUNDS: usize = 30;

/// Validated group parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhParams {
    prime: BigUint,
    g: u32,
}

impl DhParams {
    /// The safe prime
    pub fn prime(&self) -> &BigUint {
        &self.prime
    }

    /// The generator
    pub fn g(&self) -> u32 {
        self.g
    }
}

/// Validate the prime and generator sent by the server.
pub fn validate_dh_params(prime_bytes: &[u8], g: i32) -> Result<DhParams, CryptoError> {
    let prime = BigUint::from_bytes_be(prime_bytes);
    if prime.bits() != (DH_SIZE * 8) as u64 {
        return Err(CryptoError::BadPrime("prime must be 2048 bits"));
    }
    if !(2..=7).contains(&g) {
        return Err(CryptoError::BadGenerator(g));
    }

    let known = prime == *KNOWN_PRIME;
    if !known {
        let mut rng = rand::thread_rng();
        if !is_probable_prime(&prime, MILLER_RABIN_ROUNDS, &mut rng) {
            return Err(CryptoError::BadPrime("not prime"));
        }
        let half = (&prime - 1u32) >> 1;
        if !is_probable_prime(&half, MILLER_RABIN_ROUNDS, &mut rng) {
            return Err(CryptoError::BadPrime("not a safe prime"));
        }
    }

    if !generator_matches(&prime, g as u32) {
        return Err(CryptoError::BadGenerator(g));
    }

    Ok(DhParams {
        prime,
        g: g as u32,
    })
}

/// Whether `g` generates the subgroup of order `(p-1)/2` for this prime.
fn generator_matches(prime: &BigUint, g: u32) -> bool {
    let rem = |m: u32| -> u32 {
        (prime % m)
            .to_u32_digits()
            .first()
            .copied()
            .unwrap_or(0)
    };
    match g {
        2 => rem(8) == 7,
        3 => rem(3) == 2,
        4 => true,
        5 => matches!(rem(5), 1 | 4),
        6 => matches!(rem(24), 19 | 23),
        7 => matches!(rem(7), 3 | 5 | 6),
        _ => false,
    }
}

/// Check that a public value lies in `[2^1984, p - 2^1984]` and `(1, p - 1)`.
pub fn validate_dh_value(value: &BigUint, prime: &BigUint) -> Result<(), CryptoError> {
    let one = BigUint::one();
    if *value <= one || *value >= prime - &one {
        return Err(CryptoError::DhValueOutOfRange("outside (1, p-1)"));
    }
    let bound = BigUint::one() << (DH_SIZE * 8 - 64);
    if *value < bound || *value > prime - &bound {
        return Err(CryptoError::DhValueOutOfRange("outside [2^1984, p-2^1984]"));
    }
    Ok(())
}

/// Result of the client side of the exchange
pub struct DhExchange {
    /// `g^b mod p`, 256 bytes big-endian
    pub g_b: Vec<u8>,
    /// `g_a^b mod p`, 256 bytes big-endian
    pub shared: [u8; DH_SIZE],
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.shared.zeroize();
    }
}

/// Pick a random exponent, derive `g_b` and the shared secret from `g_a`.
pub fn compute_exchange<R: RngCore + CryptoRng>(
    params: &DhParams,
    g_a_bytes: &[u8],
    rng: &mut R,
) -> Result<DhExchange, CryptoError> {
    let g_a = BigUint::from_bytes_be(g_a_bytes);
    validate_dh_value(&g_a, &params.prime)?;

    let mut secret = [0u8; DH_SIZE];
    rng.fill_bytes(&mut secret);
    let b = BigUint::from_bytes_be(&secret);
    secret.zeroize();

    let g_b = BigUint::from(params.g).modpow(&b, &params.prime);
    validate_dh_value(&g_b, &params.prime)?;

    let shared_value = g_a.modpow(&b, &params.prime);
    let mut shared = [0u8; DH_SIZE];
    shared.copy_from_slice(&to_fixed_be(&shared_value, DH_SIZE));

    Ok(DhExchange {
        g_b: to_fixed_be(&g_b, DH_SIZE),
        shared,
    })
}

/// Miller-Rabin probabilistic primality test with random bases.
pub fn is_probable_prime<R: RngCore>(n: &BigUint, rounds: usize, rng: &mut R) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    for small in [2u32, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        if (n % small).is_zero() {
            return *n == BigUint::from(small);
        }
    }

    let n_minus_one = n - 1u32;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;
    let byte_len = ((n.bits() + 7) / 8) as usize;
    let range = n - 3u32;

    'witness: for _ in 0..rounds {
        let mut raw = vec![0u8; byte_len];
        rng.fill_bytes(&mut raw);
        let a = BigUint::from_bytes_be(&raw) % &range + &two;

        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known_prime_bytes() -> Vec<u8> {
        to_fixed_be(&KNOWN_PRIME, DH_SIZE)
    }

    #[test]
    fn test_known_prime_accepted_with_generator_three() {
        let params = validate_dh_params(&known_prime_bytes(), 3).unwrap();
        assert_eq!(params.g(), 3);
        assert_eq!(params.prime().bits(), 2048);
    }

    #[test]
    fn test_known_prime_rejects_mismatched_generator() {
        // p mod 8 != 7 for this prime
        assert_eq!(
            validate_dh_params(&known_prime_bytes(), 2),
            Err(CryptoError::BadGenerator(2))
        );
        assert_eq!(
            validate_dh_params(&known_prime_bytes(), 9),
            Err(CryptoError::BadGenerator(9))
        );
    }

    #[test]
    fn test_composite_prime_rejected() {
        let mut bytes = known_prime_bytes();
        bytes[DH_SIZE - 1] = bytes[DH_SIZE - 1].wrapping_add(2);
        assert!(matches!(
            validate_dh_params(&bytes, 3),
            Err(CryptoError::BadPrime(_))
        ));
        assert!(matches!(
            validate_dh_params(&bytes[1..], 3),
            Err(CryptoError::BadPrime(_))
        ));
    }

    #[test]
    fn test_miller_rabin_small_values() {
        let mut rng = rand::thread_rng();
        assert!(is_probable_prime(&BigUint::from(1_000_000_007u64), 20, &mut rng));
        assert!(!is_probable_prime(&BigUint::from(1_000_000_007u64 * 3), 20, &mut rng));
        assert!(!is_probable_prime(&BigUint::from(561u32), 20, &mut rng));
    }

    #[test]
    fn test_value_range_checks() {
        let p = KNOWN_PRIME.clone();
        assert!(validate_dh_value(&BigUint::one(), &p).is_err());
        assert!(validate_dh_value(&(&p - 1u32), &p).is_err());
        assert!(validate_dh_value(&(BigUint::one() << 1000), &p).is_err());
        assert!(validate_dh_value(&(BigUint::one() << 2000), &p).is_ok());
    }

    #[test]
    fn test_exchange_agrees_with_server_side() {
        let mut rng = rand::thread_rng();
        let params = validate_dh_params(&known_prime_bytes(), 3).unwrap();

        let a = BigUint::from_bytes_be(&[0x5a; DH_SIZE]);
        let g_a = BigUint::from(3u32).modpow(&a, params.prime());
        let exchange = compute_exchange(&params, &to_fixed_be(&g_a, DH_SIZE), &mut rng).unwrap();

        let server_shared = BigUint::from_bytes_be(&exchange.g_b).modpow(&a, params.prime());
        assert_eq!(to_fixed_be(&server_shared, DH_SIZE), exchange.shared.to_vec());
        assert_eq!(exchange.g_b.len(), DH_SIZE);
    }
}
