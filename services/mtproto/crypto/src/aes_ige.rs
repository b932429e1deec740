//! AES-256 in Infinite Garble Extension mode.
//!
//! The 32-byte IV is split into an initial previous-ciphertext block
//! (first half) and an initial previous-plaintext block (second half).

use crate::CryptoError;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

const BLOCK: usize = 16;

fn xor_block(target: &mut [u8], other: &[u8; BLOCK]) {
    for (t, o) in target.iter_mut().zip(other) {
        *t ^= o;
    }
}

fn split_iv(iv: &[u8; 32]) -> ([u8; BLOCK], [u8; BLOCK]) {
    let mut first = [0u8; BLOCK];
    let mut second = [0u8; BLOCK];
    first.copy_from_slice(&iv[..BLOCK]);
    second.copy_from_slice(&iv[BLOCK..]);
    (first, second)
}

/// Encrypt `data` in place.
pub fn encrypt(key: &[u8; 32], iv: &[u8; 32], data: &mut [u8]) -> Result<(), CryptoError> {
    if data.len() % BLOCK != 0 {
        return Err(CryptoError::BlockAlignment(data.len()));
    }

    let cipher = Aes256::new(GenericArray::from_slice(key));
    let (mut prev_cipher, mut prev_plain) = split_iv(iv);

    for chunk in data.chunks_exact_mut(BLOCK) {
        let mut plain = [0u8; BLOCK];
        plain.copy_from_slice(chunk);

        xor_block(chunk, &prev_cipher);
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        xor_block(chunk, &prev_plain);

        prev_cipher.copy_from_slice(chunk);
        prev_plain = plain;
    }
    Ok(())
}

/// Decrypt `data` in place.
pub fn decrypt(key: &[u8; 32], iv: &[u8; 32], data: &mut [u8]) -> Result<(), CryptoError> {
    if data.len() % BLOCK != 0 {
        return Err(CryptoError::BlockAlignment(data.len()));
    }

    let cipher = Aes256::new(GenericArray::from_slice(key));
    let (mut prev_cipher, mut prev_plain) = split_iv(iv);

    for chunk in data.chunks_exact_mut(BLOCK) {
        let mut encrypted = [0u8; BLOCK];
        encrypted.copy_from_slice(chunk);

        xor_block(chunk, &prev_plain);
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        xor_block(chunk, &prev_cipher);

        prev_cipher = encrypted;
        prev_plain.copy_from_slice(chunk);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sequential_key_iv() -> ([u8; 32], [u8; 32]) {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 32];
        for i in 0..32 {
            key[i] = i as u8;
            iv[i] = (32 + i) as u8;
        }
        (key, iv)
    }

    #[test]
    fn test_known_ciphertext() {
        let (key, iv) = sequential_key_iv();
        let mut data: Vec<u8> = (64u8..128).collect();
        encrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(
            hex::encode(&data),
            "b6b23cb46d2f43de2c67fc9a3a9e35104fad6ed15177969c1cebc616bcfa482c\
             b220e4d159bedfd570df191a805e9d9d13b6d62f0ea1e40541bd31ebe72f51c6"
        );

        decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(data, (64u8..128).collect::<Vec<_>>());
    }

    #[test]
    fn test_rejects_partial_block() {
        let (key, iv) = sequential_key_iv();
        let mut data = vec![0u8; 17];
        assert_eq!(
            encrypt(&key, &iv, &mut data),
            Err(CryptoError::BlockAlignment(17))
        );
        assert_eq!(
            decrypt(&key, &iv, &mut data),
            Err(CryptoError::BlockAlignment(17))
        );
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 32]>(),
            blocks in proptest::collection::vec(any::<[u8; 16]>(), 0..32),
        ) {
            let original: Vec<u8> = blocks.concat();
            let mut data = original.clone();
            encrypt(&key, &iv, &mut data).unwrap();
            decrypt(&key, &iv, &mut data).unwrap();
            prop_assert_eq!(data, original);
        }
    }
}
