//! Cryptography for client registration and file transfer
//!
//! Two independent primitives, used at different points in the protocol:
//! 1. RSA-OAEP wraps the per-client AES-256 key for transport (send-public-key,
//!    reconnect).
//! 2. AES-256-CBC with a fixed all-zero IV decrypts the file bytes the client
//!    uploads. The zero IV is a wire-compatibility requirement of the
//!    existing client, not a recommendation — see the module docs below.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, KeyInit, generic_array::GenericArray};
use rand::{RngCore, rngs::OsRng};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;

const BLOCK_SIZE: usize = 16;

/// Generate a random 16-byte client id, hex-encoded by the caller.
pub fn new_client_id() -> [u8; 16] {
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    id
}

/// Generate a random 32-byte AES-256 session key.
pub fn new_symmetric_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Wrap `key` with the RSA public key the client sent.
///
/// The key arrives as DER bytes without an accompanying format tag, so we
/// try PKCS#1 first and fall back to SPKI, the same multi-scheme fallback
/// shape used elsewhere in this codebase for parsing keys of unknown origin.
/// Returns `None` if the bytes parse as neither and on encryption failure,
/// since a failed wrap is always a 1607 generic-failure response rather
/// than a connection error.
pub fn wrap(public_key_der: &[u8], key: &[u8]) -> Option<Vec<u8>> {
    let public_key = RsaPublicKey::from_pkcs1_der(public_key_der)
        .or_else(|_| RsaPublicKey::from_public_key_der(public_key_der))
        .ok()?;
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
        .ok()
}

/// Decrypt file ciphertext with AES-256-CBC under a fixed all-zero IV and
/// strip PKCS#7 padding.
///
/// Built on the same manual block-chunking approach used for AES-ECB
/// elsewhere in this codebase, extended with CBC chaining: each decrypted
/// block is XORed with the previous ciphertext block (or the zero IV for
/// the first block) before being appended to the output. No `cbc` crate is
/// pulled in for this, since the rest of this codebase does its AES block
/// chaining by hand.
pub fn unwrap_file(ciphertext: &[u8], key: &[u8]) -> crate::Result<Vec<u8>> {
    if key.len() != 32 {
        anyhow::bail!("AES key must be 32 bytes, got {}", key.len());
    }
    if ciphertext.is_empty() || !ciphertext.len().is_multiple_of(BLOCK_SIZE) {
        anyhow::bail!(
            "ciphertext length {} is not a positive multiple of {BLOCK_SIZE}",
            ciphertext.len()
        );
    }

    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut prev_block = [0u8; BLOCK_SIZE];
    let mut plaintext = Vec::with_capacity(ciphertext.len());

    for chunk in ciphertext.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for (b, p) in block.iter_mut().zip(prev_block.iter()) {
            *b ^= p;
        }
        plaintext.extend_from_slice(&block);
        prev_block.copy_from_slice(chunk);
    }

    match plaintext.last().copied() {
        Some(padding_len) if padding_len > 0 && padding_len as usize <= BLOCK_SIZE => {
            let len = plaintext.len();
            plaintext.truncate(len - padding_len as usize);
        }
        _ => anyhow::bail!("invalid PKCS#7 padding on decrypted file"),
    }

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;
    use rsa::RsaPrivateKey;
    use rsa::traits::PublicKeyParts;

    fn encrypt_cbc_zero_iv(plaintext: &[u8], key: &[u8; 32]) -> Vec<u8> {
        let cipher = Aes256::new(GenericArray::from_slice(key));
        let padding_len = BLOCK_SIZE - (plaintext.len() % BLOCK_SIZE);
        let mut padded = plaintext.to_vec();
        padded.extend(vec![padding_len as u8; padding_len]);

        let mut prev_block = [0u8; BLOCK_SIZE];
        let mut out = Vec::with_capacity(padded.len());
        for chunk in padded.chunks(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            for i in 0..BLOCK_SIZE {
                block[i] = chunk[i] ^ prev_block[i];
            }
            let mut block = GenericArray::from(block);
            cipher.encrypt_block(&mut block);
            out.extend_from_slice(&block);
            prev_block.copy_from_slice(&block);
        }
        out
    }

    #[test]
    fn aes_cbc_round_trip() {
        let key = new_symmetric_key();
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let ciphertext = encrypt_cbc_zero_iv(plaintext, &key);
        let decrypted = unwrap_file(&ciphertext, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_cbc_rejects_non_block_multiple() {
        let key = new_symmetric_key();
        let err = unwrap_file(&[1, 2, 3], &key).unwrap_err();
        assert!(err.to_string().contains("multiple of"));
    }

    #[test]
    fn rsa_wrap_round_trips_with_pkcs1_der_key() {
        use rsa::pkcs1::EncodeRsaPublicKey;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let der = public_key.to_pkcs1_der().unwrap();

        let session_key = new_symmetric_key();
        let wrapped = wrap(der.as_bytes(), &session_key).unwrap();
        assert_eq!(wrapped.len(), private_key.size());

        let unwrapped = private_key
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .unwrap();
        assert_eq!(unwrapped, session_key);
    }

    #[test]
    fn new_client_id_and_key_are_not_all_zero() {
        assert_ne!(new_client_id(), [0u8; 16]);
        assert_ne!(new_symmetric_key(), [0u8; 32]);
    }
}
