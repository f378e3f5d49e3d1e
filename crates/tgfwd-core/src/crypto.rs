//! Per-user session-blob encryption.
//!
//! Keys are derived from one master key per user, so a blob encrypted for
//! one user can never be opened with another user's key.

use base64::{engine::general_purpose::URL_SAFE, Engine};
use fernet::Fernet;
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use crate::{domain::UserId, errors::Error, Result};

const SALT_PREFIX: &str = "tg_forward_bot_";
const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Clone)]
pub struct CryptoBox {
    master_key: Vec<u8>,
}

impl CryptoBox {
    pub fn new(master_key: &str) -> Self {
        Self {
            master_key: master_key.as_bytes().to_vec(),
        }
    }

    fn fernet_for(&self, user_id: UserId) -> Result<Fernet> {
        let salt = format!("{SALT_PREFIX}{user_id}");
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(&self.master_key, salt.as_bytes(), PBKDF2_ROUNDS, &mut key);

        Fernet::new(&URL_SAFE.encode(key))
            .ok_or_else(|| Error::Internal("derived key rejected by fernet".to_string()))
    }

    /// Authenticated encryption with the user-specific key.
    pub fn encrypt(&self, user_id: UserId, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.fernet_for(user_id)?.encrypt(plaintext).into_bytes())
    }

    /// Fails with `CryptoTampered` when the token does not authenticate;
    /// never returns garbage.
    pub fn decrypt(&self, user_id: UserId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let token = std::str::from_utf8(ciphertext).map_err(|_| Error::CryptoTampered)?;
        self.fernet_for(user_id)?
            .decrypt(token)
            .map_err(|_| Error::CryptoTampered)
    }

    /// Hex-encoded SHA-256; used for audit, never for decryption.
    pub fn hash(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_per_user() {
        let cb = CryptoBox::new("master");
        let blob = b"1BVtsOHYBq0...session";

        let enc = cb.encrypt(UserId(42), blob).unwrap();
        assert_ne!(enc.as_slice(), blob.as_slice());
        assert_eq!(cb.decrypt(UserId(42), &enc).unwrap(), blob.to_vec());
    }

    #[test]
    fn key_is_bound_to_user_identity() {
        let cb = CryptoBox::new("master");
        let enc = cb.encrypt(UserId(42), b"secret").unwrap();

        let err = cb.decrypt(UserId(43), &enc).unwrap_err();
        assert!(matches!(err, Error::CryptoTampered));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let cb = CryptoBox::new("master");
        let mut enc = cb.encrypt(UserId(1), b"payload").unwrap();
        let last = enc.len() - 1;
        enc[last] ^= 0x01;

        assert!(matches!(
            cb.decrypt(UserId(1), &enc),
            Err(Error::CryptoTampered)
        ));
        assert!(matches!(
            cb.decrypt(UserId(1), &[0xff, 0xfe]),
            Err(Error::CryptoTampered)
        ));
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        assert_eq!(
            CryptoBox::hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
