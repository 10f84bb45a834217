//! AES-CBC decryption of UDP data-channel payloads.
//!
//! The publisher supplies key/IV pairs over the command channel
//! (`UpdateCipherKeys`); the key length selects the AES variant.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockModeDecrypt, KeyIvInit};

use crate::error::{Error, Result};

/// One key/IV pair as delivered by the publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyIv {
    /// AES key; 16, 24 or 32 bytes.
    pub key: Vec<u8>,
    /// CBC initialization vector.
    pub iv: Vec<u8>,
}

impl KeyIv {
    /// Check if the publisher has not installed this pair.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Decrypt an encrypted data-packet body with this pair.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        decrypt(&self.key, &self.iv, data)
    }
}

/// AES-CBC decrypt `data`, dispatching on key length.
pub fn decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|e| Error::Cipher(e.to_string()))?
            .decrypt_padded_vec::<Pkcs7>(data)
            .map_err(|e| Error::Cipher(e.to_string())),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|e| Error::Cipher(e.to_string()))?
            .decrypt_padded_vec::<Pkcs7>(data)
            .map_err(|e| Error::Cipher(e.to_string())),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| Error::Cipher(e.to_string()))?
            .decrypt_padded_vec::<Pkcs7>(data)
            .map_err(|e| Error::Cipher(e.to_string())),
        n => Err(Error::Cipher(format!("unsupported AES key length: {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockModeEncrypt;

    fn encrypt_256(key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_vec::<Pkcs7>(data)
    }

    #[test]
    fn test_round_trip_aes256() {
        let key = [0x42u8; 32];
        let iv = [0x07u8; 16];
        let plain = b"two measurements worth of packet body";

        let sealed = encrypt_256(&key, &iv, plain);
        assert_ne!(&sealed[..plain.len().min(sealed.len())], &plain[..]);

        let opened = decrypt(&key, &iv, &sealed).unwrap();
        assert_eq!(opened, plain);
    }

    #[test]
    fn test_wrong_key_fails_padding() {
        let key = [0x42u8; 32];
        let other = [0x43u8; 32];
        let iv = [0x07u8; 16];
        let sealed = encrypt_256(&key, &iv, b"payload");
        assert!(decrypt(&other, &iv, &sealed).is_err());
    }

    #[test]
    fn test_bad_key_length() {
        assert!(decrypt(&[0u8; 10], &[0u8; 16], &[0u8; 16]).is_err());
    }
}
