//! Key derivation and the encrypted message envelope of the KM200
//!
//! Every request and response body on the wire is base64 text over
//! AES-256-ECB ciphertext, zero padded to the 16 byte block boundary.
//! There is no IV and no block chaining, the gateway firmware really
//! uses plain ECB.
//!
//! # Session key
//!
//! The 32 byte key is derived from three secrets:
//!
//! - gateway password, printed on the device's type sign (hyphens stripped)
//! - private password, chosen by the user in EasyControl
//! - device salt, a hex encoded seed fixed at manufacture
//!
//! Layout: `MD5(gateway_password ++ salt) ++ MD5(salt ++ private_password)`
//!
//! # Plaintext passthrough
//!
//! A response whose base64 decoded length is not a multiple of 16 is
//! returned as plaintext without any further processing. The gateway
//! answers some paths with unencrypted markers this way and there is no
//! integrity check on that path.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use tracing::debug;

use crate::constants::BLOCK_SIZE;
use crate::error::KM200Error;

/// Derive the 32 byte AES key from the gateway secrets.
///
/// Deterministic, changing any input changes the key. Fails if the salt
/// is not valid hex.
pub fn derive_key(
    gateway_password: &str,
    private_password: &str,
    salt_hex: &str,
) -> Result<[u8; 32], KM200Error> {
    let salt = hex::decode(salt_hex)
        .map_err(|e| KM200Error::Configuration(format!("Salt is not valid hex: {e}")))?;

    let first = Md5::new()
        .chain_update(gateway_password.as_bytes())
        .chain_update(&salt)
        .finalize();
    let second = Md5::new()
        .chain_update(&salt)
        .chain_update(private_password.as_bytes())
        .finalize();

    let mut key = [0u8; 32];
    key[..16].copy_from_slice(&first);
    key[16..].copy_from_slice(&second);
    Ok(key)
}

/// Encrypts and decrypts message bodies with the derived key.
pub struct Codec {
    cipher: Aes256,
}

impl Codec {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256::new(key.into()),
        }
    }

    /// Decode an encrypted response body into plaintext.
    ///
    /// Line breaks inside the base64 text are tolerated, anything else
    /// invalid is a [`KM200Error::Crypto`].
    pub fn decode(&self, encoded: &[u8]) -> Result<String, KM200Error> {
        let filtered: Vec<u8> = encoded
            .iter()
            .copied()
            .filter(|b| *b != b'\r' && *b != b'\n')
            .collect();
        let mut data = BASE64
            .decode(&filtered)
            .map_err(|e| KM200Error::Crypto(format!("Body is not valid base64: {e}")))?;

        if data.len() % BLOCK_SIZE != 0 {
            debug!(
                "Response of {} bytes is not block aligned, passing through as plaintext",
                data.len()
            );
            return into_text(data);
        }

        for block in data.chunks_mut(BLOCK_SIZE) {
            self.cipher.decrypt_block(block.into());
        }
        strip_zero_padding(&mut data);
        into_text(data)
    }

    /// Encode plaintext into an encrypted request body.
    ///
    /// The padding is always between 1 and 16 bytes, an already aligned
    /// input gains a full zero block. This is not PKCS7, the gateway
    /// rejects anything else.
    pub fn encode(&self, plaintext: &str) -> Vec<u8> {
        let mut data = plaintext.as_bytes().to_vec();
        let padding = BLOCK_SIZE - data.len() % BLOCK_SIZE;
        data.resize(data.len() + padding, 0);

        for block in data.chunks_mut(BLOCK_SIZE) {
            self.cipher.encrypt_block(block.into());
        }
        BASE64.encode(&data).into_bytes()
    }
}

fn strip_zero_padding(data: &mut Vec<u8>) {
    while data.last() == Some(&0) {
        data.pop();
    }
}

fn into_text(data: Vec<u8>) -> Result<String, KM200Error> {
    String::from_utf8(data).map_err(|e| KM200Error::Crypto(format!("Body is not valid UTF-8: {e}")))
}
