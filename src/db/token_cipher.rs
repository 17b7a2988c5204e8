//! AES-256-GCM sealing for token columns at rest.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::db::DbError;

pub const TOKEN_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedTokenEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; TOKEN_KEY_BYTES],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    pub fn new(key: [u8; TOKEN_KEY_BYTES]) -> Self {
        Self { key }
    }

    /// Parses a 64 character hex key.
    pub fn from_hex(raw: &str) -> Result<Self, DbError> {
        let decoded = hex_decode(raw)?;
        let key: [u8; TOKEN_KEY_BYTES] = decoded
            .try_into()
            .map_err(|_| DbError::Crypto("token key must be 32 bytes".to_string()))?;
        Ok(Self::new(key))
    }

    fn sealing_key(&self) -> Result<LessSafeKey, DbError> {
        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| DbError::Crypto("construct AES-256-GCM key".to_string()))?;
        Ok(LessSafeKey::new(unbound_key))
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, DbError> {
        let key = self.sealing_key()?;
        let mut buffer = plaintext.as_bytes().to_vec();

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| DbError::Crypto("generate random nonce".to_string()))?;

        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut buffer,
        )
        .map_err(|_| DbError::Crypto("encrypt token".to_string()))?;

        let envelope = EncryptedTokenEnvelope {
            version: ENVELOPE_VERSION,
            nonce_hex: hex_encode(&nonce_bytes),
            ciphertext_hex: hex_encode(&buffer),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn open(&self, raw: &str) -> Result<String, DbError> {
        let envelope: EncryptedTokenEnvelope = serde_json::from_str(raw)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(DbError::Crypto(format!(
                "unsupported token envelope version {}",
                envelope.version
            )));
        }

        let nonce_bytes: [u8; NONCE_BYTES] = hex_decode(&envelope.nonce_hex)?
            .try_into()
            .map_err(|_| DbError::Crypto("invalid nonce length in token envelope".to_string()))?;
        let mut ciphertext = hex_decode(&envelope.ciphertext_hex)?;

        let key = self.sealing_key()?;
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut ciphertext,
            )
            .map_err(|_| DbError::Crypto("decrypt token".to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| DbError::Crypto("decrypted token is not utf-8".to_string()))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, DbError> {
    let bytes = raw.trim().as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(DbError::Crypto("hex string length must be even".to_string()));
    }

    bytes
        .chunks(2)
        .map(|pair| match (hex_nibble(pair[0]), hex_nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(DbError::Crypto("invalid hex digit".to_string())),
        })
        .collect()
}

fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
