//! 会话加密编解码
//!
//! 主密钥由配置中的 secret 经 PBKDF2-HMAC-SHA256 派生（固定应用盐），
//! 每次加密使用随机 96 位 nonce 的 AES-256-GCM。令牌格式：
//!
//! ```text
//! base64url( version(1) || nonce(12) || ciphertext+tag )
//! ```
//!
//! 任何篡改、截断或换钥都会在解密时失败，不会返回错误的明文。

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;

/// 派生主密钥使用的固定盐；换盐等于换钥
const KDF_SALT: &[u8] = b"dbagent.session-codec.v1";
const TOKEN_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption failed")]
    Encryption,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 对称加解密器（进程内单例，按 Arc 共享）
pub struct EncryptionCodec {
    cipher: Aes256Gcm,
}

impl EncryptionCodec {
    pub fn new(secret: &str, iterations: u32) -> Result<Self, CodecError> {
        if secret.is_empty() {
            return Err(CodecError::KeyDerivation("secret must not be empty".into()));
        }
        if iterations == 0 {
            return Err(CodecError::KeyDerivation("iterations must be positive".into()));
        }
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, iterations, &mut key);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CodecError::KeyDerivation(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CodecError::Encryption)?;

        let mut token = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(nonce.as_slice());
        token.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, CodecError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| CodecError::Decryption("malformed token".into()))?;
        if raw.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(CodecError::Decryption("truncated token".into()));
        }
        if raw[0] != TOKEN_VERSION {
            return Err(CodecError::Decryption(format!(
                "unsupported token version {}",
                raw[0]
            )));
        }
        let nonce = Nonce::from_slice(&raw[1..1 + NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &raw[1 + NONCE_LEN..])
            .map_err(|_| CodecError::Decryption("authentication failed".into()))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CodecError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, token: &str) -> Result<String, CodecError> {
        let bytes = self.decrypt(token)?;
        String::from_utf8(bytes).map_err(|_| CodecError::Decryption("plaintext is not UTF-8".into()))
    }

    /// 序列化为 JSON 后整体加密
    pub fn encrypt_struct<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        let json = serde_json::to_vec(value)?;
        self.encrypt(&json)
    }

    pub fn decrypt_struct<T: DeserializeOwned>(&self, token: &str) -> Result<T, CodecError> {
        let bytes = self.decrypt(token)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl std::fmt::Debug for EncryptionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionCodec").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn codec(secret: &str) -> EncryptionCodec {
        EncryptionCodec::new(secret, 1_000).unwrap()
    }

    #[test]
    fn test_round_trip_including_empty() {
        let c = codec("k1");
        for input in ["", "hunter2", "{\"a\":[1,2]}\n\"quoted\"", "密码"] {
            let token = c.encrypt_str(input).unwrap();
            assert_eq!(c.decrypt_str(&token).unwrap(), input);
        }
    }

    #[test]
    fn test_same_plaintext_yields_distinct_tokens() {
        let c = codec("k1");
        let a = c.encrypt_str("same").unwrap();
        let b = c.encrypt_str("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let token = codec("k1").encrypt_str("secret").unwrap();
        let err = codec("k2").decrypt_str(&token).unwrap_err();
        assert!(matches!(err, CodecError::Decryption(_)));
    }

    #[test]
    fn test_tampered_and_truncated_tokens_fail() {
        let c = codec("k1");
        let token = c.encrypt_str("secret").unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(&raw);
        assert!(c.decrypt(&tampered).is_err());

        assert!(c.decrypt(&token[..10]).is_err());
        assert!(c.decrypt("not base64 !!").is_err());
    }

    #[test]
    fn test_struct_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            name: String,
            n: u32,
        }
        let c = codec("k1");
        let p = Payload { name: "x".into(), n: 7 };
        let token = c.encrypt_struct(&p).unwrap();
        let back: Payload = c.decrypt_struct(&token).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            EncryptionCodec::new("", 1_000),
            Err(CodecError::KeyDerivation(_))
        ));
    }
}
