use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use chacha20poly1305::ChaCha20Poly1305;

use super::kdf::chacha20_poly1305_key;
use super::SecurityType;
use crate::common::Error;

/// AEAD 后端的标记联合：按安全类型单态分发，不走 trait object
pub enum AeadCipher {
    Aes128Gcm(Aes128Gcm),
    Chacha20Poly1305(ChaCha20Poly1305),
}

impl AeadCipher {
    pub fn aes_128_gcm(key: &[u8; 16]) -> Self {
        AeadCipher::Aes128Gcm(Aes128Gcm::new_from_slice(key).unwrap())
    }

    /// ChaCha20-Poly1305 后端；16 字节输入先经 MD5 链扩展为 32 字节
    pub fn chacha20_poly1305(key: &[u8; 16]) -> Self {
        let expanded = chacha20_poly1305_key(key);
        AeadCipher::Chacha20Poly1305(ChaCha20Poly1305::new_from_slice(&expanded).unwrap())
    }

    pub fn from_security(security: SecurityType, key: &[u8; 16]) -> Self {
        match security {
            SecurityType::Chacha20Poly1305 => Self::chacha20_poly1305(key),
            _ => Self::aes_128_gcm(key),
        }
    }

    pub fn seal(&self, nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self {
            AeadCipher::Aes128Gcm(c) => c.encrypt(Nonce::from_slice(nonce), payload).unwrap(),
            AeadCipher::Chacha20Poly1305(c) => {
                c.encrypt(Nonce::from_slice(nonce), payload).unwrap()
            }
        }
    }

    pub fn open(&self, nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let result = match self {
            AeadCipher::Aes128Gcm(c) => c.decrypt(Nonce::from_slice(nonce), payload),
            AeadCipher::Chacha20Poly1305(c) => c.decrypt(Nonce::from_slice(nonce), payload),
        };
        result.map_err(|_| Error::AeadAuthFailed)
    }
}

/// 分块 nonce：前 2 字节为 big-endian 计数器，后 10 字节取自会话 nonce。
/// 计数器仅在一次 seal/open 成功后步进。
pub struct ChunkNonce {
    buf: [u8; 12],
    count: u16,
}

impl ChunkNonce {
    pub fn new(session_nonce: &[u8]) -> Self {
        let mut buf = [0u8; 12];
        buf[2..].copy_from_slice(&session_nonce[2..12]);
        Self { buf, count: 0 }
    }

    pub fn current(&mut self) -> &[u8; 12] {
        self.buf[..2].copy_from_slice(&self.count.to_be_bytes());
        &self.buf
    }

    pub fn advance(&mut self) {
        self.count = self.count.wrapping_add(1);
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> u16 {
        self.count
    }
}

/// 按块封装/解封载荷：AAD 为空，nonce 计数器独立于长度子流
pub struct PayloadCipher {
    cipher: AeadCipher,
    nonce: ChunkNonce,
}

impl PayloadCipher {
    pub fn new(security: SecurityType, key: &[u8; 16], session_nonce: &[u8; 16]) -> Self {
        Self {
            cipher: AeadCipher::from_security(security, key),
            nonce: ChunkNonce::new(session_nonce),
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let sealed = self.cipher.seal(self.nonce.current(), plaintext, &[]);
        self.nonce.advance();
        sealed
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let plain = self.cipher.open(self.nonce.current(), ciphertext, &[])?;
        self.nonce.advance();
        Ok(plain)
    }
}
