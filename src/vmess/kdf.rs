use hmac::{Hmac, Mac};
use md5::{Digest as Md5Digest, Md5};
use sha2::Sha256;
use uuid::Uuid;

use super::KDF_SALT_VMESS_AEAD_KDF;

type HmacSha256 = Hmac<Sha256>;

/// 从 UUID 派生 16 字节 command key:
/// MD5(uuid || "c48619fe-8f02-49e0-b9e9-edf763e17e21")
pub fn command_key(uuid: &Uuid) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(uuid.as_bytes());
    hasher.update(b"c48619fe-8f02-49e0-b9e9-edf763e17e21");
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    key
}

/// VMess AEAD KDF：HMAC-SHA256 沿标签链进行。
/// 第一级以常量 "VMess AEAD KDF" 作为密钥吃进第一个标签，
/// 后续每级以上一级输出作为密钥吃进下一个标签，
/// 最后一级以链尾输出作为密钥吃进种子，输出 32 字节。
pub fn kdf(seed: &[u8], labels: &[&[u8]]) -> [u8; 32] {
    let mut key = KDF_SALT_VMESS_AEAD_KDF.as_bytes().to_vec();
    for label in labels {
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(label);
        key = mac.finalize().into_bytes().to_vec();
    }
    let mut mac = HmacSha256::new_from_slice(&key).unwrap();
    mac.update(seed);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

pub fn kdf16(seed: &[u8], labels: &[&[u8]]) -> [u8; 16] {
    let full = kdf(seed, labels);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}

pub fn kdf12(seed: &[u8], labels: &[&[u8]]) -> [u8; 12] {
    let full = kdf(seed, labels);
    let mut out = [0u8; 12];
    out.copy_from_slice(&full[..12]);
    out
}

/// ChaCha20-Poly1305 的 32 字节密钥固定为 MD5(k) || MD5(MD5(k))
pub fn chacha20_poly1305_key(key: &[u8; 16]) -> [u8; 32] {
    let first = Md5::digest(key);
    let second = Md5::digest(first);
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&first);
    out[16..].copy_from_slice(&second);
    out
}
