use aes_gcm::aes::cipher::generic_array::GenericArray;
use aes_gcm::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes_gcm::aes::Aes128;
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};

use super::aead::AeadCipher;
use super::kdf::{kdf12, kdf16};
use super::{
    SecurityType, CIPHER_OVERHEAD, COMMAND_MUX, KDF_SALT_AEAD_RESP_HEADER_IV,
    KDF_SALT_AEAD_RESP_HEADER_KEY, KDF_SALT_AEAD_RESP_HEADER_LEN_IV,
    KDF_SALT_AEAD_RESP_HEADER_LEN_KEY, KDF_SALT_AUTH_ID_ENCRYPTION_KEY,
    KDF_SALT_VMESS_HEADER_AEAD_KEY, KDF_SALT_VMESS_HEADER_AEAD_KEY_LENGTH,
    KDF_SALT_VMESS_HEADER_AEAD_NONCE, KDF_SALT_VMESS_HEADER_AEAD_NONCE_LENGTH, VERSION,
};
use crate::common::{Address, Error};

pub const AUTH_ID_LEN: usize = 16;
pub const CONNECTION_NONCE_LEN: usize = 8;
pub const ENCODED_LENGTH_LEN: usize = 2 + CIPHER_OVERHEAD;

/// AuthID 有效窗口：服务端时钟 ±120 秒
pub const AUTH_ID_MAX_SKEW: u64 = 120;

pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// AuthID 的 AES 块密钥，按用户缓存一次
pub fn auth_id_key(cmd_key: &[u8; 16]) -> [u8; 16] {
    kdf16(cmd_key, &[KDF_SALT_AUTH_ID_ENCRYPTION_KEY.as_bytes()])
}

/// 生成 AuthID：BE64(秒) || 4 随机字节 || CRC32，整块 AES-ECB 加密
pub fn generate_auth_id(cmd_key: &[u8; 16], unix_secs: u64) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(&unix_secs.to_be_bytes());
    block[8..12].copy_from_slice(&rand::random::<u32>().to_be_bytes());
    let checksum = crc32fast::hash(&block[..12]);
    block[12..].copy_from_slice(&checksum.to_be_bytes());

    let cipher = Aes128::new(GenericArray::from_slice(&auth_id_key(cmd_key)));
    let mut out = *GenericArray::from_slice(&block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// 尝试用某个用户的块密钥解开 AuthID，校验通过时返回其时间戳
pub fn decode_auth_id(auth_key: &[u8; 16], auth_id: &[u8; 16]) -> Option<u64> {
    let cipher = Aes128::new(GenericArray::from_slice(auth_key));
    let mut block = *GenericArray::from_slice(auth_id);
    cipher.decrypt_block(&mut block);

    let checksum = u32::from_be_bytes([block[12], block[13], block[14], block[15]]);
    if crc32fast::hash(&block[..12]) != checksum {
        return None;
    }
    Some(u64::from_be_bytes([
        block[0], block[1], block[2], block[3], block[4], block[5], block[6], block[7],
    ]))
}

pub fn auth_id_in_window(timestamp: u64, now: u64) -> bool {
    now.abs_diff(timestamp) <= AUTH_ID_MAX_SKEW
}

/// 请求头字段（明文侧）
pub struct RequestHeader {
    pub command: u8,
    pub option: u8,
    pub security: SecurityType,
    pub destination: Option<Address>,
    pub request_key: [u8; 16],
    pub request_nonce: [u8; 16],
    pub response_auth: u8,
}

impl RequestHeader {
    fn plain_len(&self, padding_len: usize) -> usize {
        let addr_len = match (self.command, &self.destination) {
            (cmd, Some(dest)) if cmd != COMMAND_MUX => dest.addr_port_len(),
            _ => 0,
        };
        1 + 16 + 16 + 1 + 1 + 1 + 1 + 1 + addr_len + padding_len + 4
    }
}

/// 构造完整请求：AuthID(16) || EncLen(18) || ConnectionNonce(8) || EncHeader(H+16)
pub fn seal_request(
    cmd_key: &[u8; 16],
    header: &RequestHeader,
    unix_secs: u64,
    padding_len: usize,
) -> BytesMut {
    debug_assert!(padding_len < 16);
    let auth_id = generate_auth_id(cmd_key, unix_secs);
    let connection_nonce: [u8; 8] = rand::random();

    let header_len = header.plain_len(padding_len);
    let mut plain = BytesMut::with_capacity(header_len);
    plain.put_u8(VERSION);
    plain.put_slice(&header.request_nonce);
    plain.put_slice(&header.request_key);
    plain.put_u8(header.response_auth);
    plain.put_u8(header.option);
    plain.put_u8(((padding_len as u8) << 4) | header.security.to_byte());
    plain.put_u8(0);
    plain.put_u8(header.command);
    if header.command != COMMAND_MUX {
        if let Some(dest) = &header.destination {
            dest.write_addr_port(&mut plain);
        }
    }
    for _ in 0..padding_len {
        plain.put_u8(rand::random());
    }
    let checksum = fnv1a32(&plain);
    plain.put_u32(checksum);
    debug_assert_eq!(plain.len(), header_len);

    let length_cipher = AeadCipher::aes_128_gcm(&kdf16(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_AEAD_KEY_LENGTH.as_bytes(),
            &auth_id,
            &connection_nonce,
        ],
    ));
    let length_nonce = kdf12(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_AEAD_NONCE_LENGTH.as_bytes(),
            &auth_id,
            &connection_nonce,
        ],
    );
    let sealed_length = length_cipher.seal(
        &length_nonce,
        &(header_len as u16).to_be_bytes(),
        &auth_id,
    );

    let header_cipher = AeadCipher::aes_128_gcm(&kdf16(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_AEAD_KEY.as_bytes(),
            &auth_id,
            &connection_nonce,
        ],
    ));
    let header_nonce = kdf12(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_AEAD_NONCE.as_bytes(),
            &auth_id,
            &connection_nonce,
        ],
    );
    let sealed_header = header_cipher.seal(&header_nonce, &plain, &auth_id);

    let mut request = BytesMut::with_capacity(
        AUTH_ID_LEN + ENCODED_LENGTH_LEN + CONNECTION_NONCE_LEN + sealed_header.len(),
    );
    request.put_slice(&auth_id);
    request.put_slice(&sealed_length);
    request.put_slice(&connection_nonce);
    request.put_slice(&sealed_header);
    request
}

/// 服务端：解开 EncLen，得到明文头长度
pub fn open_request_length(
    cmd_key: &[u8; 16],
    auth_id: &[u8; 16],
    connection_nonce: &[u8; 8],
    sealed: &[u8],
) -> Result<u16, Error> {
    let cipher = AeadCipher::aes_128_gcm(&kdf16(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_AEAD_KEY_LENGTH.as_bytes(),
            auth_id,
            connection_nonce,
        ],
    ));
    let nonce = kdf12(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_AEAD_NONCE_LENGTH.as_bytes(),
            auth_id,
            connection_nonce,
        ],
    );
    let plain = cipher.open(&nonce, sealed, auth_id)?;
    if plain.len() != 2 {
        return Err(Error::Protocol("bad header length block".to_string()));
    }
    Ok(u16::from_be_bytes([plain[0], plain[1]]))
}

/// 服务端：解开 EncHeader 并解析全部字段，校验版本与 FNV 尾
pub fn open_request_header(
    cmd_key: &[u8; 16],
    auth_id: &[u8; 16],
    connection_nonce: &[u8; 8],
    sealed: &[u8],
) -> Result<RequestHeader, Error> {
    let cipher = AeadCipher::aes_128_gcm(&kdf16(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_AEAD_KEY.as_bytes(),
            auth_id,
            connection_nonce,
        ],
    ));
    let nonce = kdf12(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_AEAD_NONCE.as_bytes(),
            auth_id,
            connection_nonce,
        ],
    );
    let plain = cipher.open(&nonce, sealed, auth_id)?;
    parse_request_header(&plain)
}

fn parse_request_header(plain: &[u8]) -> Result<RequestHeader, Error> {
    if plain.len() < 1 + 16 + 16 + 1 + 1 + 1 + 1 + 1 + 4 {
        return Err(Error::Protocol("request header too short".to_string()));
    }
    let mut buf = &plain[..plain.len() - 4];
    let checksum = u32::from_be_bytes([
        plain[plain.len() - 4],
        plain[plain.len() - 3],
        plain[plain.len() - 2],
        plain[plain.len() - 1],
    ]);
    if fnv1a32(buf) != checksum {
        return Err(Error::Protocol("request header checksum mismatch".to_string()));
    }

    let version = buf.get_u8();
    if version != VERSION {
        return Err(Error::Protocol(format!(
            "unexpected request version: {}",
            version
        )));
    }
    let mut request_nonce = [0u8; 16];
    buf.copy_to_slice(&mut request_nonce);
    let mut request_key = [0u8; 16];
    buf.copy_to_slice(&mut request_key);
    let response_auth = buf.get_u8();
    let option = buf.get_u8();
    let padding_security = buf.get_u8();
    let padding_len = (padding_security >> 4) as usize;
    let security = SecurityType::from_byte(padding_security & 0x0f)?;
    let _reserved = buf.get_u8();
    let command = buf.get_u8();

    let destination = if command != COMMAND_MUX {
        Some(
            Address::read_addr_port(&mut buf)
                .map_err(|e| Error::Protocol(format!("bad destination: {}", e)))?,
        )
    } else {
        None
    };

    if buf.remaining() != padding_len {
        return Err(Error::Protocol("request header padding mismatch".to_string()));
    }

    Ok(RequestHeader {
        command,
        option,
        security,
        destination,
        request_key,
        request_nonce,
        response_auth,
    })
}

pub fn derive_response_key(request_key: &[u8; 16]) -> [u8; 16] {
    let digest = Sha256::digest(request_key);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

pub fn derive_response_nonce(request_nonce: &[u8; 16]) -> [u8; 16] {
    let digest = Sha256::digest(request_nonce);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// 响应头字段
pub struct ResponseHeader {
    pub response_auth: u8,
    pub option: u8,
    pub command: u8,
    pub command_payload: Vec<u8>,
}

/// 服务端：封装响应头 EncLen(18) || EncBody(len+16)，AAD 为空
pub fn seal_response(
    response_key: &[u8; 16],
    response_nonce: &[u8; 16],
    header: &ResponseHeader,
) -> BytesMut {
    let mut body = BytesMut::with_capacity(4 + header.command_payload.len());
    body.put_u8(header.response_auth);
    body.put_u8(header.option);
    body.put_u8(header.command);
    body.put_u8(header.command_payload.len() as u8);
    body.put_slice(&header.command_payload);

    let length_cipher = AeadCipher::aes_128_gcm(&kdf16(
        response_key,
        &[KDF_SALT_AEAD_RESP_HEADER_LEN_KEY.as_bytes()],
    ));
    let length_nonce = kdf12(
        response_nonce,
        &[KDF_SALT_AEAD_RESP_HEADER_LEN_IV.as_bytes()],
    );
    let sealed_length =
        length_cipher.seal(&length_nonce, &(body.len() as u16).to_be_bytes(), &[]);

    let body_cipher = AeadCipher::aes_128_gcm(&kdf16(
        response_key,
        &[KDF_SALT_AEAD_RESP_HEADER_KEY.as_bytes()],
    ));
    let body_nonce = kdf12(response_nonce, &[KDF_SALT_AEAD_RESP_HEADER_IV.as_bytes()]);
    let sealed_body = body_cipher.seal(&body_nonce, &body, &[]);

    let mut out = BytesMut::with_capacity(sealed_length.len() + sealed_body.len());
    out.put_slice(&sealed_length);
    out.put_slice(&sealed_body);
    out
}

/// 客户端：解开响应头长度块
pub fn open_response_length(
    response_key: &[u8; 16],
    response_nonce: &[u8; 16],
    sealed: &[u8],
) -> Result<u16, Error> {
    let cipher = AeadCipher::aes_128_gcm(&kdf16(
        response_key,
        &[KDF_SALT_AEAD_RESP_HEADER_LEN_KEY.as_bytes()],
    ));
    let nonce = kdf12(
        response_nonce,
        &[KDF_SALT_AEAD_RESP_HEADER_LEN_IV.as_bytes()],
    );
    let plain = cipher.open(&nonce, sealed, &[])?;
    if plain.len() != 2 {
        return Err(Error::Protocol("bad response length block".to_string()));
    }
    Ok(u16::from_be_bytes([plain[0], plain[1]]))
}

/// 客户端：解开响应头本体
pub fn open_response_body(
    response_key: &[u8; 16],
    response_nonce: &[u8; 16],
    sealed: &[u8],
) -> Result<ResponseHeader, Error> {
    let cipher = AeadCipher::aes_128_gcm(&kdf16(
        response_key,
        &[KDF_SALT_AEAD_RESP_HEADER_KEY.as_bytes()],
    ));
    let nonce = kdf12(response_nonce, &[KDF_SALT_AEAD_RESP_HEADER_IV.as_bytes()]);
    let plain = cipher.open(&nonce, sealed, &[])?;
    if plain.len() < 4 {
        return Err(Error::Protocol("response header too short".to_string()));
    }
    let command_len = plain[3] as usize;
    if plain.len() != 4 + command_len {
        return Err(Error::Protocol("response command length mismatch".to_string()));
    }
    Ok(ResponseHeader {
        response_auth: plain[0],
        option: plain[1],
        command: plain[2],
        command_payload: plain[4..].to_vec(),
    })
}
