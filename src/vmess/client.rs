use std::time::{SystemTime, UNIX_EPOCH};

use rand::{Rng, RngCore};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::chunk::{session_codec, ResponseContext, VmessStream};
use super::header::{derive_response_key, derive_response_nonce, seal_request, RequestHeader};
use super::kdf::command_key;
use super::{
    SecurityType, COMMAND_TCP, COMMAND_UDP, OPTION_AUTHENTICATED_LENGTH, OPTION_CHUNK_MASKING,
    OPTION_CHUNK_STREAM, OPTION_GLOBAL_PADDING,
};
use crate::common::{Address, Error, ProxyStream};

/// 客户端可选项；选项位在拨号时合成
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientOptions {
    pub global_padding: bool,
    pub authenticated_length: bool,
}

pub struct Client {
    uuid: Uuid,
    cmd_key: [u8; 16],
    security: SecurityType,
    global_padding: bool,
    authenticated_length: bool,
}

impl Client {
    pub fn new(uuid: Uuid, security_name: &str, options: ClientOptions) -> Result<Self, Error> {
        let security = SecurityType::from_name(security_name)?.resolve_auto();
        Ok(Self {
            uuid,
            cmd_key: command_key(&uuid),
            security,
            global_padding: options.global_padding,
            authenticated_length: options.authenticated_length,
        })
    }

    pub fn security(&self) -> SecurityType {
        self.security
    }

    fn option_byte(&self, command: u8) -> u8 {
        let mut option = 0u8;
        match self.security {
            SecurityType::None => {
                if command == COMMAND_UDP {
                    option = OPTION_CHUNK_STREAM;
                }
            }
            SecurityType::Aes128Gcm | SecurityType::Chacha20Poly1305 => {
                option = OPTION_CHUNK_STREAM;
                if self.global_padding {
                    option |= OPTION_GLOBAL_PADDING;
                }
                if self.authenticated_length {
                    option |= OPTION_AUTHENTICATED_LENGTH;
                } else {
                    option |= OPTION_CHUNK_MASKING;
                }
            }
            _ => {}
        }
        option
    }

    /// TCP 代理会话
    pub async fn dial_conn(
        &self,
        stream: ProxyStream,
        destination: Address,
    ) -> Result<VmessStream, Error> {
        self.dial(stream, COMMAND_TCP, destination).await
    }

    /// UDP 代理会话；分块边界即数据报边界
    pub async fn dial_packet_conn(
        &self,
        stream: ProxyStream,
        destination: Address,
    ) -> Result<VmessStream, Error> {
        self.dial(stream, COMMAND_UDP, destination).await
    }

    async fn dial(
        &self,
        mut stream: ProxyStream,
        command: u8,
        destination: Address,
    ) -> Result<VmessStream, Error> {
        if self.security == SecurityType::Legacy {
            return Err(Error::UnsupportedSecurityType("legacy".to_string()));
        }

        let mut request_nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut request_nonce);
        // key 槽位携带 nonce 字节；两端从同一传输值派生响应密钥
        let request_key = request_nonce;
        let response_auth: u8 = rand::random();
        let option = self.option_byte(command);

        debug!(
            uuid = %self.uuid,
            dest = %destination,
            security = ?self.security,
            option,
            "vmess dialing"
        );

        let header = RequestHeader {
            command,
            option,
            security: self.security,
            destination: Some(destination),
            request_key,
            request_nonce,
            response_auth,
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let padding_len = rand::thread_rng().gen_range(0..16);
        let request = seal_request(&self.cmd_key, &header, now, padding_len);

        stream.write_all(&request).await?;
        stream.flush().await?;

        let write_codec = session_codec(self.security, command, option, &request_key, &request_nonce)?;
        let response_key = derive_response_key(&request_key);
        let response_nonce = derive_response_nonce(&request_nonce);
        let read_codec =
            session_codec(self.security, command, option, &response_key, &response_nonce)?;

        Ok(VmessStream::client(
            stream,
            write_codec,
            read_codec,
            ResponseContext {
                key: response_key,
                nonce: response_nonce,
                expected_auth: response_auth,
            },
        ))
    }
}
