use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::chunk::{session_codec, VmessStream};
use super::header::{
    auth_id_in_window, auth_id_key, decode_auth_id, derive_response_key, derive_response_nonce,
    open_request_header, open_request_length, seal_response, ResponseHeader, AUTH_ID_MAX_SKEW,
    ENCODED_LENGTH_LEN,
};
use super::kdf::command_key;
use super::{SecurityType, CIPHER_OVERHEAD};
use crate::common::{Address, Error, ProxyStream};

/// 注册用户
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub uuid: Uuid,
}

struct ServiceUser {
    name: String,
    cmd_key: [u8; 16],
    auth_key: [u8; 16],
}

/// 已认证连接：流与请求元数据交还给嵌入方
pub struct Accept {
    pub stream: VmessStream,
    pub user: String,
    pub command: u8,
    pub destination: Option<Address>,
    pub security: SecurityType,
    pub option: u8,
}

/// 最近接受过的 AuthID 集合，窗口外条目随插入剪除
struct ReplayFilter {
    seen: HashMap<[u8; 16], u64>,
}

impl ReplayFilter {
    fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    fn check_and_insert(&mut self, auth_id: [u8; 16], now: u64) -> bool {
        self.seen
            .retain(|_, ts| now.saturating_sub(*ts) <= 2 * AUTH_ID_MAX_SKEW);
        if self.seen.contains_key(&auth_id) {
            return false;
        }
        self.seen.insert(auth_id, now);
        true
    }
}

type TimeFn = Box<dyn Fn() -> u64 + Send + Sync>;

pub struct Service {
    users: Vec<ServiceUser>,
    replay: Mutex<ReplayFilter>,
    time_fn: TimeFn,
}

impl Service {
    pub fn new(users: Vec<User>) -> Self {
        let users = users
            .into_iter()
            .map(|u| {
                let cmd_key = command_key(&u.uuid);
                ServiceUser {
                    name: u.name,
                    auth_key: auth_id_key(&cmd_key),
                    cmd_key,
                }
            })
            .collect();
        Self {
            users,
            replay: Mutex::new(ReplayFilter::new()),
            time_fn: Box::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_secs()
            }),
        }
    }

    /// 测试与回放场景下替换时钟
    pub fn with_time_fn(mut self, time_fn: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.time_fn = Box::new(time_fn);
        self
    }

    /// 逐用户试解 AuthID：CRC 通过且时间在窗口内者命中
    fn match_auth_id(&self, auth_id: &[u8; 16], now: u64) -> Option<&ServiceUser> {
        self.users.iter().find(|user| {
            decode_auth_id(&user.auth_key, auth_id)
                .map(|ts| auth_id_in_window(ts, now))
                .unwrap_or(false)
        })
    }

    /// 服务端校验顺序：AuthID → 重放 → 头长度 → 头本体 → FNV
    pub async fn handle_new_connection(
        &self,
        mut stream: ProxyStream,
        source: SocketAddr,
    ) -> Result<Accept, Error> {
        let now = (self.time_fn)();

        let mut auth_id = [0u8; 16];
        stream.read_exact(&mut auth_id).await?;

        let user = self.match_auth_id(&auth_id, now).ok_or_else(|| {
            warn!(source = %source, "rejecting connection with unmatched auth id");
            Error::UnknownUser("no user matches auth id".to_string())
        })?;

        if !self
            .replay
            .lock()
            .unwrap()
            .check_and_insert(auth_id, now)
        {
            warn!(user = user.name, "rejecting replayed auth id");
            return Err(Error::ReplayedAuthId);
        }

        let mut sealed_len = [0u8; ENCODED_LENGTH_LEN];
        stream.read_exact(&mut sealed_len).await?;
        let mut connection_nonce = [0u8; 8];
        stream.read_exact(&mut connection_nonce).await?;

        let header_len =
            open_request_length(&user.cmd_key, &auth_id, &connection_nonce, &sealed_len)?;
        let mut sealed_header = vec![0u8; header_len as usize + CIPHER_OVERHEAD];
        stream.read_exact(&mut sealed_header).await?;

        let header =
            open_request_header(&user.cmd_key, &auth_id, &connection_nonce, &sealed_header)?;

        debug!(
            user = user.name,
            source = %source,
            command = header.command,
            security = ?header.security,
            option = header.option,
            destination = header.destination.as_ref().map(|d| d.to_string()),
            "vmess request accepted"
        );

        let response_key = derive_response_key(&header.request_key);
        let response_nonce = derive_response_nonce(&header.request_nonce);
        let response = seal_response(
            &response_key,
            &response_nonce,
            &ResponseHeader {
                response_auth: header.response_auth,
                option: header.option,
                command: 0,
                command_payload: Vec::new(),
            },
        );

        let read_codec = session_codec(
            header.security,
            header.command,
            header.option,
            &header.request_key,
            &header.request_nonce,
        )?;
        let write_codec = session_codec(
            header.security,
            header.command,
            header.option,
            &response_key,
            &response_nonce,
        )?;

        Ok(Accept {
            stream: VmessStream::server(stream, read_codec, write_codec, response.to_vec()),
            user: user.name.clone(),
            command: header.command,
            destination: header.destination,
            security: header.security,
            option: header.option,
        })
    }
}
