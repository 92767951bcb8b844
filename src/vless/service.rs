use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{self, Request};
use super::{COMMAND_MUX, COMMAND_TCP, COMMAND_UDP, FLOW_VISION, VERSION};
use crate::common::{Address, Error, ProxyStream};

/// 单 (用户, 源 IP) 的存活计数。active/closed 只增不减，
/// 差值即存活连接数；宽松序足够，清扫器容忍读到旧值。
pub struct IpPoolUnit {
    active: AtomicI64,
    closed: AtomicI64,
}

impl IpPoolUnit {
    fn new() -> Self {
        Self {
            active: AtomicI64::new(0),
            closed: AtomicI64::new(0),
        }
    }

    pub fn liveness(&self) -> i64 {
        self.active.load(Ordering::Relaxed) - self.closed.load(Ordering::Relaxed)
    }
}

/// 接纳凭据：连接持有它，析构时 closed 恰好加一
pub struct PoolGuard {
    unit: Arc<IpPoolUnit>,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.unit.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// 每用户的源 IP 池
pub struct UserPool {
    ipmap: RwLock<HashMap<IpAddr, Arc<IpPoolUnit>>>,
    max_login: usize,
}

impl UserPool {
    fn new(max_login: usize) -> Self {
        Self {
            ipmap: RwLock::new(HashMap::with_capacity(max_login)),
            max_login,
        }
    }

    /// 接纳一个来源：已知 IP 直接复用；新 IP 在容量内插入，超限拒绝
    fn admit(&self, source: IpAddr) -> Result<Arc<IpPoolUnit>, Error> {
        if let Some(unit) = self.ipmap.read().unwrap().get(&source) {
            return Ok(unit.clone());
        }
        let mut map = self.ipmap.write().unwrap();
        if let Some(unit) = map.get(&source) {
            return Ok(unit.clone());
        }
        if map.len() >= self.max_login {
            return Err(Error::MaxIpSessionsExceeded(source));
        }
        let unit = Arc::new(IpPoolUnit::new());
        map.insert(source, unit.clone());
        Ok(unit)
    }

    pub fn tracked_ips(&self) -> usize {
        self.ipmap.read().unwrap().len()
    }

    fn sweep(&self) -> usize {
        let stale: Vec<IpAddr> = self
            .ipmap
            .read()
            .unwrap()
            .iter()
            .filter(|(_, unit)| unit.liveness() == 0)
            .map(|(ip, _)| *ip)
            .collect();
        if stale.is_empty() {
            return 0;
        }
        let mut removed = 0;
        let mut map = self.ipmap.write().unwrap();
        for ip in stale {
            // 取得写锁后复核，避免清掉刚被复用的条目
            if map.get(&ip).is_some_and(|unit| unit.liveness() == 0) {
                map.remove(&ip);
                removed += 1;
            }
        }
        removed
    }
}

#[derive(Default)]
struct State {
    user_map: HashMap<[u8; 16], String>,
    flow_map: HashMap<String, String>,
    pool_map: HashMap<[u8; 16], Arc<UserPool>>,
}

/// 已接纳的 VLESS 连接
pub struct Accept {
    pub stream: VlessStream,
    pub user: String,
    pub command: u8,
    pub flow: Option<String>,
    pub destination: Option<Address>,
}

pub struct Service {
    state: RwLock<Arc<State>>,
    sweep_interval: Duration,
}

impl Service {
    pub fn new() -> Arc<Self> {
        Self::with_sweep_interval(Duration::from_millis(500))
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Arc<Self> {
        let service = Arc::new(Self {
            state: RwLock::new(Arc::new(State::default())),
            sweep_interval,
        });
        Self::spawn_reaper(&service);
        service
    }

    fn spawn_reaper(service: &Arc<Self>) {
        let weak = Arc::downgrade(service);
        tokio::spawn(async move {
            loop {
                let Some(service) = weak.upgrade() else {
                    break;
                };
                let interval = service.sweep_interval;
                service.sweep_once();
                drop(service);
                tokio::time::sleep(interval).await;
            }
        });
    }

    fn sweep_once(&self) {
        let state = self.state.read().unwrap().clone();
        for (uuid, pool) in &state.pool_map {
            let removed = pool.sweep();
            if removed > 0 {
                debug!(
                    user = %Uuid::from_bytes(*uuid),
                    removed,
                    "reaped idle ip pool entries"
                );
            }
        }
    }

    /// 整体替换用户表、流控表与 IP 池。读者总是观察到完整的新旧快照之一。
    pub fn update_users(
        &self,
        names: &[String],
        uuids: &[Uuid],
        flows: &[String],
        max_logins: &[u32],
    ) {
        let mut state = State::default();
        for (((name, uuid), flow), max_login) in
            names.iter().zip(uuids).zip(flows).zip(max_logins)
        {
            let max_login = (*max_login).max(1) as usize;
            state.user_map.insert(*uuid.as_bytes(), name.clone());
            state.flow_map.insert(name.clone(), flow.clone());
            state
                .pool_map
                .insert(*uuid.as_bytes(), Arc::new(UserPool::new(max_login)));
        }
        *self.state.write().unwrap() = Arc::new(state);
    }

    pub fn user_pool(&self, uuid: &Uuid) -> Option<Arc<UserPool>> {
        self.state
            .read()
            .unwrap()
            .pool_map
            .get(uuid.as_bytes())
            .cloned()
    }

    pub async fn handle_new_connection(
        &self,
        mut stream: ProxyStream,
        source: SocketAddr,
    ) -> Result<Accept, Error> {
        let request = protocol::read_request(&mut stream)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let state = self.state.read().unwrap().clone();
        let user = state
            .user_map
            .get(request.uuid.as_bytes())
            .cloned()
            .ok_or_else(|| Error::UnknownUser(request.uuid.to_string()))?;
        let pool = state
            .pool_map
            .get(request.uuid.as_bytes())
            .expect("pool map tracks user map")
            .clone();

        let unit = pool.admit(source.ip()).map_err(|e| {
            warn!(user, source = %source, "ip pool full, connection rejected");
            e
        })?;

        self.check_flow(&state, &user, &request)?;

        debug!(
            user,
            command = request.command,
            destination = request.destination.as_ref().map(|d| d.to_string()),
            "vless request accepted"
        );

        let guard = match request.command {
            COMMAND_TCP => {
                unit.active.fetch_add(1, Ordering::Relaxed);
                Some(PoolGuard { unit })
            }
            // UDP 与 Mux 不计入池：Mux 由外层分发，UDP 走包适配器
            COMMAND_UDP | COMMAND_MUX => None,
            other => {
                return Err(Error::Protocol(format!("unknown command: {}", other)));
            }
        };

        Ok(Accept {
            stream: VlessStream::new(stream, guard),
            user,
            command: request.command,
            flow: request.flow,
            destination: request.destination,
        })
    }

    fn check_flow(&self, state: &State, user: &str, request: &Request) -> Result<(), Error> {
        let expected = state.flow_map.get(user).cloned().unwrap_or_default();
        let got = request.flow.clone().unwrap_or_default();
        if got == FLOW_VISION && request.command == COMMAND_UDP {
            return Err(Error::Protocol(format!(
                "{} flow does not support UDP",
                FLOW_VISION
            )));
        }
        if got != expected {
            return Err(Error::FlowMismatch {
                expected: flow_name(&expected),
                got: flow_name(&got),
            });
        }
        Ok(())
    }
}

fn flow_name(value: &str) -> String {
    if value.is_empty() {
        "none".to_string()
    } else {
        value.to_string()
    }
}

enum WriteState {
    Ready,
    Writing { data: Vec<u8>, written: usize },
}

/// 服务端连接：首次写出时前置响应头 [Version, 0]，
/// 析构时随 PoolGuard 归还池计数
pub struct VlessStream {
    inner: ProxyStream,
    guard: Option<PoolGuard>,
    response_written: bool,
    write_state: WriteState,
}

impl VlessStream {
    fn new(inner: ProxyStream, guard: Option<PoolGuard>) -> Self {
        Self {
            inner,
            guard,
            response_written: false,
            write_state: WriteState::Ready,
        }
    }
}

impl AsyncRead for VlessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for VlessStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Ready => {
                    if this.response_written {
                        return Pin::new(&mut this.inner).poll_write(cx, buf);
                    }
                    let mut data = Vec::with_capacity(2 + buf.len());
                    data.extend_from_slice(&[VERSION, 0]);
                    data.extend_from_slice(buf);
                    this.response_written = true;
                    this.write_state = WriteState::Writing { data, written: 0 };
                }
                WriteState::Writing { data, written } => {
                    while *written < data.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &data[*written..]) {
                            Poll::Ready(Ok(n)) => {
                                if n == 0 {
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::WriteZero,
                                        "write returned 0",
                                    )));
                                }
                                *written += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    let n = data.len() - 2;
                    this.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(n));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// UDP 包适配：长度前缀帧，目的地址须为 IP
pub struct VlessPacketConn {
    stream: VlessStream,
    destination: Address,
}

impl VlessPacketConn {
    pub fn new(stream: VlessStream, destination: Address) -> Self {
        Self {
            stream,
            destination,
        }
    }

    pub async fn read_packet(&mut self) -> Result<(bytes::Bytes, SocketAddr), Error> {
        let frame = protocol::read_udp_frame(&mut self.stream)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let addr = self.destination.to_socket_addr()?;
        Ok((frame, addr))
    }

    pub async fn write_packet(&mut self, data: &[u8]) -> Result<(), Error> {
        protocol::write_udp_frame(&mut self.stream, data)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))
    }
}
