use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::{COMMAND_MUX, VERSION};
use crate::common::Address;

/// 已解析的 VLESS 请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub uuid: Uuid,
    pub flow: Option<String>,
    pub command: u8,
    pub destination: Option<Address>,
}

/// 编码并发送 VLESS 请求头
///
/// 格式:
/// [Version: 1B = 0x00]
/// [UUID: 16B]
/// [Addons Length: 1B]
/// [Addons: 变长 (protobuf 编码的 flow)]
/// [Command: 1B]
/// [Port: 2B big-endian]
/// [AddrType: 1B] [Address: 变长]
pub async fn write_request<S: AsyncWrite + Unpin>(
    stream: &mut S,
    uuid: &Uuid,
    target: &Address,
    flow: Option<&str>,
    command: u8,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_u8(VERSION);
    buf.put_slice(uuid.as_bytes());

    let addons = encode_addons(flow);
    buf.put_u8(addons.len() as u8);
    if !addons.is_empty() {
        buf.put_slice(&addons);
    }

    buf.put_u8(command);
    if command != COMMAND_MUX {
        target.write_addr_port(&mut buf);
    }

    stream.write_all(&buf).await?;
    stream.flush().await?;

    Ok(())
}

/// 服务端：读取并解析 VLESS 请求头（与 write_request 对称）
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Request> {
    let version = stream.read_u8().await?;
    if version != VERSION {
        anyhow::bail!("unsupported VLESS version: 0x{:02x}", version);
    }

    let mut uuid_bytes = [0u8; 16];
    stream.read_exact(&mut uuid_bytes).await?;
    let uuid = Uuid::from_bytes(uuid_bytes);

    let addons_len = stream.read_u8().await? as usize;
    let flow = if addons_len > 0 {
        let mut addons = vec![0u8; addons_len];
        stream.read_exact(&mut addons).await?;
        decode_addons(&addons)?
    } else {
        None
    };

    let command = stream.read_u8().await?;
    let destination = if command != COMMAND_MUX {
        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;
        let port = u16::from_be_bytes([header[0], header[1]]);
        let addr_type = header[2];
        let body_len = match addr_type {
            crate::common::addr::ADDR_TYPE_IPV4 => 4,
            crate::common::addr::ADDR_TYPE_IPV6 => 16,
            crate::common::addr::ADDR_TYPE_DOMAIN => {
                1 + stream.read_u8().await? as usize
            }
            other => anyhow::bail!("unknown VLESS address type: 0x{:02x}", other),
        };
        // 重组为序列化器的输入再走统一解码
        let mut raw = BytesMut::with_capacity(3 + body_len);
        raw.put_u16(port);
        raw.put_u8(addr_type);
        if addr_type == crate::common::addr::ADDR_TYPE_DOMAIN {
            let domain_len = body_len - 1;
            raw.put_u8(domain_len as u8);
            let mut domain = vec![0u8; domain_len];
            stream.read_exact(&mut domain).await?;
            raw.put_slice(&domain);
        } else {
            let mut body = vec![0u8; body_len];
            stream.read_exact(&mut body).await?;
            raw.put_slice(&body);
        }
        let mut cursor: &[u8] = &raw;
        Some(Address::read_addr_port(&mut cursor)?)
    } else {
        None
    };

    Ok(Request {
        uuid,
        flow,
        command,
        destination,
    })
}

/// 读取 VLESS 响应头: [Version: 1B] [Addons Length: 1B] [Addons: 变长]
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    let version = stream.read_u8().await?;
    if version != VERSION {
        anyhow::bail!("unexpected VLESS response version: 0x{:02x}", version);
    }

    let addons_len = stream.read_u8().await?;
    if addons_len > 0 {
        let mut addons = vec![0u8; addons_len as usize];
        stream.read_exact(&mut addons).await?;
    }

    Ok(())
}

/// 写入 VLESS UDP 帧: [Length: 2B Big-Endian][Payload: N bytes]
pub async fn write_udp_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<()> {
    let len = data.len() as u16;
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u16(len);
    buf.put_slice(data);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// 读取 VLESS UDP 帧: [Length: 2B Big-Endian][Payload: N bytes]
pub async fn read_udp_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Bytes> {
    let len = stream.read_u16().await? as usize;
    if len == 0 {
        anyhow::bail!("VLESS UDP frame with zero length");
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// 编码 Addons 为 protobuf 格式
/// Addons { Flow: string = field 1 }
/// Protobuf: tag=0x0A (field 1, wire type 2), varint length, string bytes
fn encode_addons(flow: Option<&str>) -> Vec<u8> {
    match flow {
        Some(f) if !f.is_empty() => {
            let mut buf = Vec::with_capacity(2 + f.len());
            buf.push(0x0A);
            buf.push(f.len() as u8); // flow 名称不超过 127 字节
            buf.extend_from_slice(f.as_bytes());
            buf
        }
        _ => Vec::new(),
    }
}

/// 解码 Addons；只识别 field 1 的 flow 字符串
fn decode_addons(addons: &[u8]) -> Result<Option<String>> {
    let mut buf = addons;
    if buf.is_empty() {
        return Ok(None);
    }
    let tag = buf.get_u8();
    if tag != 0x0A {
        return Ok(None);
    }
    if buf.remaining() < 1 {
        anyhow::bail!("truncated addons");
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        anyhow::bail!("truncated addons flow");
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    let flow = String::from_utf8(raw).map_err(|_| anyhow::anyhow!("invalid flow encoding"))?;
    if flow.is_empty() {
        Ok(None)
    } else {
        Ok(Some(flow))
    }
}
