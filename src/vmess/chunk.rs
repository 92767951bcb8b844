use std::pin::Pin;
use std::task::{Context, Poll};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::aead::{AeadCipher, ChunkNonce, PayloadCipher};
use super::header::{self, ENCODED_LENGTH_LEN};
use super::kdf::kdf16;
use super::shake::ShakeStream;
use super::{
    SecurityType, CIPHER_OVERHEAD, COMMAND_UDP, KDF_SALT_AUTH_LEN, OPTION_AUTHENTICATED_LENGTH,
    OPTION_CHUNK_MASKING, OPTION_CHUNK_STREAM, OPTION_GLOBAL_PADDING,
};
use crate::common::{Error, ProxyStream};

/// 单个分块在线路上的数据上限
pub const MAX_CHUNK_SIZE: usize = 65535;
/// 全局 padding 单块上限
pub const MAX_PADDING_SIZE: usize = 64;
/// 写侧每块数据量（含 tag），大写入自动分片
pub const WRITE_CHUNK_SIZE: usize = 16384;

/// 长度字段编码：明文（可选掩码）或独立 AEAD
pub enum LengthCodec {
    Plain { masking: Option<ShakeStream> },
    Aead { cipher: AeadCipher, nonce: ChunkNonce },
}

impl LengthCodec {
    pub fn plain() -> Self {
        LengthCodec::Plain { masking: None }
    }

    pub fn masked(session_nonce: &[u8]) -> Self {
        LengthCodec::Plain {
            masking: Some(ShakeStream::new(session_nonce)),
        }
    }

    /// 长度 AEAD：密钥为 KDF(sessionKey, "auth_len")[0..16]，算法族随会话安全类型
    pub fn aead(security: SecurityType, session_key: &[u8; 16], session_nonce: &[u8; 16]) -> Self {
        let key = kdf16(session_key, &[KDF_SALT_AUTH_LEN.as_bytes()]);
        LengthCodec::Aead {
            cipher: AeadCipher::from_security(security, &key),
            nonce: ChunkNonce::new(session_nonce),
        }
    }

    pub fn wire_len(&self) -> usize {
        match self {
            LengthCodec::Plain { .. } => 2,
            LengthCodec::Aead { .. } => ENCODED_LENGTH_LEN,
        }
    }
}

/// 单方向的分块编解码器：长度编码 + 可选 padding 流 + 可选载荷 AEAD
pub struct ChunkCodec {
    length: LengthCodec,
    padding: Option<ShakeStream>,
    payload: Option<PayloadCipher>,
}

impl ChunkCodec {
    pub fn new(
        length: LengthCodec,
        padding: Option<ShakeStream>,
        payload: Option<PayloadCipher>,
    ) -> Self {
        Self {
            length,
            padding,
            payload,
        }
    }

    pub fn length_field_len(&self) -> usize {
        self.length.wire_len()
    }

    /// 写侧单块明文上限
    pub fn max_write_payload(&self) -> usize {
        if self.payload.is_some() {
            WRITE_CHUNK_SIZE - CIPHER_OVERHEAD
        } else {
            WRITE_CHUNK_SIZE
        }
    }

    /// 编码一个完整分块：长度字段 || 数据 || padding。
    /// 抽取顺序固定：padding 流在先，掩码流在后，两端一致。
    pub fn encode_chunk(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let sealed = match &mut self.payload {
            Some(cipher) => cipher.seal(plaintext),
            None => plaintext.to_vec(),
        };
        let padding_len = self
            .padding
            .as_mut()
            .map(|s| s.next_padding_len())
            .unwrap_or(0);
        let data_len = sealed.len() + padding_len;
        debug_assert!(data_len <= MAX_CHUNK_SIZE);

        let mut out = Vec::with_capacity(self.length.wire_len() + data_len);
        match &mut self.length {
            LengthCodec::Plain { masking } => {
                let mut value = data_len as u16;
                if let Some(mask) = masking {
                    value ^= mask.next_u16();
                }
                out.extend_from_slice(&value.to_be_bytes());
            }
            LengthCodec::Aead { cipher, nonce } => {
                let value = (data_len - CIPHER_OVERHEAD) as u16;
                let sealed_len = cipher.seal(nonce.current(), &value.to_be_bytes(), &[]);
                nonce.advance();
                out.extend_from_slice(&sealed_len);
            }
        }
        out.extend_from_slice(&sealed);
        if padding_len > 0 {
            let mut pad = vec![0u8; padding_len];
            rand::thread_rng().fill_bytes(&mut pad);
            out.extend_from_slice(&pad);
        }
        out
    }

    /// 解码长度字段，返回 (数据长度, padding 长度)。
    /// 数据长度减去 padding 后 ≤ 0 视为致命错误。
    pub fn decode_length(&mut self, raw: &[u8]) -> Result<(usize, usize), Error> {
        let (length, padding_len) = match &mut self.length {
            LengthCodec::Plain { masking } => {
                let mut value = u16::from_be_bytes([raw[0], raw[1]]);
                let padding_len = self
                    .padding
                    .as_mut()
                    .map(|s| s.next_padding_len())
                    .unwrap_or(0);
                if let Some(mask) = masking {
                    value ^= mask.next_u16();
                }
                (value as usize, padding_len)
            }
            LengthCodec::Aead { cipher, nonce } => {
                let plain = cipher.open(nonce.current(), raw, &[])?;
                nonce.advance();
                let value = u16::from_be_bytes([plain[0], plain[1]]) as usize + CIPHER_OVERHEAD;
                let padding_len = self
                    .padding
                    .as_mut()
                    .map(|s| s.next_padding_len())
                    .unwrap_or(0);
                (value, padding_len)
            }
        };
        if length <= padding_len {
            return Err(Error::BadLengthChunk {
                length: length as u16,
                padding: padding_len,
            });
        }
        Ok((length - padding_len, padding_len))
    }

    /// 解封数据段（不含 padding）
    pub fn decode_data(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match &mut self.payload {
            Some(cipher) => cipher.open(data),
            None => Ok(data.to_vec()),
        }
    }
}

/// 会话装配：由 (security, command, option) 选择一个方向的编解码器。
/// None 表示该方向为透传，不分块。
pub fn session_codec(
    security: SecurityType,
    command: u8,
    option: u8,
    session_key: &[u8; 16],
    session_nonce: &[u8; 16],
) -> Result<Option<ChunkCodec>, Error> {
    match security {
        SecurityType::Zero => Ok(None),
        SecurityType::None => {
            if option & OPTION_CHUNK_STREAM != 0 || command == COMMAND_UDP {
                let masking = (option & OPTION_CHUNK_MASKING != 0)
                    .then(|| ShakeStream::new(session_nonce));
                let padding = (option & OPTION_GLOBAL_PADDING != 0)
                    .then(|| ShakeStream::new(session_nonce));
                Ok(Some(ChunkCodec::new(
                    LengthCodec::Plain { masking },
                    padding,
                    None,
                )))
            } else {
                Ok(None)
            }
        }
        SecurityType::Aes128Gcm | SecurityType::Chacha20Poly1305 => {
            let payload = PayloadCipher::new(security, session_key, session_nonce);
            let length = if option & OPTION_AUTHENTICATED_LENGTH != 0 {
                LengthCodec::aead(security, session_key, session_nonce)
            } else if option & OPTION_CHUNK_MASKING != 0 {
                LengthCodec::masked(session_nonce)
            } else {
                LengthCodec::plain()
            };
            let padding =
                (option & OPTION_GLOBAL_PADDING != 0).then(|| ShakeStream::new(session_nonce));
            Ok(Some(ChunkCodec::new(length, padding, Some(payload))))
        }
        SecurityType::Legacy => Err(Error::UnsupportedSecurityType("legacy".to_string())),
        SecurityType::Auto => Err(Error::UnsupportedSecurityType("auto".to_string())),
    }
}

/// 客户端侧延迟解析的响应头上下文
pub(crate) struct ResponseContext {
    pub key: [u8; 16],
    pub nonce: [u8; 16],
    pub expected_auth: u8,
}

enum ReadState {
    ResponseLength {
        buf: [u8; ENCODED_LENGTH_LEN],
        read: usize,
    },
    ResponseBody {
        buf: Vec<u8>,
        read: usize,
    },
    Length {
        buf: [u8; ENCODED_LENGTH_LEN],
        read: usize,
    },
    Data {
        buf: Vec<u8>,
        read: usize,
        padding: usize,
    },
    Raw,
}

enum WriteState {
    Ready,
    Writing {
        data: Vec<u8>,
        written: usize,
        consumed: usize,
    },
}

/// VMess 双工会话：读侧缓存整块明文并支持任意大小的调用方缓冲区，
/// 写侧自动分片。客户端在首次读时解析响应头；服务端在首次写时
/// 前置已封装的响应头。
pub struct VmessStream {
    inner: ProxyStream,
    read_codec: Option<ChunkCodec>,
    write_codec: Option<ChunkCodec>,
    response: Option<ResponseContext>,
    pending_header: Option<Vec<u8>>,
    read_state: ReadState,
    write_state: WriteState,
    read_buf: Vec<u8>,
    read_pos: usize,
    eof: bool,
}

impl VmessStream {
    pub(crate) fn client(
        inner: ProxyStream,
        write_codec: Option<ChunkCodec>,
        read_codec: Option<ChunkCodec>,
        response: ResponseContext,
    ) -> Self {
        Self {
            inner,
            read_codec,
            write_codec,
            response: Some(response),
            pending_header: None,
            read_state: ReadState::ResponseLength {
                buf: [0u8; ENCODED_LENGTH_LEN],
                read: 0,
            },
            write_state: WriteState::Ready,
            read_buf: Vec::new(),
            read_pos: 0,
            eof: false,
        }
    }

    pub(crate) fn server(
        inner: ProxyStream,
        read_codec: Option<ChunkCodec>,
        write_codec: Option<ChunkCodec>,
        response_header: Vec<u8>,
    ) -> Self {
        let read_state = if read_codec.is_some() {
            ReadState::Length {
                buf: [0u8; ENCODED_LENGTH_LEN],
                read: 0,
            }
        } else {
            ReadState::Raw
        };
        Self {
            inner,
            read_codec,
            write_codec,
            response: None,
            pending_header: Some(response_header),
            read_state,
            write_state: WriteState::Ready,
            read_buf: Vec::new(),
            read_pos: 0,
            eof: false,
        }
    }

    /// 双端编解码器直连（测试与无握手组合用）
    pub fn framed(
        inner: ProxyStream,
        write_codec: Option<ChunkCodec>,
        read_codec: Option<ChunkCodec>,
    ) -> Self {
        let read_state = if read_codec.is_some() {
            ReadState::Length {
                buf: [0u8; ENCODED_LENGTH_LEN],
                read: 0,
            }
        } else {
            ReadState::Raw
        };
        Self {
            inner,
            read_codec,
            write_codec,
            response: None,
            pending_header: None,
            read_state,
            write_state: WriteState::Ready,
            read_buf: Vec::new(),
            read_pos: 0,
            eof: false,
        }
    }

    fn poll_fill(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
        read: &mut usize,
    ) -> Poll<std::io::Result<bool>> {
        // 返回 true 表示缓冲区已填满；起始即 EOF 时返回 false
        while *read < buf.len() {
            let mut rb = ReadBuf::new(&mut buf[*read..]);
            match Pin::new(&mut self.inner).poll_read(cx, &mut rb) {
                Poll::Ready(Ok(())) => {
                    let n = rb.filled().len();
                    if n == 0 {
                        if *read == 0 {
                            return Poll::Ready(Ok(false));
                        }
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "stream closed inside a chunk",
                        )));
                    }
                    *read += n;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(true))
    }
}

impl AsyncRead for VmessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.eof {
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.read_pos < this.read_buf.len() {
                let remaining = &this.read_buf[this.read_pos..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                this.read_pos += to_copy;
                if this.read_pos >= this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::ResponseLength { buf: len_buf, read } => {
                    let mut len_buf = *len_buf;
                    let mut count = *read;
                    let filled = match this.poll_fill(cx, &mut len_buf, &mut count) {
                        Poll::Ready(Ok(v)) => v,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            this.read_state = ReadState::ResponseLength {
                                buf: len_buf,
                                read: count,
                            };
                            return Poll::Pending;
                        }
                    };
                    if !filled {
                        this.eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    let ctx = this.response.as_ref().expect("response context");
                    let body_len = header::open_response_length(&ctx.key, &ctx.nonce, &len_buf)
                        .map_err(std::io::Error::from)?;
                    this.read_state = ReadState::ResponseBody {
                        buf: vec![0u8; body_len as usize + CIPHER_OVERHEAD],
                        read: 0,
                    };
                }
                ReadState::ResponseBody { buf: body_buf, read } => {
                    let mut body_buf = std::mem::take(body_buf);
                    let mut count = *read;
                    let filled = match this.poll_fill(cx, &mut body_buf, &mut count) {
                        Poll::Ready(Ok(v)) => v,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            this.read_state = ReadState::ResponseBody {
                                buf: body_buf,
                                read: count,
                            };
                            return Poll::Pending;
                        }
                    };
                    if !filled {
                        this.eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    let ctx = this.response.take().expect("response context");
                    let resp = header::open_response_body(&ctx.key, &ctx.nonce, &body_buf)
                        .map_err(std::io::Error::from)?;
                    if resp.response_auth != ctx.expected_auth {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "response auth mismatch",
                        )));
                    }
                    debug!(option = resp.option, command = resp.command, "response header accepted");
                    this.read_state = if this.read_codec.is_some() {
                        ReadState::Length {
                            buf: [0u8; ENCODED_LENGTH_LEN],
                            read: 0,
                        }
                    } else {
                        ReadState::Raw
                    };
                }
                ReadState::Length { buf: len_buf, read } => {
                    let wire_len = this
                        .read_codec
                        .as_ref()
                        .expect("length state without codec")
                        .length_field_len();
                    let mut len_buf = *len_buf;
                    let mut count = *read;
                    let filled =
                        match this.poll_fill(cx, &mut len_buf[..wire_len], &mut count) {
                            Poll::Ready(Ok(v)) => v,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => {
                                this.read_state = ReadState::Length {
                                    buf: len_buf,
                                    read: count,
                                };
                                return Poll::Pending;
                            }
                        };
                    if !filled {
                        this.eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    let codec = this.read_codec.as_mut().expect("length state without codec");
                    let (data_len, padding) = codec
                        .decode_length(&len_buf[..wire_len])
                        .map_err(std::io::Error::from)?;
                    this.read_state = ReadState::Data {
                        buf: vec![0u8; data_len + padding],
                        read: 0,
                        padding,
                    };
                }
                ReadState::Data {
                    buf: data_buf,
                    read,
                    padding,
                } => {
                    let padding = *padding;
                    let mut data_buf = std::mem::take(data_buf);
                    let mut count = *read;
                    let filled = match this.poll_fill(cx, &mut data_buf, &mut count) {
                        Poll::Ready(Ok(v)) => v,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            this.read_state = ReadState::Data {
                                buf: data_buf,
                                read: count,
                                padding,
                            };
                            return Poll::Pending;
                        }
                    };
                    if !filled {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "stream closed inside a chunk",
                        )));
                    }
                    let codec = this.read_codec.as_mut().expect("data state without codec");
                    let data = &data_buf[..data_buf.len() - padding];
                    let plain = codec.decode_data(data).map_err(std::io::Error::from)?;
                    this.read_buf = plain;
                    this.read_pos = 0;
                    this.read_state = ReadState::Length {
                        buf: [0u8; ENCODED_LENGTH_LEN],
                        read: 0,
                    };
                }
                ReadState::Raw => {
                    return Pin::new(&mut this.inner).poll_read(cx, buf);
                }
            }
        }
    }
}

impl AsyncWrite for VmessStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    match &mut this.write_codec {
                        None => {
                            if let Some(header) = this.pending_header.take() {
                                let mut data = header;
                                data.extend_from_slice(buf);
                                this.write_state = WriteState::Writing {
                                    data,
                                    written: 0,
                                    consumed: buf.len(),
                                };
                            } else {
                                return Pin::new(&mut this.inner).poll_write(cx, buf);
                            }
                        }
                        Some(codec) => {
                            let chunk_len = buf.len().min(codec.max_write_payload());
                            let mut data = this.pending_header.take().unwrap_or_default();
                            data.extend_from_slice(&codec.encode_chunk(&buf[..chunk_len]));
                            this.write_state = WriteState::Writing {
                                data,
                                written: 0,
                                consumed: chunk_len,
                            };
                        }
                    }
                }
                WriteState::Writing {
                    data,
                    written,
                    consumed,
                } => {
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
                    let n = *consumed;
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
        let this = self.get_mut();
        // 若响应头尚未发出，关闭前补发
        loop {
            match &mut this.write_state {
                WriteState::Ready => {
                    if let Some(header) = this.pending_header.take() {
                        this.write_state = WriteState::Writing {
                            data: header,
                            written: 0,
                            consumed: 0,
                        };
                        continue;
                    }
                    return Pin::new(&mut this.inner).poll_shutdown(cx);
                }
                WriteState::Writing { data, written, .. } => {
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
                    this.write_state = WriteState::Ready;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ProxyStream;
    use crate::vmess::{COMMAND_TCP, OPTION_CHUNK_STREAM};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const KEY: [u8; 16] = [0x11; 16];
    const NONCE: [u8; 16] = [0x22; 16];

    fn codec_pair(security: SecurityType, option: u8) -> (ChunkCodec, ChunkCodec) {
        let enc = session_codec(security, COMMAND_TCP, option, &KEY, &NONCE)
            .unwrap()
            .unwrap();
        let dec = session_codec(security, COMMAND_TCP, option, &KEY, &NONCE)
            .unwrap()
            .unwrap();
        (enc, dec)
    }

    fn decode_one(codec: &mut ChunkCodec, wire: &[u8]) -> Vec<u8> {
        let field = codec.length_field_len();
        let (data_len, padding) = codec.decode_length(&wire[..field]).unwrap();
        assert_eq!(wire.len(), field + data_len + padding);
        codec.decode_data(&wire[field..field + data_len]).unwrap()
    }

    #[test]
    fn plain_chunk_round_trip() {
        let (mut enc, mut dec) = codec_pair(SecurityType::None, OPTION_CHUNK_STREAM);
        let wire = enc.encode_chunk(b"ping");
        assert_eq!(&wire[..2], &4u16.to_be_bytes());
        assert_eq!(decode_one(&mut dec, &wire), b"ping");
    }

    #[test]
    fn masked_chunk_round_trip() {
        let (mut enc, mut dec) = codec_pair(
            SecurityType::None,
            OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING,
        );
        for msg in [b"ping".as_slice(), b"pong", b"a longer chunk payload"] {
            let wire = enc.encode_chunk(msg);
            assert_eq!(decode_one(&mut dec, &wire), msg);
        }
    }

    #[test]
    fn masked_length_hides_size() {
        let (mut enc, _) = codec_pair(
            SecurityType::None,
            OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING,
        );
        let wire = enc.encode_chunk(b"ping");
        let mut mask = ShakeStream::new(&NONCE);
        let expected = 4u16 ^ mask.next_u16();
        assert_eq!(&wire[..2], &expected.to_be_bytes());
    }

    #[test]
    fn aead_chunk_round_trip() {
        for security in [SecurityType::Aes128Gcm, SecurityType::Chacha20Poly1305] {
            let (mut enc, mut dec) = codec_pair(
                security,
                OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING,
            );
            for msg in [b"first".as_slice(), b"second chunk", b""] {
                if msg.is_empty() {
                    continue;
                }
                let wire = enc.encode_chunk(msg);
                assert_eq!(decode_one(&mut dec, &wire), msg);
            }
        }
    }

    #[test]
    fn authenticated_length_layout() {
        let (mut enc, mut dec) = codec_pair(
            SecurityType::Aes128Gcm,
            OPTION_CHUNK_STREAM | OPTION_AUTHENTICATED_LENGTH,
        );
        let wire = enc.encode_chunk(b"ping");
        // 长度字段为 2 字节密文 + 16 字节 tag
        assert_eq!(enc.length_field_len(), 18);
        assert_eq!(wire.len(), 18 + 4 + CIPHER_OVERHEAD);
        assert_eq!(decode_one(&mut dec, &wire), b"ping");
    }

    #[test]
    fn authenticated_length_tamper_detected() {
        let (mut enc, _) = codec_pair(
            SecurityType::Aes128Gcm,
            OPTION_CHUNK_STREAM | OPTION_AUTHENTICATED_LENGTH,
        );
        let wire = enc.encode_chunk(b"ping");
        for bit in 0..(18 * 8) {
            let mut broken = wire.clone();
            broken[bit / 8] ^= 1 << (bit % 8);
            let (_, mut dec) = codec_pair(
                SecurityType::Aes128Gcm,
                OPTION_CHUNK_STREAM | OPTION_AUTHENTICATED_LENGTH,
            );
            assert!(
                matches!(
                    dec.decode_length(&broken[..18]),
                    Err(Error::AeadAuthFailed)
                ),
                "bit {} not detected",
                bit
            );
        }
        let (_, mut dec) = codec_pair(
            SecurityType::Aes128Gcm,
            OPTION_CHUNK_STREAM | OPTION_AUTHENTICATED_LENGTH,
        );
        assert_eq!(decode_one(&mut dec, &wire), b"ping");
    }

    #[test]
    fn global_padding_follows_shake_budget() {
        let (mut enc, mut dec) = codec_pair(
            SecurityType::Aes128Gcm,
            OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING | OPTION_GLOBAL_PADDING,
        );
        // 每块恰好抽取一个 padding 值：用并行参考流核对预算
        let mut budget = ShakeStream::new(&NONCE);
        for msg in [b"ping".as_slice(), b"pong", b"third chunk"] {
            let wire = enc.encode_chunk(msg);
            let expected_padding = budget.next_padding_len();
            assert_eq!(
                wire.len(),
                2 + msg.len() + CIPHER_OVERHEAD + expected_padding
            );
            assert_eq!(decode_one(&mut dec, &wire), msg);
        }
    }

    #[test]
    fn bad_length_chunk_fatal() {
        let (_, mut dec) = codec_pair(
            SecurityType::None,
            OPTION_CHUNK_STREAM | OPTION_GLOBAL_PADDING,
        );
        // padding 首抽值决定了首块最小合法长度；长度 0 必然非法
        let raw = 0u16.to_be_bytes();
        assert!(matches!(
            dec.decode_length(&raw),
            Err(Error::BadLengthChunk { .. })
        ));
    }

    #[test]
    fn zero_security_is_raw() {
        assert!(session_codec(SecurityType::Zero, COMMAND_TCP, 0, &KEY, &NONCE)
            .unwrap()
            .is_none());
        assert!(
            session_codec(SecurityType::Zero, COMMAND_UDP, OPTION_CHUNK_STREAM, &KEY, &NONCE)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn none_security_without_chunk_stream_is_raw() {
        assert!(session_codec(SecurityType::None, COMMAND_TCP, 0, &KEY, &NONCE)
            .unwrap()
            .is_none());
        // UDP 即使未设置 ChunkStream 也分块
        assert!(session_codec(SecurityType::None, COMMAND_UDP, 0, &KEY, &NONCE)
            .unwrap()
            .is_some());
    }

    #[test]
    fn legacy_security_rejected() {
        assert!(matches!(
            session_codec(SecurityType::Legacy, COMMAND_TCP, 0, &KEY, &NONCE),
            Err(Error::UnsupportedSecurityType(_))
        ));
    }

    fn framed_pair(security: SecurityType, option: u8) -> (VmessStream, VmessStream) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let a: ProxyStream = Box::new(a);
        let b: ProxyStream = Box::new(b);
        let left = VmessStream::framed(
            a,
            session_codec(security, COMMAND_TCP, option, &KEY, &NONCE).unwrap(),
            session_codec(security, COMMAND_TCP, option, &KEY, &NONCE).unwrap(),
        );
        let right = VmessStream::framed(
            b,
            session_codec(security, COMMAND_TCP, option, &KEY, &NONCE).unwrap(),
            session_codec(security, COMMAND_TCP, option, &KEY, &NONCE).unwrap(),
        );
        (left, right)
    }

    #[tokio::test]
    async fn stream_round_trip_all_variants() {
        let variants = [
            (SecurityType::None, OPTION_CHUNK_STREAM),
            (SecurityType::None, OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING),
            (SecurityType::Aes128Gcm, OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING),
            (
                SecurityType::Aes128Gcm,
                OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING | OPTION_GLOBAL_PADDING,
            ),
            (
                SecurityType::Aes128Gcm,
                OPTION_CHUNK_STREAM | OPTION_AUTHENTICATED_LENGTH,
            ),
            (
                SecurityType::Aes128Gcm,
                OPTION_CHUNK_STREAM | OPTION_AUTHENTICATED_LENGTH | OPTION_GLOBAL_PADDING,
            ),
            (
                SecurityType::Chacha20Poly1305,
                OPTION_CHUNK_STREAM | OPTION_AUTHENTICATED_LENGTH | OPTION_GLOBAL_PADDING,
            ),
        ];
        for (security, option) in variants {
            let (mut left, mut right) = framed_pair(security, option);
            let payload = b"hello vmess chunked stream";
            left.write_all(payload).await.unwrap();
            left.flush().await.unwrap();

            let mut got = vec![0u8; payload.len()];
            right.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, payload, "{:?} option {:#x}", security, option);
        }
    }

    #[tokio::test]
    async fn large_write_fragments_and_reassembles() {
        let (mut left, mut right) = framed_pair(
            SecurityType::Aes128Gcm,
            OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING,
        );
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            left.write_all(&payload).await.unwrap();
            left.flush().await.unwrap();
            left.shutdown().await.unwrap();
        });
        let mut got = Vec::new();
        right.read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn short_caller_buffers_supported() {
        let (mut left, mut right) = framed_pair(
            SecurityType::Aes128Gcm,
            OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING,
        );
        left.write_all(b"0123456789").await.unwrap();
        left.flush().await.unwrap();

        let mut got = Vec::new();
        let mut small = [0u8; 3];
        while got.len() < 10 {
            let n = right.read(&mut small).await.unwrap();
            got.extend_from_slice(&small[..n]);
        }
        assert_eq!(&got, b"0123456789");
    }

    #[tokio::test]
    async fn payload_tamper_tears_down_session() {
        let key = KEY;
        let nonce = NONCE;
        let (a, mut b) = tokio::io::duplex(1 << 16);

        let mut enc = session_codec(
            SecurityType::Aes128Gcm,
            COMMAND_TCP,
            OPTION_CHUNK_STREAM,
            &key,
            &nonce,
        )
        .unwrap()
        .unwrap();
        let mut wire = enc.encode_chunk(b"ping");
        // 翻转密文内部一个字节
        wire[2 + 1] ^= 0x01;
        b.write_all(&wire).await.unwrap();
        b.flush().await.unwrap();

        let a: ProxyStream = Box::new(a);
        let mut reader = VmessStream::framed(
            a,
            None,
            session_codec(
                SecurityType::Aes128Gcm,
                COMMAND_TCP,
                OPTION_CHUNK_STREAM,
                &key,
                &nonce,
            )
            .unwrap(),
        );
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn clean_eof_at_chunk_boundary() {
        let (mut left, mut right) = framed_pair(
            SecurityType::Aes128Gcm,
            OPTION_CHUNK_STREAM | OPTION_CHUNK_MASKING,
        );
        left.write_all(b"bye").await.unwrap();
        left.flush().await.unwrap();
        left.shutdown().await.unwrap();
        drop(left);

        let mut got = Vec::new();
        right.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got, b"bye");
    }
}
