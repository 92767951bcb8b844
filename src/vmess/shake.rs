use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Shake128, Shake128Reader};

/// 以会话 nonce 播种的 SHAKE128 流，按需产出 big-endian u16。
/// 两端按相同顺序抽取；流不可回退、不可重启。
pub struct ShakeStream {
    reader: Shake128Reader,
}

impl ShakeStream {
    pub fn new(seed: &[u8]) -> Self {
        let mut hasher = Shake128::default();
        hasher.update(seed);
        Self {
            reader: hasher.finalize_xof(),
        }
    }

    pub fn next_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.reader.read(&mut buf);
        u16::from_be_bytes(buf)
    }

    /// 下一个 padding 长度，固定对 64 取模
    pub fn next_padding_len(&mut self) -> usize {
        (self.next_u16() % 64) as usize
    }
}
