//! MLLP帧编解码
//!
//! 帧格式: `<SB> 消息体 <EB><CR>`，SB=0x0B，EB=0x1C，CR=0x0D。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gateway_core::{GatewayError, Result};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

pub const START_BLOCK: u8 = 0x0B;
pub const END_BLOCK: u8 = 0x1C;
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// 默认最大帧长度 (16 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// 用MLLP起止字节包装消息体
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 3);
    out.push(START_BLOCK);
    out.extend_from_slice(body);
    out.push(END_BLOCK);
    out.push(CARRIAGE_RETURN);
    out
}

/// 去除单个完整帧的起止字节
pub fn unframe(framed: &[u8]) -> Option<&[u8]> {
    match framed {
        [START_BLOCK, body @ .., END_BLOCK, CARRIAGE_RETURN] => Some(body),
        _ => None,
    }
}

/// MLLP编解码器
#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_bytes: usize,
    // 下一次查找EB的起始偏移，避免重复扫描
    scan_offset: usize,
}

impl MllpCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            scan_offset: 0,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// 丢弃部分帧后重置扫描状态
    pub fn reset(&mut self) {
        self.scan_offset = 0;
    }
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for MllpCodec {
    type Item = Bytes;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // 丢弃SB之前的垃圾字节
        if src.first() != Some(&START_BLOCK) {
            match src.iter().position(|b| *b == START_BLOCK) {
                Some(start) => {
                    warn!("Discarding {} bytes before MLLP start block", start);
                    src.advance(start);
                    self.scan_offset = 0;
                }
                None => {
                    if !src.is_empty() {
                        warn!("Discarding {} bytes without MLLP start block", src.len());
                        src.clear();
                    }
                    self.scan_offset = 0;
                    return Ok(None);
                }
            }
        }

        let from = self.scan_offset.max(1).min(src.len());
        let found = src[from..]
            .windows(2)
            .position(|w| w[0] == END_BLOCK && w[1] == CARRIAGE_RETURN)
            .map(|i| i + from);

        match found {
            Some(end) => {
                self.scan_offset = 0;
                let mut framed = src.split_to(end + 2);
                framed.advance(1);
                framed.truncate(framed.len() - 2);
                debug!("Decoded MLLP frame of {} bytes", framed.len());
                Ok(Some(framed.freeze()))
            }
            None => {
                if src.len() > self.max_frame_bytes {
                    return Err(GatewayError::Framing(format!(
                        "MLLP frame exceeds {} bytes",
                        self.max_frame_bytes
                    )));
                }
                // 末尾的EB可能与下一次读取的CR组成结束符
                self.scan_offset = src.len().saturating_sub(1).max(1);
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    warn!(
                        "Connection closed with truncated MLLP frame ({} bytes), dropping",
                        src.len()
                    );
                    src.clear();
                }
                self.scan_offset = 0;
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for MllpCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let body = item.as_ref();
        dst.reserve(body.len() + 3);
        dst.put_u8(START_BLOCK);
        dst.put_slice(body);
        dst.put_u8(END_BLOCK);
        dst.put_u8(CARRIAGE_RETURN);
        Ok(())
    }
}
