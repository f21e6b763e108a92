//! 长度前缀帧协议
//! Length-prefixed framing over a byte stream
//!
//! 帧格式: 10字节ASCII十进制长度 (左对齐, 空格填充) + 负载

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::trace;

use super::message::Message;
use crate::error::{ChannelError, FramingError};

/// 长度头字节数
pub const HEADER_SIZE: usize = 10;

/// 默认单条消息上限
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// 给负载加上长度头
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let header = format!("{:<width$}", payload.len(), width = HEADER_SIZE);
    if header.len() != HEADER_SIZE {
        return Err(FramingError::TooLarge {
            len: payload.len(),
            max: 10usize.pow(HEADER_SIZE as u32) - 1,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// 解析长度头
pub fn parse_header(header: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| FramingError::InvalidHeader(String::from_utf8_lossy(header).into_owned()))?;
    let digits = text.trim_end_matches(' ');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FramingError::InvalidHeader(text.to_string()));
    }
    digits
        .parse::<usize>()
        .map_err(|_| FramingError::InvalidHeader(text.to_string()))
}

/// 增量帧解码器
///
/// 接收任意大小的数据块; 多出的字节 (下一条消息) 保留到下次
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    expected: Option<usize>,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            expected: None,
            max_message_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// 已缓存的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 尝试取出一条完整负载
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let len = match self.expected {
            Some(len) => len,
            None => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let len = parse_header(&self.buffer[..HEADER_SIZE])?;
                if len > self.max_message_size {
                    return Err(FramingError::TooLarge {
                        len,
                        max: self.max_message_size,
                    });
                }
                self.expected = Some(len);
                len
            }
        };

        if self.buffer.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        let rest = self.buffer.split_off(HEADER_SIZE + len);
        let mut frame = std::mem::replace(&mut self.buffer, rest);
        frame.drain(..HEADER_SIZE);
        self.expected = None;
        Ok(Some(frame))
    }

    /// 流在此处结束时的错误类型
    fn eof_error(&self) -> ChannelError {
        if self.buffer.is_empty() {
            ChannelError::Disconnected
        } else {
            ChannelError::Framing(FramingError::Truncated {
                expected: HEADER_SIZE + self.expected.unwrap_or(0),
                received: self.buffer.len(),
            })
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// 消息通道: 在任意字节流上收发 [`Message`]
pub struct Channel<S> {
    stream: S,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<S: Read + Write> Channel<S> {
    pub fn new(stream: S) -> Self {
        Self::with_limits(stream, DEFAULT_MAX_MESSAGE_SIZE, READ_CHUNK)
    }

    pub fn with_limits(stream: S, max_message_size: usize, chunk_size: usize) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(max_message_size),
            chunk: vec![0; chunk_size.max(1)],
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// 已收到但还不构成完整消息的字节数
    pub fn pending(&self) -> usize {
        self.decoder.buffered()
    }

    /// 发送原始负载: 长度头与负载一次写出, 要么全部写完要么返回错误
    pub fn send_bytes(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let frame = encode_frame(payload)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        trace!("→ 发送 {} 字节", payload.len());
        Ok(())
    }

    /// 接收一条完整负载 (阻塞直到完整或出错)
    ///
    /// 出错时已收到的部分保留在解码器中, 下次调用继续
    pub fn recv_bytes(&mut self) -> Result<Vec<u8>, ChannelError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                trace!("← 接收 {} 字节", frame.len());
                return Ok(frame);
            }

            let n = match self.stream.read(&mut self.chunk) {
                Ok(0) => return Err(self.decoder.eof_error()),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Err(ChannelError::Timeout)
                }
                Err(e) => return Err(e.into()),
            };
            self.decoder.push(&self.chunk[..n]);
        }
    }

    pub fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        let payload = message.encode()?;
        self.send_bytes(&payload)
    }

    pub fn recv(&mut self) -> Result<Message, ChannelError> {
        let payload = self.recv_bytes()?;
        Ok(Message::decode(&payload)?)
    }
}

impl Channel<TcpStream> {
    /// 为TCP连接设置读超时 (None 表示一直阻塞)
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn peer(&self) -> String {
        self.stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}
