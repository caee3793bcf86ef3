//! Decoder for `Transfer-Encoding: chunked` request bodies.

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::CodecError;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Output of one decoding step.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    Data(Bytes),
    /// The zero-length chunk and the trailer section were consumed.
    End,
}

/// Incremental chunked-body decoder. Extensions and trailers are skipped.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decodes the next event from `buf`, or returns `None` when more input is
    /// needed. Consumed bytes are removed from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ChunkEvent>, CodecError> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    let digits = line[..]
                        .split(|b| *b == b';')
                        .next()
                        .unwrap_or_default()
                        .trim_ascii();
                    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
                        return Err(CodecError::InvalidChunk("chunk size is not hexadecimal"));
                    }
                    let size = std::str::from_utf8(digits)
                        .ok()
                        .and_then(|s| u64::from_str_radix(s, 16).ok())
                        .ok_or(CodecError::InvalidChunk("chunk size overflows"))?;
                    self.state = if size == 0 { State::Trailers } else { State::Data(size) };
                }
                State::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(buf.len() as u64);
                    let chunk = buf.split_to(take as usize).freeze();
                    let left = remaining - take;
                    self.state = if left == 0 { State::DataEnd } else { State::Data(left) };
                    return Ok(Some(ChunkEvent::Data(chunk)));
                }
                State::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(CodecError::InvalidChunk("chunk data not followed by CRLF"));
                    }
                    buf.advance(2);
                    self.state = State::Size;
                }
                State::Trailers => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                        return Ok(Some(ChunkEvent::End));
                    }
                    tracing::trace!(trailer_len = line.len(), "Skipping chunked trailer");
                }
                State::Done => return Ok(None),
            }
        }
    }
}

/// Splits one CRLF-terminated line off `buf`, without the terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
    let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
        if buf.len() > MAX_LINE {
            return Err(CodecError::InvalidChunk("line too long"));
        }
        return Ok(None);
    };
    if pos == 0 || buf[pos - 1] != b'\r' {
        return Err(CodecError::InvalidChunk("line not terminated by CRLF"));
    }
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos - 1);
    Ok(Some(line))
}
