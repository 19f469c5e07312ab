use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, warn};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::protocol::command::Command;
use crate::protocol::reply::Reply;

/// Longest accepted frame, excluding the terminator.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024;

const TERMINATOR: &[u8] = b"\r\n";

/// Newline delimited JSON codec of the device control socket.
///
/// Decoding yields one item per frame. A frame that can not be parsed is
/// returned as `Err(ProtocolError)` in place of its reply and decoding
/// continues with the next frame, so the `io::Error` of the decoder is only
/// ever raised by the underlying transport.
#[derive(Debug, Default)]
pub struct YeelightCodec {
    /// Bytes of the buffer already searched for a newline.
    next_index: usize,
    /// Set while skipping the rest of an oversized frame.
    discarding: bool,
}

impl YeelightCodec {
    pub fn new() -> Self {
        YeelightCodec::default()
    }

    fn find_newline(&self, buf: &BytesMut) -> Option<usize> {
        buf[self.next_index..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.next_index + offset)
    }
}

impl Decoder for YeelightCodec {
    type Item = Result<Reply, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        loop {
            match (self.discarding, self.find_newline(buf)) {
                (true, Some(end)) => {
                    buf.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    let line = buf.split_to(end + 1);
                    self.next_index = 0;
                    if end > MAX_FRAME_LENGTH {
                        warn!("dropping frame of {} bytes", end);
                        return Ok(Some(Err(ProtocolError::FrameTooLong(MAX_FRAME_LENGTH))));
                    }
                    if let Some(frame) = decode_line(&line[..end]) {
                        return Ok(Some(frame));
                    }
                }
                (false, None) => {
                    if buf.len() > MAX_FRAME_LENGTH {
                        warn!(
                            "frame exceeds {} bytes, skipping to the next newline",
                            MAX_FRAME_LENGTH
                        );
                        buf.clear();
                        self.next_index = 0;
                        self.discarding = true;
                        return Ok(Some(Err(ProtocolError::FrameTooLong(MAX_FRAME_LENGTH))));
                    }
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        // An unterminated last frame is still decoded.
        let rest = buf.split();
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            return Ok(None);
        }
        Ok(decode_line(&rest))
    }
}

impl<'a> Encoder<&'a Command> for YeelightCodec {
    type Error = io::Error;

    fn encode(&mut self, command: &'a Command, buf: &mut BytesMut) -> io::Result<()> {
        let frame = serde_json::to_vec(&command.to_json())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        debug!("sending {}", String::from_utf8_lossy(&frame));
        buf.reserve(frame.len() + TERMINATOR.len());
        buf.put_slice(&frame);
        buf.put_slice(TERMINATOR);
        Ok(())
    }
}

/// Encodes a single command frame, terminator included.
pub fn encode_command(command: &Command) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    YeelightCodec::new().encode(command, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes a frame without its newline. Blank lines yield `None`.
fn decode_line(line: &[u8]) -> Option<Result<Reply, ProtocolError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    debug!("received {}", String::from_utf8_lossy(line));
    let result = serde_json::from_slice(line)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
        .and_then(Reply::from_value);
    Some(result)
}
