/// IRC line codec: frames a byte stream into IRC messages.
///
/// Lines end in `\n`; a preceding `\r` is dropped, so both RFC 2812 `\r\n`
/// and the bare `\n` some clients send are accepted. Outgoing messages are
/// always terminated with `\r\n`.
///
/// Oversized lines are logged and discarded instead of failing the
/// connection. Blank lines are skipped.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::message::{Message, ParseError};

/// Maximum line length (excluding the terminator).
/// RFC 2812 says 512 bytes. IRCv3 `message-tags` can push this to 8191.
pub const MAX_LINE_LENGTH: usize = 8191;

/// Codec error: a protocol parse failure, an I/O error, or an outgoing
/// message that would not fit on one line.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("refusing to send a line containing CR, LF or NUL")]
    LineBreak,
}

/// A tokio codec that frames IRC messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec {
    /// True while discarding the tail of an oversized line.
    skipping: bool,
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    warn!(bytes = src.len(), "codec: discarding oversized partial line");
                    src.clear();
                    self.skipping = true;
                }
                return Ok(None);
            };

            let mut line = src.split_to(pos);
            src.advance(1);

            if std::mem::take(&mut self.skipping) {
                warn!(bytes = pos + 1, "codec: finished skipping oversized line tail");
                continue;
            }
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.len() > MAX_LINE_LENGTH {
                warn!(bytes = line.len(), "codec: skipped oversized IRC line");
                continue;
            }

            let text = std::str::from_utf8(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            if text.trim().is_empty() {
                continue;
            }

            return Ok(Some(Message::parse(text)?));
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        if wire.contains(['\r', '\n', '\0']) {
            return Err(CodecError::LineBreak);
        }
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
