/// Server-Sent Events framing for the Mastodon streaming API.
///
/// The stream is a sequence of `field: value` lines. An event is dispatched
/// on a blank line. Lines starting with `:` are comments; Mastodon sends
/// `:thump` as a heartbeat.
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Longest single SSE line accepted. Status payloads are well below this.
const MAX_LINE_LENGTH: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, `message` when absent.
    pub event: String,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SseError {
    #[error("SSE line exceeds {MAX_LINE_LENGTH} bytes")]
    LineTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decoder that turns a byte stream into [`SseEvent`]s.
#[derive(Debug, Default)]
pub struct SseCodec {
    event: Option<String>,
    data: Vec<String>,
}

impl SseCodec {
    fn field(&mut self, line: &str) {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            // `id` and `retry` matter for reconnection only.
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".into()),
            data,
        })
    }
}

impl Decoder for SseCodec {
    type Item = SseEvent;
    type Error = SseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(SseError::LineTooLong);
                }
                return Ok(None);
            };

            let mut line = src.split_to(pos);
            src.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            let line = std::str::from_utf8(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    return Ok(Some(event));
                }
            } else if !line.starts_with(':') {
                self.field(line);
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        // A partial event at end of stream is dropped.
        src.clear();
        self.event = None;
        self.data.clear();
        Ok(None)
    }
}
