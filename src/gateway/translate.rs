/// Turns streaming events into the chat lines a channel shows.
use crate::irc::message::Message;
use crate::mastodon::{html, Status, StreamEvent};

use super::channel::Channel;

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("could not render post body: {0}")]
    Render(#[from] html2text::Error),
}

/// Lines for one event, rendering post bodies with html2text.
pub fn translate(event: &StreamEvent, channel: &Channel) -> Result<Vec<Message>, TranslateError> {
    translate_with(event, channel, |body| html::textify(body).map_err(TranslateError::from))
}

/// Lines for one event, rendering post bodies with `render`.
///
/// Only `update` events produce output. The content warning, if any, comes
/// first as `CW: ...`. The body follows one line per text line, trailing
/// whitespace stripped, and stops at the first blank line.
pub fn translate_with<F, E>(
    event: &StreamEvent,
    channel: &Channel,
    render: F,
) -> Result<Vec<Message>, E>
where
    F: FnOnce(&str) -> Result<String, E>,
{
    let StreamEvent::Update(status) = event else {
        return Ok(Vec::new());
    };

    let text = render(&status.content)?;

    let mut lines = Vec::new();
    if let Some(warning) = status.content_warning() {
        lines.push(chat_line(channel, status, &format!("CW: {warning}")));
    }
    for line in text.lines() {
        let line = line.trim_end_matches(|c: char| c.is_whitespace() || c == '\0');
        if line.is_empty() {
            break;
        }
        lines.push(chat_line(channel, status, line));
    }
    Ok(lines)
}

/// `:<feed> PRIVMSG <channel> :<author>: <text>`
///
/// Author and text come from remote posts; line breaks and NULs in either
/// become spaces so the message stays on one IRC line.
fn chat_line(channel: &Channel, status: &Status, text: &str) -> Message {
    let text = format!("{}: {text}", status.account.display());
    Message::new(
        Some(channel.feed.as_str()),
        "PRIVMSG",
        [channel.name.clone(), text.replace(['\r', '\n', '\0'], " ")],
    )
}
