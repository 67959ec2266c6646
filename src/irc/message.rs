/// IRC message parsing and serialization.
///
/// Wire format (RFC 2812):
///   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// Parsing and serialization work on the line content; the codec owns the
/// line terminator.
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional source (server name, `nick`, or a feed name for relayed posts).
    pub prefix: Option<String>,
    /// The command as sent (e.g. `PRIVMSG`, `001`, `nick`).
    pub command: String,
    /// Parameters. The last one may have been a trailing param with spaces.
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    /// Build a message from a source, a command and its parameters.
    pub fn new<P, I, S>(prefix: Option<P>, command: &str, params: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: prefix.map(Into::into),
            command: command.to_owned(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a single IRC message from a line (terminator already removed).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches(['\r', '\n']);

        if input.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = match input.strip_prefix(':') {
            Some(tail) => match tail.split_once(' ') {
                Some((prefix, rest)) => (Some(prefix.to_owned()), rest.trim_start_matches(' ')),
                None => return Err(ParseError::MissingCommand),
            },
            None => (None, input),
        };

        let (command, mut remaining) = match rest.split_once(' ') {
            Some((command, params)) => (command, params),
            None => (rest, ""),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        loop {
            remaining = remaining.trim_start_matches(' ');
            if remaining.is_empty() {
                break;
            }
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match remaining.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_owned());
                    remaining = tail;
                }
                None => {
                    params.push(remaining.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// The command, upper-cased for dispatch. Clients may send `nick` or `Nick`.
    pub fn verb(&self) -> String {
        self.command.to_ascii_uppercase()
    }

    /// The `n`th parameter, if present.
    pub fn param(&self, n: usize) -> Option<&str> {
        self.params.get(n).map(String::as_str)
    }

    /// Serialize to the IRC wire format (without the line terminator).
    ///
    /// The last parameter only gets a `:` when it needs one: when it is
    /// empty, contains a space, or itself starts with `:`.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push(' ');
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                out.push(':');
            }
            out.push_str(last);
        }

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
