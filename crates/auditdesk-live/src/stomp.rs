//! STOMP 1.2 frame codec.
//!
//! One WebSocket text message may carry several NUL-terminated frames; bare
//! end-of-line sequences between frames are heart-beats.

use std::fmt;
use std::str::FromStr;

use crate::error::{LiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = LiveError;

    fn from_str(value: &str) -> Result<Self> {
        let command = match value {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(LiveError::Protocol(format!("unknown STOMP command: {other}"))),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value wins when a header repeats.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str, bearer: &str) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", "0,0")
            .header("Authorization", format!("Bearer {bearer}"))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn send_json(destination: &str, body: &serde_json::Value) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body.to_string())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            push_header(&mut out, name, value, escape);
        }
        if !self.body.is_empty() {
            push_header(&mut out, "content-length", &self.body.len().to_string(), false);
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

fn push_header(out: &mut String, name: &str, value: &str, escape: bool) {
    if escape {
        out.push_str(&escape_header(name));
        out.push(':');
        out.push_str(&escape_header(value));
    } else {
        out.push_str(name);
        out.push(':');
        out.push_str(value);
    }
    out.push('\n');
}

fn escape_header(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            ':' => escaped.push_str("\\c"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(LiveError::Protocol(format!(
                    "invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

/// Decodes every frame in `input`. Heart-beats yield no frames.
pub fn decode_all(input: &str) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remainder) = decode_one(rest)?;
        frames.push(frame);
        rest = remainder;
    }
}

fn decode_one(input: &str) -> Result<(Frame, &str)> {
    let (head, after_head) = split_head(input)?;
    let mut lines = head.lines();
    let command_line = lines
        .next()
        .map(|line| line.trim_end_matches('\r'))
        .ok_or_else(|| LiveError::Protocol("frame without command".to_string()))?;
    let command: Command = command_line.parse()?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            return Err(LiveError::Protocol(format!("malformed header line: {line}")));
        };
        let (name, value) = if escape {
            (unescape_header(name)?, unescape_header(value)?)
        } else {
            (name.to_string(), value.to_string())
        };
        headers.push((name, value));
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok());

    let (body, remainder) = match content_length {
        Some(length) => {
            let body = after_head.get(..length).ok_or_else(|| {
                LiveError::Protocol(format!("frame body shorter than content-length {length}"))
            })?;
            let tail = &after_head[length..];
            let remainder = tail.strip_prefix('\0').ok_or_else(|| {
                LiveError::Protocol("frame body not NUL-terminated".to_string())
            })?;
            (body, remainder)
        }
        None => {
            let end = after_head.find('\0').ok_or_else(|| {
                LiveError::Protocol("frame body not NUL-terminated".to_string())
            })?;
            (&after_head[..end], &after_head[end + 1..])
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        remainder,
    ))
}

/// Splits at the blank line ending the header block.
fn split_head(input: &str) -> Result<(&str, &str)> {
    if let Some(index) = input.find("\n\n") {
        return Ok((&input[..index], &input[index + 2..]));
    }
    if let Some(index) = input.find("\r\n\r\n") {
        return Ok((&input[..index], &input[index + 4..]));
    }
    Err(LiveError::Protocol("frame header block not terminated".to_string()))
}
