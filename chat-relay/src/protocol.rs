//! Text vocabulary carried inside frames.
//!
//! [`Command`] is what clients send; [`ServerMessage`] is what the relay sends
//! back. Both are plain UTF-8 with a leading keyword, so a raw `nc`-style
//! client that speaks the length prefix can take part.

use std::fmt;

use crate::codec::MAX_FRAME_LEN;

pub const ALONE_MESSAGE: &str = "You are all alone in this server";
pub const FAREWELL_MESSAGE: &str = "Goodbye! You have been disconnected.";

/// Payload a client sends after `EXIT` to acknowledge the farewell.
pub const EXIT_ACK: &str = "ACK";

/// Longest username, in bytes, that `$register` accepts.
pub const MAX_USERNAME_LEN: usize = 32;

const CHAT_KEYWORD: &str = "CHAT ";
const LOG_KEYWORD: &str = "LOG ";

/// A client request, recognised by its first whitespace-delimited token.
///
/// Anything that is not one of the `$` keywords is chat text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { username: String },
    GetList,
    GetLog,
    Exit,
    Chat { text: String },
}

impl Command {
    pub fn parse(line: &str) -> Self {
        // `split_once` consumes exactly one separator, so `$chat  x` keeps the extra space.
        let (head, rest) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));

        match head {
            "$register" => Command::Register {
                username: rest.trim().to_string(),
            },
            "$getlist" => Command::GetList,
            "$getlog" => Command::GetLog,
            "$exit" => Command::Exit,
            "$chat" => Command::Chat {
                text: rest.to_string(),
            },
            _ => Command::Chat {
                text: line.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Admission or registration accepted.
    Success,
    /// The relay is at capacity; the connection is closed right after.
    Full,
    /// Registration refused, e.g. an empty username.
    Invalid,
    List(String),
    Log(String),
    /// A formatted `(<username>): <text>` line.
    Chat(String),
    Exit(String),
    Other(String),
}

impl ServerMessage {
    /// Formats a chat line, cutting `text` short so the whole payload fits in one frame.
    pub fn chat(username: &str, text: &str) -> Self {
        let prefix = format!("({username}): ");
        let budget = MAX_FRAME_LEN
            .saturating_sub(CHAT_KEYWORD.len())
            .saturating_sub(prefix.len());
        ServerMessage::Chat(prefix + truncate_to(text, budget))
    }

    /// Builds the `$getlog` reply. A log too large for one frame is sent as its newest entries.
    pub fn log(contents: &str) -> Self {
        let budget = MAX_FRAME_LEN - LOG_KEYWORD.len();
        ServerMessage::Log(tail_within(contents, budget).to_string())
    }

    /// Builds the `$getlist` reply from a registration-ordered roster.
    pub fn roster(usernames: &[String]) -> Self {
        if usernames.len() <= 1 {
            ServerMessage::List(ALONE_MESSAGE.to_string())
        } else {
            ServerMessage::List(usernames.join(","))
        }
    }

    pub fn farewell() -> Self {
        ServerMessage::Exit(FAREWELL_MESSAGE.to_string())
    }

    pub fn to_payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches(['\0', '\r', '\n']);

        match text {
            "SV_SUCCESS" => return ServerMessage::Success,
            "SV_FULL" => return ServerMessage::Full,
            "SV_INVALID" => return ServerMessage::Invalid,
            _ => {}
        }

        let Some((keyword, body)) = text.split_once(' ') else {
            return ServerMessage::Other(text.to_string());
        };
        let body = body.to_string();
        match keyword {
            "LIST" => ServerMessage::List(body),
            "LOG" => ServerMessage::Log(body),
            "CHAT" => ServerMessage::Chat(body),
            "EXIT" => ServerMessage::Exit(body),
            _ => ServerMessage::Other(text.to_string()),
        }
    }
}

fn truncate_to(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn tail_within(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    if text.as_bytes()[start - 1] == b'\n' {
        return &text[start..];
    }

    // Drop the partial entry at the front when a whole one follows it.
    let tail = &text[start..];
    match tail.find('\n') {
        Some(pos) if pos + 1 < tail.len() => &tail[pos + 1..],
        _ => tail,
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Success => f.write_str("SV_SUCCESS"),
            ServerMessage::Full => f.write_str("SV_FULL"),
            ServerMessage::Invalid => f.write_str("SV_INVALID"),
            ServerMessage::List(body) => write!(f, "LIST {body}"),
            ServerMessage::Log(body) => write!(f, "LOG {body}"),
            ServerMessage::Chat(body) => write!(f, "CHAT {body}"),
            ServerMessage::Exit(body) => write!(f, "EXIT {body}"),
            ServerMessage::Other(text) => f.write_str(text),
        }
    }
}
