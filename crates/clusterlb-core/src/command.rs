//! Decoded control commands.
//!
//! Wire framing is handled by the listener; this module only turns the
//! command name, request target and a `Key=Value&Key=Value` body into a
//! [`Command`]. Values are percent-decoded and then screened for symbols
//! that could be injected into rendered status pages.

use std::fmt;
use std::str::FromStr;

use crate::error::{McmpError, McmpResult};

/// Message used for every decoding failure.
pub const PARSE_ERROR: &str =
    "Can't parse MCMP message. It might have contained illegal symbols or unknown elements.";

/// Control command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Config,
    EnableApp,
    DisableApp,
    StopApp,
    RemoveApp,
    Status,
    Ping,
    Dump,
    Info,
    Version,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Config => "CONFIG",
            CommandKind::EnableApp => "ENABLE-APP",
            CommandKind::DisableApp => "DISABLE-APP",
            CommandKind::StopApp => "STOP-APP",
            CommandKind::RemoveApp => "REMOVE-APP",
            CommandKind::Status => "STATUS",
            CommandKind::Ping => "PING",
            CommandKind::Dump => "DUMP",
            CommandKind::Info => "INFO",
            CommandKind::Version => "VERSION",
        }
    }

    /// Whether this is one of the four application lifecycle commands.
    pub fn is_app(&self) -> bool {
        matches!(
            self,
            CommandKind::EnableApp
                | CommandKind::DisableApp
                | CommandKind::StopApp
                | CommandKind::RemoveApp
        )
    }

    /// Whether handling this command may change the tables.
    pub fn is_mutating(&self) -> bool {
        self.is_app() || matches!(self, CommandKind::Config | CommandKind::Status)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = McmpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_uppercase().as_str() {
            "CONFIG" => CommandKind::Config,
            "ENABLE-APP" => CommandKind::EnableApp,
            "DISABLE-APP" => CommandKind::DisableApp,
            "STOP-APP" => CommandKind::StopApp,
            "REMOVE-APP" => CommandKind::RemoveApp,
            "STATUS" => CommandKind::Status,
            "PING" => CommandKind::Ping,
            "DUMP" => CommandKind::Dump,
            "INFO" => CommandKind::Info,
            "VERSION" => CommandKind::Version,
            other => {
                return Err(McmpError::syntax(format!("Invalid command \"{other}\"")));
            }
        };
        Ok(kind)
    }
}

/// A control command: a name plus an order-preserving list of decoded
/// key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    /// Request target was `/*` (or `*`): the command applies to every
    /// context of the node.
    pub wildcard: bool,
    params: Vec<(String, String)>,
}

impl Command {
    /// An empty command, mostly useful with [`Command::with`] in tests
    /// and internal callers.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            wildcard: false,
            params: Vec::new(),
        }
    }

    /// Decode a command from its request target and body.
    pub fn parse(kind: CommandKind, target: &str, body: &str) -> McmpResult<Self> {
        let target = target.trim();
        let wildcard = target == "*" || target.ends_with("/*");
        let mut params = Vec::new();
        for segment in body.trim_end_matches(['\r', '\n']).split('&') {
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| McmpError::syntax(PARSE_ERROR))?;
            if key.is_empty() {
                return Err(McmpError::syntax(PARSE_ERROR));
            }
            params.push((decode_value(key)?, decode_value(value)?));
        }
        Ok(Self {
            kind,
            wildcard,
            params,
        })
    }

    /// Append a key/value pair.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    /// Mark the command as addressed to every context.
    pub fn all_contexts(mut self) -> Self {
        self.wildcard = true;
        self
    }

    /// First value under `key` (case-insensitive).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All pairs in arrival order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Whether the command targets all contexts, either through the
    /// request target or through `Context=/*`.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard || self.get("Context") == Some("/*")
    }
}

/// Percent-decode a value (`%XX`, `+` as space) and reject characters
/// that must never reach a rendered page.
pub fn decode_value(raw: &str) -> McmpResult<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| hex_digit(*b));
                let lo = bytes.get(i + 2).and_then(|b| hex_digit(*b));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                    _ => return Err(McmpError::syntax(PARSE_ERROR)),
                }
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    let decoded = String::from_utf8(out).map_err(|_| McmpError::syntax(PARSE_ERROR))?;
    if decoded
        .chars()
        .any(|c| matches!(c, '<' | '>' | '"' | '\'' | '\r' | '\n'))
    {
        return Err(McmpError::syntax(PARSE_ERROR));
    }
    Ok(decoded)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
