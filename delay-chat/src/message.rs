use std::fmt;

use bytes::Bytes;

use crate::error::ParseError;

/// Line terminator appended to every encoded message.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Key/value payload of a protocol line.
///
/// Keys are stored upper-cased and compared case-insensitively. Encoding walks
/// the pairs in the order they were supplied, so replies are deterministic.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    pairs: Vec<(String, String)>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Adds a pair, rejecting a key that is already present.
    pub fn insert(&mut self, key: &str, value: String) -> Result<(), ParseError> {
        let key = key.to_ascii_uppercase();
        if self.contains(&key) {
            return Err(ParseError::KeyCollision(key));
        }
        self.pairs.push((key, value));
        Ok(())
    }

    /// Adds a pair, overwriting the value of an existing key in place.
    pub fn set(&mut self, key: &str, value: String) {
        let key = key.to_ascii_uppercase();
        match self.pairs.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

// Argument order carries no meaning, only the key/value association does.
impl PartialEq for Arguments {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(key, value)| other.get(key) == Some(value))
    }
}

impl Eq for Arguments {}

/// A single protocol line: a command token plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: String,
    args: Arguments,
}

impl Message {
    pub fn new(command: impl AsRef<str>) -> Self {
        Self {
            command: command.as_ref().to_ascii_uppercase(),
            args: Arguments::new(),
        }
    }

    /// Builder-style argument setter used when composing outbound lines.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.args.set(key, value.into());
        self
    }

    pub fn with_opt(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key)
    }

    /// Parses one line into a message.
    ///
    /// The line may still carry its CRLF (or bare LF) terminator. A line
    /// without a command token, such as an empty line or one holding only
    /// arguments, yields `Ok(None)` so callers can skip it silently.
    pub fn decode(line: &[u8]) -> Result<Option<Self>, ParseError> {
        let line = strip_terminator(line);
        let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidUtf8)?;

        let mut command: Option<&str> = None;
        let mut args = Arguments::new();

        for field in line.split('\t') {
            match field.split_once('=') {
                Some((key, value)) => {
                    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphabetic()) {
                        return Err(ParseError::InvalidKeyword(key.to_string()));
                    }
                    args.insert(key, unescape(value)?)?;
                }
                None if field.is_empty() => {}
                None if command.is_some() => return Err(ParseError::MultipleCommands),
                None => command = Some(field),
            }
        }

        Ok(command.map(|command| Self {
            command: command.to_ascii_uppercase(),
            args,
        }))
    }

    /// Serializes the message to wire form, terminator included.
    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(self.command.len() + 2 + self.args.len() * 16);
        out.push_str(&self.command);
        for (key, value) in self.args.iter() {
            out.push('\t');
            out.push_str(key);
            out.push('=');
            escape_into(value, &mut out);
        }
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(TERMINATOR);
        Bytes::from(bytes)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for (key, value) in self.args.iter() {
            write!(f, " {key}={value:?}")?;
        }
        Ok(())
    }
}

/// Best-effort extraction of a `LABEL` from a line that failed to decode.
///
/// Only a label that needs no unescaping is trusted.
pub fn recover_label(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(strip_terminator(line));
    line.split('\t')
        .filter_map(|field| field.split_once('='))
        .find(|(key, value)| key.eq_ignore_ascii_case("LABEL") && !value.contains('\\'))
        .map(|(_, value)| value.to_string())
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn unescape(value: &str) -> Result<String, ParseError> {
    if !value.contains('\\') {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => return Err(ParseError::UnknownEscape(format!("\\{other}"))),
            None => return Err(ParseError::UnknownEscape("\\".to_string())),
        }
    }
    Ok(out)
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
}
