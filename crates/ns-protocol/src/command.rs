use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("expected a JSON object")]
    NotAnObject,

    #[error("unterminated string starting at column {0}")]
    UnterminatedString(usize),

    #[error("expected ':' after key \"{0}\"")]
    MissingColon(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Embed,
    Generate,
    Health,
    Metrics,
    Capabilities,
    Unload,
    Unknown(String),
}

impl CommandKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "embed" => Self::Embed,
            "generate" => Self::Generate,
            "health" => Self::Health,
            "metrics" => Self::Metrics,
            "capabilities" => Self::Capabilities,
            "unload" => Self::Unload,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Embed => "embed",
            Self::Generate => "generate",
            Self::Health => "health",
            Self::Metrics => "metrics",
            Self::Capabilities => "capabilities",
            Self::Unload => "unload",
            Self::Unknown(name) => name,
        }
    }

    /// Inference commands count towards `requests_total`.
    pub fn is_counted(&self) -> bool {
        matches!(self, Self::Embed | Self::Generate)
    }
}

/// A parsed request line: the `cmd` discriminator plus every other field as a
/// string.
#[derive(Debug, Clone)]
pub struct Command {
    kind: CommandKind,
    fields: BTreeMap<String, String>,
}

impl Command {
    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Like [`Command::field`], but an empty value counts as absent.
    pub fn non_empty_field(&self, name: &str) -> Option<&str> {
        self.field(name).filter(|value| !value.is_empty())
    }
}

/// Parse one request line.
///
/// This is deliberately not a full JSON parser. Values are either strings
/// (only `\"` and `\\` are unescaped, any other backslash pair is kept as is)
/// or bare literals read up to the next `,` or `}`. A nested object or array
/// is therefore stored truncated at its first delimiter, and the scanner
/// resumes after its matching close bracket. When a key repeats, the first
/// value wins.
pub fn parse_line(line: &str) -> Result<Command, ProtocolError> {
    let chars: Vec<char> = line.trim().chars().collect();
    if chars.first() != Some(&'{') {
        return Err(ProtocolError::NotAnObject);
    }

    let mut scanner = Scanner { chars, pos: 1 };
    let mut fields = BTreeMap::new();

    loop {
        scanner.skip_separators();
        let Some(c) = scanner.peek() else {
            break;
        };

        if c == '}' {
            if scanner.rest_is_blank(scanner.pos + 1) {
                break;
            }
            scanner.pos += 1;
            continue;
        }

        if c != '"' {
            // Leftovers of a truncated structured value.
            if !scanner.seek('"') {
                break;
            }
        }

        let key = scanner.read_string()?;
        scanner.skip_whitespace();
        if scanner.peek() != Some(':') {
            return Err(ProtocolError::MissingColon(key));
        }
        scanner.pos += 1;
        scanner.skip_whitespace();

        let value = match scanner.peek() {
            Some('"') => scanner.read_string()?,
            Some('{' | '[') => {
                let start = scanner.pos;
                let value = scanner.read_bare();
                scanner.skip_structure(start);
                value
            }
            _ => scanner.read_bare(),
        };
        fields.entry(key).or_insert(value);
    }

    let kind = CommandKind::from_name(fields.get("cmd").map(String::as_str).unwrap_or(""));
    fields.remove("cmd");

    Ok(Command { kind, fields })
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

impl Scanner {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while self.peek().is_some_and(|c| c == ',' || c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn seek(&mut self, target: char) -> bool {
        while let Some(c) = self.peek() {
            if c == target {
                return true;
            }
            self.pos += 1;
        }
        false
    }

    fn rest_is_blank(&self, from: usize) -> bool {
        self.chars
            .get(from..)
            .map_or(true, |rest| rest.iter().all(|c| c.is_whitespace()))
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();

        loop {
            match self.peek() {
                None => return Err(ProtocolError::UnterminatedString(start)),
                Some('"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some('\\') => {
                    let Some(next) = self.chars.get(self.pos + 1).copied() else {
                        return Err(ProtocolError::UnterminatedString(start));
                    };
                    if next != '"' && next != '\\' {
                        out.push('\\');
                    }
                    out.push(next);
                    self.pos += 2;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// Move past the object or array opening at `start`, honouring strings.
    /// An unbalanced structure consumes the rest of the line.
    fn skip_structure(&mut self, start: usize) {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut i = start;

        while let Some(&c) = self.chars.get(i) {
            i += 1;
            if in_string {
                match c {
                    '\\' => i += 1,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' | '[' => depth += 1,
                '}' | ']' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
        self.pos = i.min(self.chars.len());
    }

    fn read_bare(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|c| c != ',' && c != '}') {
            self.pos += 1;
        }
        self.chars[start..self.pos]
            .iter()
            .collect::<String>()
            .trim()
            .to_string()
    }
}
