//! IRC message parsing and serialisation
//!
//! Classic line grammar: an optional `:<source>` prefix, a command token, then
//! space separated parameters where the last one may start with `:` and carry
//! embedded spaces.

use std::fmt;

/// Default cap on the number of parameters in one line
pub const DEFAULT_MAX_PARAMS: usize = 15;

/// A single protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Source prefix without the leading colon
    pub source: Option<String>,
    /// Command token, as received
    pub command: String,
    /// Parameters, trailing parameter last
    pub params: Vec<String>,
}

impl Message {
    /// Create a new message without a source
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            source: None,
            command: command.to_string(),
            params,
        }
    }

    /// Create a new message with a source prefix
    pub fn with_source(source: &str, command: &str, params: Vec<String>) -> Self {
        Self {
            source: Some(source.to_string()),
            command: command.to_string(),
            params,
        }
    }

    /// Parse a line using the default parameter cap
    pub fn parse(input: &str) -> crate::Result<Self> {
        Self::parse_with_limit(input, DEFAULT_MAX_PARAMS)
    }

    /// Parse a line, folding everything past `max_params - 1` middle
    /// parameters into the final one
    pub fn parse_with_limit(input: &str, max_params: usize) -> crate::Result<Self> {
        let mut rest = input.trim_end_matches(['\r', '\n']).trim_start_matches(' ');
        if rest.is_empty() {
            return Err(crate::Error::MessageParse("Empty message".to_string()));
        }

        let source = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, remainder) = stripped.split_once(' ').unwrap_or((stripped, ""));
            if prefix.is_empty() {
                return Err(crate::Error::MessageParse("Empty source prefix".to_string()));
            }
            rest = remainder.trim_start_matches(' ');
            Some(prefix.to_string())
        } else {
            None
        };

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(crate::Error::MessageParse("No command found".to_string()));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }

            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }

            if params.len() + 1 >= max_params {
                params.push(rest.to_string());
                break;
            }

            let (param, remainder) = rest.split_once(' ').unwrap_or((rest, ""));
            params.push(param.to_string());
            rest = remainder;
        }

        Ok(Message {
            source,
            command: command.to_string(),
            params,
        })
    }

    /// Serialise to a CRLF terminated line
    pub fn to_line(&self) -> String {
        let mut line = self.to_string();
        line.push_str("\r\n");
        line
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, ":{} ", source)?;
        }

        write!(f, "{}", self.command)?;

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }

        Ok(())
    }
}
