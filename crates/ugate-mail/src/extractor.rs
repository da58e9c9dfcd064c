//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Mail command extraction and inbound mail decisions."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ugate_common::config::MailConfig;
use ugate_protocol::{CommandCode, NodeAddress, ProtocolError};

/// Commands found in a message plus feedback for the sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Known commands, deduplicated.
    pub valid: BTreeSet<CommandCode>,
    /// One `Invalid Command "<n>"` line per unknown integer token.
    pub rejections: Vec<String>,
}

impl CommandResult {
    /// True when at least one token was rejected.
    pub fn has_rejections(&self) -> bool {
        !self.rejections.is_empty()
    }

    /// Reply text sent back to the issuer, one rejection per line.
    pub fn reply_body(&self) -> String {
        self.rejections
            .iter()
            .map(|line| format!("{line}\n"))
            .collect()
    }
}

/// Node addresses named in a subject line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationResult {
    /// Parsed addresses.
    pub addresses: BTreeSet<NodeAddress>,
    /// One line per token that is not a node address.
    pub rejections: Vec<String>,
}

/// Splits subject and body text into validated command codes.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    delimiter: String,
}

impl Default for CommandExtractor {
    fn default() -> Self {
        Self::new(";")
    }
}

impl CommandExtractor {
    /// Extractor splitting on `delimiter`.
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }

    /// Extractor using the configured mail delimiter.
    pub fn from_config(config: &MailConfig) -> Self {
        Self::new(config.command_delimiter.clone())
    }

    /// Commands from the subject (reply prefixes removed) followed by the body.
    pub fn extract(&self, subject: &str, body: &str) -> CommandResult {
        let mut result = CommandResult::default();
        self.collect_commands(&strip_reply_prefixes(subject), &mut result);
        self.collect_commands(body, &mut result);
        result
    }

    /// Commands from the body only.
    pub fn extract_body(&self, body: &str) -> CommandResult {
        let mut result = CommandResult::default();
        self.collect_commands(body, &mut result);
        result
    }

    /// Node addresses listed in the subject after reply prefixes are removed.
    pub fn extract_destinations(&self, subject: &str) -> DestinationResult {
        let mut result = DestinationResult::default();
        let subject = strip_reply_prefixes(subject);
        for token in self.tokens(&subject) {
            match token.parse::<NodeAddress>() {
                Ok(address) => {
                    result.addresses.insert(address);
                }
                Err(_) => result
                    .rejections
                    .push(format!("Invalid Destination \"{token}\"")),
            }
        }
        result
    }

    fn collect_commands(&self, text: &str, result: &mut CommandResult) {
        for token in self.tokens(text) {
            let code = match token.parse::<i64>() {
                Ok(code) => code,
                Err(_) => {
                    warn!(token, "non-numeric command received");
                    continue;
                }
            };
            match CommandCode::lookup(code) {
                Some(command) => {
                    result.valid.insert(command);
                }
                None => result
                    .rejections
                    .push(ProtocolError::InvalidCommand(code).to_string()),
            }
        }
    }

    fn tokens<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        text.trim()
            .split(self.delimiter.as_str())
            .map(str::trim)
            .filter(|token| {
                if token.is_empty() {
                    debug!("skipping empty command token");
                }
                !token.is_empty()
            })
    }
}

/// Remove `Re:`/`Fwd:` style reply prefixes wherever they appear.
///
/// A prefix is an optional `[`, then `fw`, `fwd` or `re` in any case, then at
/// least one of `:`, `;` or `-` with surrounding whitespace, and an optional
/// closing `]`. Consecutive prefixes are removed together.
pub fn strip_reply_prefixes(subject: &str) -> String {
    let chars: Vec<char> = subject.chars().collect();
    let mut out = String::with_capacity(subject.len());
    let mut pos = 0;
    while pos < chars.len() {
        let mut end = pos;
        while let Some(next) = match_prefix(&chars, end) {
            end = next;
        }
        if end > pos {
            pos = end;
        } else {
            out.push(chars[pos]);
            pos += 1;
        }
    }
    out
}

fn match_prefix(chars: &[char], start: usize) -> Option<usize> {
    let at = |i: usize| chars.get(i).map(|c| c.to_ascii_lowercase());
    let mut i = start;
    if at(i) == Some('[') {
        i += 1;
    }
    match (at(i), at(i + 1)) {
        (Some('f'), Some('w')) => {
            i += 2;
            if at(i) == Some('d') {
                i += 1;
            }
        }
        (Some('r'), Some('e')) => i += 2,
        _ => return None,
    }
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    let separators = i;
    while matches!(chars.get(i).copied(), Some(':' | ';' | '-')) {
        i += 1;
    }
    if i == separators {
        return None;
    }
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    if chars.get(i).copied() == Some(']') {
        i += 1;
    }
    Some(i)
}
