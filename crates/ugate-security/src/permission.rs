//! ---
//! ems_section: "06-security-access-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sender allow-list checks for remote command channels."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors raised when a sender fails the allow-list check.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermissionError {
    /// None of the senders are on the allow-list.
    #[error("none of [{0}] may issue commands")]
    Unauthorized(String),
}

/// Extract the bare mailbox from a sender such as `Owner <owner@example.com>`.
///
/// Only the display-name wrapper is removed; case is preserved so the
/// allow-list comparison stays exact.
pub fn mailbox_address(sender: &str) -> &str {
    let trimmed = sender.trim();
    match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(open), Some(close)) if open < close => trimmed[open + 1..close].trim(),
        _ => trimmed,
    }
}

/// True iff any sender's mailbox is present in `allow_list`.
///
/// An empty allow-list never authorizes anyone.
pub fn is_authorized<S: AsRef<str>>(senders: &[S], allow_list: &HashSet<String>) -> bool {
    if allow_list.is_empty() {
        return false;
    }
    senders
        .iter()
        .any(|sender| allow_list.contains(mailbox_address(sender.as_ref())))
}

/// Allow-list of sender identities permitted to issue commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGate {
    allow_list: HashSet<String>,
}

impl PermissionGate {
    /// Build a gate from the configured sender identities.
    pub fn new<I, S>(allow_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_list: allow_list.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether any of `senders` may issue commands.
    pub fn is_authorized<S: AsRef<str>>(&self, senders: &[S]) -> bool {
        let authorized = is_authorized(senders, &self.allow_list);
        debug!(senders = senders.len(), authorized, "evaluated command sender");
        authorized
    }

    /// Like [`PermissionGate::is_authorized`] but reports the rejected senders.
    pub fn authorize<S: AsRef<str>>(&self, senders: &[S]) -> Result<(), PermissionError> {
        if self.is_authorized(senders) {
            return Ok(());
        }
        Err(PermissionError::Unauthorized(
            senders
                .iter()
                .map(|sender| sender.as_ref().to_owned())
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    /// Number of configured identities.
    pub fn len(&self) -> usize {
        self.allow_list.len()
    }

    /// True when no identity is configured.
    pub fn is_empty(&self) -> bool {
        self.allow_list.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(entries: &[&str]) -> HashSet<String> {
        entries.iter().map(|entry| entry.to_string()).collect()
    }

    #[test]
    fn membership_decides_authorization() {
        assert!(is_authorized(&["a@x.com"], &allow(&["a@x.com", "b@x.com"])));
        assert!(!is_authorized(&["c@x.com"], &allow(&["a@x.com"])));
        assert!(is_authorized(&["c@x.com", "b@x.com"], &allow(&["a@x.com", "b@x.com"])));
    }

    #[test]
    fn empty_allow_list_rejects_everyone() {
        assert!(!is_authorized(&["a@x.com"], &HashSet::new()));
        assert!(!PermissionGate::default().is_authorized(&["a@x.com"]));
    }

    #[test]
    fn no_case_folding() {
        assert!(!is_authorized(&["A@x.com"], &allow(&["a@x.com"])));
    }

    #[test]
    fn display_names_are_stripped() {
        assert_eq!(mailbox_address("Owner <a@x.com>"), "a@x.com");
        assert_eq!(mailbox_address("  a@x.com "), "a@x.com");
        let gate = PermissionGate::new(["a@x.com"]);
        assert!(gate.is_authorized(&["Owner <a@x.com>"]));
    }

    #[test]
    fn authorize_lists_rejected_senders() {
        let gate = PermissionGate::new(["a@x.com"]);
        assert_eq!(gate.authorize(&["a@x.com"]), Ok(()));
        assert_eq!(
            gate.authorize(&["c@x.com", "d@x.com"]),
            Err(PermissionError::Unauthorized("c@x.com, d@x.com".into()))
        );
        assert_eq!(gate.len(), 1);
    }
}
