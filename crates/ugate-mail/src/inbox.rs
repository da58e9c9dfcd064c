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
use tracing::info;
use ugate_common::config::{MailConfig, SubjectRole};
use ugate_protocol::{CommandCode, NodeAddress, ProtocolError};
use ugate_security::PermissionGate;

use crate::extractor::CommandExtractor;

/// A new message as delivered by the mail session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMail {
    /// Message-ID header, used to name the execution task.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Sender addresses from the From header.
    pub from: Vec<String>,
    /// Subject line.
    #[serde(default)]
    pub subject: String,
    /// Plain text body.
    #[serde(default)]
    pub body: String,
}

/// Which nodes an accepted command set targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destinations {
    /// Every configured node.
    AllNodes,
    /// The nodes listed in the subject.
    Nodes(BTreeSet<NodeAddress>),
}

/// Why a message produced no action and no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No sender is on the allow-list.
    Unauthorized,
    /// The message named no commands.
    NoCommands,
}

/// What the mail session should do with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MailDecision {
    /// Run the commands against the destinations on a separate task.
    Execute {
        /// Validated commands.
        commands: BTreeSet<CommandCode>,
        /// Target nodes.
        destinations: Destinations,
    },
    /// Reply to the senders listing what was rejected; nothing is executed.
    Reply {
        /// Reply recipients.
        to: Vec<String>,
        /// Reply text.
        body: String,
    },
    /// Drop the message without replying.
    Ignore {
        /// Why the message was dropped.
        reason: IgnoreReason,
    },
}

/// Combines the sender allow-list with command extraction.
#[derive(Debug, Clone)]
pub struct Inbox {
    gate: PermissionGate,
    extractor: CommandExtractor,
    subject_role: SubjectRole,
}

impl Inbox {
    /// Assemble an inbox from its parts.
    pub fn new(gate: PermissionGate, extractor: CommandExtractor, subject_role: SubjectRole) -> Self {
        Self {
            gate,
            extractor,
            subject_role,
        }
    }

    /// Inbox configured from the `[mail]` section.
    pub fn from_config(config: &MailConfig) -> Self {
        Self::new(
            PermissionGate::new(config.allow_list.iter().cloned()),
            CommandExtractor::from_config(config),
            config.subject_role,
        )
    }

    /// Decide what to do with one inbound message.
    pub fn evaluate(&self, mail: &InboundMail) -> MailDecision {
        if !self.gate.is_authorized(mail.from.as_slice()) {
            info!(
                from = ?mail.from,
                error = %ProtocolError::Unauthorized,
                "ignoring mail from unauthorized sender"
            );
            return MailDecision::Ignore {
                reason: IgnoreReason::Unauthorized,
            };
        }

        let (commands, destinations) = match self.subject_role {
            SubjectRole::Commands => (
                self.extractor.extract(&mail.subject, &mail.body),
                Destinations::AllNodes,
            ),
            SubjectRole::Destinations => {
                let mut commands = self.extractor.extract_body(&mail.body);
                let targets = self.extractor.extract_destinations(&mail.subject);
                commands.rejections.extend(targets.rejections);
                let destinations = if targets.addresses.is_empty() {
                    Destinations::AllNodes
                } else {
                    Destinations::Nodes(targets.addresses)
                };
                (commands, destinations)
            }
        };

        if commands.has_rejections() {
            info!(from = ?mail.from, rejected = commands.rejections.len(), "invalid command(s) received");
            return MailDecision::Reply {
                to: mail.from.clone(),
                body: commands.reply_body(),
            };
        }
        if commands.valid.is_empty() {
            info!(from = ?mail.from, "mail carried no commands");
            return MailDecision::Ignore {
                reason: IgnoreReason::NoCommands,
            };
        }

        info!(from = ?mail.from, commands = ?commands.valid, "received mail commands");
        MailDecision::Execute {
            commands: commands.valid,
            destinations,
        }
    }
}
