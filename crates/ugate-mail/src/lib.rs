//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Mail command extraction and inbound mail decisions."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Text command channel. The mail session itself (IMAP idle, SMTP replies)
//! lives outside the gateway core; it hands each new message to [`Inbox`]
//! and carries out the returned [`MailDecision`].

pub mod extractor;
pub mod inbox;

pub use extractor::{strip_reply_prefixes, CommandExtractor, CommandResult, DestinationResult};
pub use inbox::{Destinations, IgnoreReason, InboundMail, Inbox, MailDecision};
