//! ---
//! ems_section: "06-security-access-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sender allow-list checks for remote command channels."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Access control for channels that accept commands from outside the
//! gateway, currently the mail inbox.

pub mod permission;

pub use permission::{is_authorized, mailbox_address, PermissionError, PermissionGate};
